// ── Config: Secret Resolution ────────────────────────────────────────────────
// Single boot-time resolution of every secret reference into an immutable
// map, addressing the "implicit global state in scripts" pattern flagged in
// spec.md §9: no module reads an environment variable directly after boot.

use crate::atoms::error::{FleetError, FleetResult};
use std::collections::HashMap;
use zeroize::Zeroizing;

/// Name of an environment variable holding a secret, as it appears in
/// `secrets_refs` or an `AgentSpec.discord_token_ref`.
pub type SecretRef = String;

/// Resolves every secret reference the configuration names, once, at
/// startup. Values are held zeroized and passed by value into whatever
/// consumes them (an LM provider client, a Discord bot connection); they are
/// never logged and never re-read from the environment afterward.
pub struct SecretResolver {
    values: HashMap<SecretRef, Zeroizing<String>>,
}

impl SecretResolver {
    /// Resolves `refs` (environment variable names) from the process
    /// environment. Missing any referenced secret is a fatal startup error
    /// per spec.md §6.
    pub fn resolve(refs: &[SecretRef]) -> FleetResult<Self> {
        let mut values = HashMap::with_capacity(refs.len());
        for r in refs {
            let v = std::env::var(r)
                .map_err(|_| FleetError::config(format!("missing required secret env var `{r}`")))?;
            values.insert(r.clone(), Zeroizing::new(v));
        }
        Ok(Self { values })
    }

    /// Also resolves any `discord_token_ref` values named by agent specs
    /// that were not already listed in `secrets_refs`.
    pub fn resolve_with_agent_refs(
        refs: &[SecretRef],
        agent_refs: impl Iterator<Item = SecretRef>,
    ) -> FleetResult<Self> {
        let mut all: Vec<SecretRef> = refs.to_vec();
        for r in agent_refs {
            if !all.contains(&r) {
                all.push(r);
            }
        }
        Self::resolve(&all)
    }

    pub fn get(&self, r: &str) -> FleetResult<&Zeroizing<String>> {
        self.values.get(r).ok_or_else(|| FleetError::config(format!("secret `{r}` was not resolved at startup")))
    }

    /// Detects the "class of bug explicitly documented as catastrophic"
    /// (spec.md §4.5): two distinct agent specs resolving to the same
    /// Discord token. Returns the spec_id pairs that collide.
    pub fn detect_duplicate_tokens<'a>(
        &self,
        agent_token_refs: impl Iterator<Item = (&'a str, &'a str)>,
    ) -> FleetResult<()> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        for (spec_id, token_ref) in agent_token_refs {
            let token = self.get(token_ref)?;
            if let Some(other) = seen.insert(token.as_str().to_string(), spec_id) {
                return Err(FleetError::DuplicateBotToken(format!(
                    "agents `{other}` and `{spec_id}` resolve to the same Discord token"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_secret_is_fatal() {
        let refs = vec!["AGENTFLEET_TEST_DOES_NOT_EXIST_XYZ".to_string()];
        assert!(SecretResolver::resolve(&refs).is_err());
    }

    #[test]
    fn resolves_present_env_var() {
        std::env::set_var("AGENTFLEET_TEST_SECRET_A", "shh");
        let resolver = SecretResolver::resolve(&["AGENTFLEET_TEST_SECRET_A".to_string()]).unwrap();
        assert_eq!(resolver.get("AGENTFLEET_TEST_SECRET_A").unwrap().as_str(), "shh");
        std::env::remove_var("AGENTFLEET_TEST_SECRET_A");
    }

    #[test]
    fn detects_duplicate_tokens() {
        std::env::set_var("AGENTFLEET_TEST_DUP", "same-token");
        let resolver = SecretResolver::resolve(&["AGENTFLEET_TEST_DUP".to_string()]).unwrap();
        let pairs = vec![("a1", "AGENTFLEET_TEST_DUP"), ("a2", "AGENTFLEET_TEST_DUP")];
        let result = resolver.detect_duplicate_tokens(pairs.into_iter());
        assert!(matches!(result, Err(FleetError::DuplicateBotToken(_))));
        std::env::remove_var("AGENTFLEET_TEST_DUP");
    }
}
