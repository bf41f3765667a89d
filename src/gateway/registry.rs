// ── Gateway: Bot Identity Registry ──────────────────────────────────────────
// Owns the map of registered `BotIdentity`s. Mutated only on config reload
// under a single writer lock; readers (outbound sends, HTTP handlers) take a
// read lock (spec.md §5 "Shared-resource policy").

use crate::atoms::error::FleetError;
use crate::gateway::identity::BotIdentity;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

pub struct GatewayRegistry {
    identities: RwLock<HashMap<String, Arc<BotIdentity>>>,
    stop_signals: RwLock<HashMap<String, Arc<Notify>>>,
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self { identities: RwLock::new(HashMap::new()), stop_signals: RwLock::new(HashMap::new()) }
    }

    /// Registers a bot identity and spawns its connection loop. A `BotIdentity`
    /// is created when the first spec referencing its token is loaded
    /// (spec.md §3 Lifecycles).
    pub async fn register(&self, id: impl Into<String>, token: String) -> Arc<BotIdentity> {
        let id = id.into();
        if let Some(existing) = self.identities.read().await.get(&id) {
            return Arc::clone(existing);
        }
        let identity = BotIdentity::new(id.clone(), token);
        let stop = Arc::new(Notify::new());
        self.identities.write().await.insert(id.clone(), Arc::clone(&identity));
        self.stop_signals.write().await.insert(id.clone(), Arc::clone(&stop));
        tokio::spawn(Arc::clone(&identity).run(stop));
        identity
    }

    /// Destroys a bot identity — closes its connection (spec.md §3
    /// Lifecycles: "destroyed when the last such spec is removed").
    pub async fn deregister(&self, id: &str) {
        if let Some(stop) = self.stop_signals.write().await.remove(id) {
            stop.notify_waiters();
        }
        self.identities.write().await.remove(id);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<BotIdentity>> {
        self.identities.read().await.get(id).cloned()
    }

    pub async fn require(&self, id: &str) -> Result<Arc<BotIdentity>, FleetError> {
        self.get(id).await.ok_or_else(|| FleetError::UnknownBot(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Arc<BotIdentity>> {
        self.identities.read().await.values().cloned().collect()
    }
}
