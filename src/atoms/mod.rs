// ── Atoms Layer ────────────────────────────────────────────────────────────
// Pure constants, errors, and types — zero side effects, no I/O.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from gateway/, conversation/, container/,
// supervisor/, memory/, providers/, or config/.

pub mod constants;
pub mod container_types;
pub mod error;
pub mod traits;
pub mod types;
