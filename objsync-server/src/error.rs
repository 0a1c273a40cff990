//! Server-side error types.

/// Errors surfaced by the dispatch service.
///
/// Per-recipient delivery failures and revision conflicts are handled in
/// place (prune, conflict reply) and never reach this type; only
/// persistence faults and a failing default-state provider do.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] objsync_core::StoreError),

    #[error("default state provider failed: {0}")]
    DefaultState(String),
}
