// crates/trimatrix-core/src/traits.rs

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::MatrixError;
use crate::metadata::{MatrixMetadata, MatrixSnapshot};
use crate::triad::Triad;

/// Trait for the spatial triad store.
///
/// Implemented by trimatrix-store (RocksDB backend). Both local callers and
/// the peer-message handler go through these entry points; there is no
/// direct mutation path around them.
#[async_trait]
pub trait TriadStore: Send + Sync {
    /// Create a triad from caller-supplied data, assign a placement, persist
    /// it atomically with the updated counts, and emit a created event.
    async fn create_triad(&self, data: Value, creator: &str) -> Result<Triad, MatrixError>;

    /// Evaluate a validation attempt against the consensus threshold.
    ///
    /// A no-op on already-validated triads. Serialized per triad id.
    async fn validate_triad(&self, id: Uuid, validator: &str) -> Result<Triad, MatrixError>;

    /// Look up a triad by id.
    async fn get_triad(&self, id: Uuid) -> Result<Triad, MatrixError>;

    /// Current metadata record (config, validator set, counts).
    async fn metadata(&self) -> Result<MatrixMetadata, MatrixError>;

    /// Immutable snapshot of metadata plus the full triad list.
    async fn matrix_state(&self) -> Result<MatrixSnapshot, MatrixError>;

    /// Register a validator id. Idempotent; returns whether it was new.
    async fn add_validator(&self, id: &str) -> Result<bool, MatrixError>;

    /// Apply a triad received from a peer. Upsert by id with local-wins
    /// semantics: returns `false` without touching state when the id is
    /// already present.
    async fn apply_remote_triad(&self, triad: Triad) -> Result<bool, MatrixError>;

    /// Apply a validation outcome received from a peer. Last-writer-wins on
    /// score and attempts; the `validated` flag merges monotonically and
    /// never reverts. Returns whether local state changed.
    async fn apply_remote_validation(&self, triad: Triad) -> Result<bool, MatrixError>;
}

/// Contract of the external ledger collaborator consumed by the sync
/// protocol. The core forwards batches; it never interprets them.
#[async_trait]
pub trait LedgerWriter: Send + Sync {
    /// Whether the ledger is currently accepting new writers.
    fn is_open_for_new_writers(&self) -> bool;

    /// Apply a batch of ledger entries.
    async fn update_ledger(&self, batch: Vec<Value>) -> Result<(), MatrixError>;
}
