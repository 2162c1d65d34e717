// crates/trimatrix-core/src/lib.rs
//
// trimatrix-core: Core types, traits, and error taxonomy for the Trimatrix
// node.
//
// This is the leaf crate that all other crates in the workspace depend on.
// It defines the canonical data structures, the error taxonomy, domain
// events, and the trait interfaces used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod metadata;
pub mod traits;
pub mod triad;

// Re-export key types for ergonomic access from downstream crates.
// Usage: `use trimatrix_core::Triad;`

pub use config::{
    MatrixConfig, DEFAULT_COMPLEXITY, DEFAULT_CONSENSUS_THRESHOLD, DEFAULT_DIMENSIONS,
    DEFAULT_MAX_PEERS,
};
pub use error::MatrixError;
pub use events::MatrixEvent;
pub use metadata::{MatrixMetadata, MatrixSnapshot};
pub use traits::{LedgerWriter, TriadStore};
pub use triad::{validate_identity, validate_triad_data, Position, Triad};
