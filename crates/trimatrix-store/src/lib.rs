// crates/trimatrix-store/src/lib.rs
//
// trimatrix-store: Storage layer for the Trimatrix node.
//
// Provides the RocksDB key-value wrapper and the spatial triad store:
// placement assignment, the validation state machine with per-triad-id
// locking, the validator registry, and the bounded event channel the
// network layer subscribes to.

pub mod matrix;
pub mod rocks;

pub use matrix::MatrixStore;
pub use rocks::MatrixDb;
