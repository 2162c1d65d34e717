// crates/trimatrix-consensus/src/lib.rs
//
// trimatrix-consensus: heuristic acceptance scoring for triads.
//
// Scoring is a pure function of a triad, its spatial neighbors, and whether
// the acting validator is registered. The store calls into this crate from
// its validation path; nothing here touches persistence or the network.

pub mod scoring;

pub use scoring::{score_triad, spatial_neighbors};
