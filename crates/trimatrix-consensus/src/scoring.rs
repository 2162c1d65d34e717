// crates/trimatrix-consensus/src/scoring.rs
//
// Consensus scoring for triads.
//
// The score combines two terms:
//   1. Base term: a fixed contribution when the acting validator is a
//      member of the registry, zero otherwise.
//   2. Neighbor term: average proximity of spatial neighbors within the
//      complexity radius, weighted down for neighbors that are themselves
//      not yet validated.

use trimatrix_core::Triad;

/// Contribution of a registered validator.
pub const BASE_VALIDATOR_TERM: f64 = 0.7;

/// Weight of the averaged neighbor proximity term.
pub const NEIGHBOR_TERM_WEIGHT: f64 = 0.3;

/// Multiplier applied to the proximity of a not-yet-validated neighbor.
pub const UNVALIDATED_NEIGHBOR_FACTOR: f64 = 0.5;

/// Enumerate the spatial neighbors of `subject` among `candidates`.
///
/// A neighbor is any *other* triad whose Euclidean distance to the subject's
/// position is strictly positive and at most `complexity`. A distinct triad
/// sitting at the exact same position has distance zero and is excluded.
pub fn spatial_neighbors<'a, I>(subject: &Triad, candidates: I, complexity: u32) -> Vec<&'a Triad>
where
    I: IntoIterator<Item = &'a Triad>,
{
    let radius = f64::from(complexity);
    candidates
        .into_iter()
        .filter(|other| {
            if other.id == subject.id {
                return false;
            }
            let d = subject.position.distance(&other.position);
            d > 0.0 && d <= radius
        })
        .collect()
}

/// Score a triad in [0, 1].
///
/// With no neighbors the neighbor term is zero and the score equals the
/// base term. The final value is clamped to [0, 1].
pub fn score_triad(
    subject: &Triad,
    neighbors: &[&Triad],
    validator_registered: bool,
    complexity: u32,
) -> f64 {
    let base = if validator_registered {
        BASE_VALIDATOR_TERM
    } else {
        0.0
    };

    let neighbor_term = if neighbors.is_empty() {
        0.0
    } else {
        let radius = f64::from(complexity);
        let sum: f64 = neighbors
            .iter()
            .map(|n| {
                let d = subject.position.distance(&n.position);
                let proximity = (1.0 - d / radius).max(0.0);
                if n.validated {
                    proximity
                } else {
                    proximity * UNVALIDATED_NEIGHBOR_FACTOR
                }
            })
            .sum();
        (sum / neighbors.len() as f64) * NEIGHBOR_TERM_WEIGHT
    };

    (base + neighbor_term).clamp(0.0, 1.0)
}
