// crates/trimatrix-core/src/events.rs
//
// Domain events emitted by the store and consumed by the network layer
// through an explicit bounded-channel subscription.

use crate::triad::Triad;

/// An event emitted after a store mutation has been persisted.
///
/// Delivery is best-effort: the store never blocks a mutation on a slow or
/// absent subscriber.
#[derive(Debug, Clone)]
pub enum MatrixEvent {
    /// A triad was created locally.
    TriadCreated(Triad),
    /// A validation call was evaluated locally. The carried record reflects
    /// the post-evaluation state; `validated` indicates whether the triad
    /// crossed the consensus threshold.
    TriadValidated(Triad),
}

impl MatrixEvent {
    /// The triad carried by this event.
    pub fn triad(&self) -> &Triad {
        match self {
            MatrixEvent::TriadCreated(t) => t,
            MatrixEvent::TriadValidated(t) => t,
        }
    }
}
