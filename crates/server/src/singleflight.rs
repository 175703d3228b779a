//! Coalescing of identical in-flight transforms.
//!
//! The first request to miss the cache for a key becomes the leader and
//! runs the transform. Requests for the same key arriving while it runs
//! subscribe to the leader's outcome instead of fetching and encoding
//! again. If the leader goes away without finishing, its followers see a
//! closed channel and run the transform themselves.

use crate::error::ApiError;
use crate::metrics::COALESCED_REQUESTS;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use prism_core::CacheKey;
use std::sync::Arc;
use tokio::sync::broadcast;

/// What a leader hands to its followers.
#[derive(Clone, Debug)]
pub enum Flight {
    /// Finished bytes.
    Ready(Bytes),
    /// An encode is running; serve this placeholder.
    Placeholder(Bytes),
}

pub type FlightOutcome = Result<Flight, Arc<ApiError>>;

/// Tracks in-flight transforms by cache key.
#[derive(Debug, Default)]
pub struct SingleFlight {
    in_flight: DashMap<CacheKey, broadcast::Sender<FlightOutcome>>,
}

/// Role of a request after [`SingleFlight::join`].
pub enum Join {
    Leader(FlightGuard),
    Follower(broadcast::Receiver<FlightOutcome>),
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(self: &Arc<Self>, key: &CacheKey) -> Join {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                COALESCED_REQUESTS.inc();
                tracing::debug!(key = %key, "Coalescing with in-flight transform");
                Join::Follower(entry.get().subscribe())
            }
            Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                Join::Leader(FlightGuard {
                    flights: self.clone(),
                    key: key.clone(),
                    tx,
                })
            }
        }
    }

    /// Keys currently being produced.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Held by the leader. Dropping it without [`FlightGuard::complete`]
/// releases followers with a closed channel.
pub struct FlightGuard {
    flights: Arc<SingleFlight>,
    key: CacheKey,
    tx: broadcast::Sender<FlightOutcome>,
}

impl FlightGuard {
    /// Publish the outcome to every follower and retire the key.
    pub fn complete(self, outcome: FlightOutcome) {
        self.retire();
        let waiters = self.tx.receiver_count();
        // No receivers is fine: nobody coalesced.
        let _ = self.tx.send(outcome);
        if waiters > 0 {
            tracing::debug!(key = %self.key, waiters, "Released coalesced requests");
        }
    }

    /// Remove this guard's entry. A newer leader may already own the key.
    fn retire(&self) {
        self.flights
            .in_flight
            .remove_if(&self.key, |_, tx| tx.same_channel(&self.tx));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.retire();
    }
}
