//! Per-key request coalescing
//!
//! The first caller for a key starts the operation and parks a shared future
//! in the in-flight map; callers arriving while it runs attach to the same
//! future and receive a clone of its result, success or error. Nothing holds
//! a lock across the await.
//!
//! The shared future is driven by whichever waiters are polling it. If one
//! waiter is dropped the others keep it going; if all are dropped the future
//! stays parked and the next caller for that key resumes it.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::errors::Result;

type Flight<V> = Shared<BoxFuture<'static, Result<V>>>;

pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    in_flight: DashMap<K, Flight<V>>,
    started: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self {
            in_flight: DashMap::new(),
            started: AtomicU64::new(0),
        }
    }
}

impl<K, V> std::fmt::Debug for SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.in_flight.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key`, or join the flight already running for it
    ///
    /// `make` is only invoked by the caller that starts a new flight.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let flight = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                self.started.fetch_add(1, Ordering::Relaxed);
                let flight = make().boxed().shared();
                entry.insert(flight.clone());
                flight
            }
        };

        let result = flight.clone().await;

        // Only retire our own flight; a newer one may already be parked
        self.in_flight
            .remove_if(&key, |_, parked| parked.ptr_eq(&flight));

        result
    }

    /// Whether a flight is currently parked for `key`
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of flights started so far (joins are not counted)
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}
