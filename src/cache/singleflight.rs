//! In-process single-flight registry.
//!
//! Concurrent callers asking for the same key share one in-flight future; the
//! first caller's computation runs once and every waiter receives a clone of
//! its output. The shared future is driven by whichever waiter polls it, so a
//! cancelled caller does not cancel the computation for the others.

use std::any::{Any, TypeId};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, trace};

type FlightOutput = Arc<dyn Any + Send + Sync>;
type Computation = BoxFuture<'static, FlightOutput>;
type PanicSlot = Arc<Mutex<Option<Box<dyn Any + Send>>>>;
/// Resolves to `None` when the computation panicked or was never handed over.
type Flight = Shared<BoxFuture<'static, Option<FlightOutput>>>;

#[derive(Clone)]
struct Slot {
    id: u64,
    output_type: TypeId,
    flight: Flight,
}

/// Registry of in-flight computations keyed by string.
#[derive(Clone, Default)]
pub struct SingleFlight {
    slots: Arc<DashMap<String, Slot>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for SingleFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.slots.len())
            .finish()
    }
}

/// Identifies one registered flight.
///
/// The leader uses it to check that its slot has not been retired (by an
/// invalidation) before writing its result anywhere.
#[derive(Debug, Clone)]
pub struct FlightTicket {
    registry: Option<SingleFlight>,
    key: String,
    id: u64,
}

impl FlightTicket {
    /// Whether this flight is still the registered one for its key.
    pub fn is_current(&self) -> bool {
        match &self.registry {
            Some(registry) => registry.holds(&self.key, self.id),
            // Untracked flights never conflict with anyone.
            None => true,
        }
    }

    fn untracked(key: &str) -> Self {
        Self {
            registry: None,
            key: key.to_string(),
            id: 0,
        }
    }
}

enum Join<F> {
    Existing(Flight, F),
    Started {
        flight: Flight,
        handoff: oneshot::Sender<Computation>,
        panicked: PanicSlot,
        id: u64,
        make: F,
    },
    Untracked(F),
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, or start one with `make` if none is running.
    ///
    /// `make` is only invoked by the caller that starts the flight, and never
    /// while the registry's shard lock is held. If the computation panics, the
    /// panic resumes in the starting caller, the slot is released and joined
    /// callers run their own `make`.
    pub async fn run<T, F, Fut>(&self, key: &str, make: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(FlightTicket) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let output_type = TypeId::of::<T>();

        // The entry guard must be released before `make` runs or anything awaits.
        let join = match self.slots.entry(key.to_string()) {
            Entry::Occupied(slot) => {
                if slot.get().output_type == output_type {
                    Join::Existing(slot.get().flight.clone(), make)
                } else {
                    Join::Untracked(make)
                }
            }
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (handoff, computation) = oneshot::channel();
                let panicked = PanicSlot::default();
                let flight = self.flight(key, id, computation, Arc::clone(&panicked));
                vacant.insert(Slot {
                    id,
                    output_type,
                    flight: flight.clone(),
                });
                Join::Started {
                    flight,
                    handoff,
                    panicked,
                    id,
                    make,
                }
            }
        };

        match join {
            Join::Existing(flight, make) => {
                trace!(key = %key, "Joining in-flight computation");
                match flight.await {
                    Some(output) => downcast(output),
                    None => {
                        debug!(key = %key, "In-flight computation failed, computing untracked");
                        make(FlightTicket::untracked(key)).await
                    }
                }
            }
            Join::Started {
                flight,
                handoff,
                panicked,
                id,
                make,
            } => {
                trace!(key = %key, "Started computation");
                let ticket = FlightTicket {
                    registry: Some(self.clone()),
                    key: key.to_string(),
                    id,
                };
                let computation = make(ticket);
                // The receiver lives inside `flight`, which is still held here.
                let _ = handoff.send(async move { Arc::new(computation.await) as FlightOutput }.boxed());

                if let Some(output) = flight.await {
                    return downcast(output);
                }
                let payload = panicked.lock().take();
                match payload {
                    Some(payload) => panic::resume_unwind(payload),
                    None => unreachable!("leader hands over its computation before awaiting"),
                }
            }
            Join::Untracked(make) => {
                debug!(key = %key, "In-flight computation has a different type, running untracked");
                make(FlightTicket::untracked(key)).await
            }
        }
    }

    /// Build the shared future for slot `id`. The slot is released on every
    /// exit path. A panic in the computation is parked in `panicked` rather
    /// than unwinding through the shared future, which would poison it.
    fn flight(
        &self,
        key: &str,
        id: u64,
        computation: oneshot::Receiver<Computation>,
        panicked: PanicSlot,
    ) -> Flight {
        let registry = self.clone();
        let key = key.to_string();

        async move {
            let output = match computation.await {
                Ok(computation) => match AssertUnwindSafe(computation).catch_unwind().await {
                    Ok(output) => Some(output),
                    Err(payload) => {
                        *panicked.lock() = Some(payload);
                        None
                    }
                },
                Err(oneshot::Canceled) => None,
            };
            registry.release(&key, id);
            output
        }
        .boxed()
        .shared()
    }

    /// Retire the slot for `key`. A running computation still completes for
    /// its waiters, but its ticket is no longer current.
    pub fn forget(&self, key: &str) -> bool {
        self.slots.remove(key).is_some()
    }

    /// Retire every slot whose key starts with `prefix`.
    pub fn forget_prefix(&self, prefix: &str) -> usize {
        let before = self.slots.len();
        self.slots.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.slots.len())
    }

    /// Number of computations currently registered.
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    fn holds(&self, key: &str, id: u64) -> bool {
        self.slots.get(key).is_some_and(|slot| slot.id == id)
    }

    fn release(&self, key: &str, id: u64) {
        self.slots.remove_if(key, |_, slot| slot.id == id);
    }
}

fn downcast<T: Clone + 'static>(output: FlightOutput) -> T {
    match output.downcast_ref::<T>() {
        Some(value) => value.clone(),
        None => unreachable!("flight output type is checked before joining"),
    }
}
