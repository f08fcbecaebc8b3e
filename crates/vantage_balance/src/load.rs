//! Rolling load meters.
//!
//! Every logical node owns a busy meter (time-windowed sum of distance
//! computations) and a single meter (mean cost of the last N operations).
//! The host owns one meter of each kind, *bound* to the node meters: an
//! addition to a node meter lands in the host meter in the same call, so the
//! host value is the sum of its nodes' values without a second write path.
//!
//! A meter that has not yet seen enough time (busy) or enough samples
//! (single) reports `None`.

#[cfg(test)]
#[path = "load_test.rs"]
mod load_test;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vantage_dispatch::{NetworkEndpoint, NodeId, PeerRecord};

use crate::clock::Clock;
use crate::gossip::LoadReading;
use crate::node::StorageEngine;

#[derive(Debug)]
struct BusyCore {
    window: Duration,
    created: Instant,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl BusyCore {
    fn prune(&mut self, now: Instant) {
        while let Some(&(at, delta)) = self.samples.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.total -= delta;
        }
    }

    fn add(&mut self, now: Instant, delta: u64) {
        self.samples.push_back((now, delta));
        self.total += delta;
        self.prune(now);
    }

    fn value(&mut self, now: Instant) -> Option<u64> {
        self.prune(now);
        if now.duration_since(self.created) < self.window {
            return None;
        }
        Some(self.total)
    }

    fn reset(&mut self, now: Instant) {
        self.samples.clear();
        self.total = 0;
        self.created = now;
    }
}

/// Time-windowed sum of load increments. Unknown until one full window has
/// elapsed since creation (or since the last reset).
pub struct BusyMeter {
    clock: Arc<dyn Clock>,
    core: Arc<Mutex<BusyCore>>,
    bound: Mutex<Vec<Arc<Mutex<BusyCore>>>>,
}

impl BusyMeter {
    /// Creates a meter over `window`.
    pub fn new(clock: Arc<dyn Clock>, window: Duration) -> Self {
        let created = clock.now();
        Self {
            clock,
            core: Arc::new(Mutex::new(BusyCore {
                window,
                created,
                samples: VecDeque::new(),
                total: 0,
            })),
            bound: Mutex::new(Vec::new()),
        }
    }

    /// Adds `delta` to this meter and to every bound meter.
    pub fn add(&self, delta: u64) {
        let now = self.clock.now();
        self.core.lock().unwrap().add(now, delta);
        for sink in self.bound.lock().unwrap().iter() {
            sink.lock().unwrap().add(now, delta);
        }
    }

    /// Windowed sum, or `None` while the window has not yet filled.
    pub fn value(&self) -> Option<u64> {
        self.core.lock().unwrap().value(self.clock.now())
    }

    /// Drops all samples and restarts the window; the meter reports `None`
    /// again until a full window has elapsed.
    pub fn reset(&self) {
        self.core.lock().unwrap().reset(self.clock.now());
    }

    /// Couples `sink` to this meter: future additions land in both.
    pub fn bind(&self, sink: &BusyMeter) {
        self.bound.lock().unwrap().push(sink.core.clone());
    }

    /// Removes the coupling to `sink` established by [`bind`](Self::bind).
    pub fn unbind(&self, sink: &BusyMeter) {
        self.bound.lock().unwrap().retain(|core| !Arc::ptr_eq(core, &sink.core));
    }
}

#[derive(Debug)]
struct SingleCore {
    cap: usize,
    samples: VecDeque<u64>,
}

impl SingleCore {
    fn add(&mut self, sample: u64) {
        self.samples.push_back(sample);
        while self.samples.len() > self.cap {
            self.samples.pop_front();
        }
    }

    fn value(&self) -> Option<u64> {
        if self.samples.len() < self.cap {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / u64::try_from(self.samples.len()).expect("length fits in u64"))
    }
}

/// Mean of the last N samples. Unknown until N samples were recorded.
pub struct SingleMeter {
    core: Arc<Mutex<SingleCore>>,
    bound: Mutex<Vec<Arc<Mutex<SingleCore>>>>,
}

impl SingleMeter {
    /// Creates a meter averaging the last `cap` samples.
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0, "single meter needs at least one sample");
        Self {
            core: Arc::new(Mutex::new(SingleCore { cap, samples: VecDeque::new() })),
            bound: Mutex::new(Vec::new()),
        }
    }

    /// Records one sample here and in every bound meter.
    pub fn add(&self, sample: u64) {
        self.core.lock().unwrap().add(sample);
        for sink in self.bound.lock().unwrap().iter() {
            sink.lock().unwrap().add(sample);
        }
    }

    /// Mean of the last N samples, or `None` until N were seen.
    pub fn value(&self) -> Option<u64> {
        self.core.lock().unwrap().value()
    }

    /// Forgets all samples; the meter reports `None` again.
    pub fn reset(&self) {
        self.core.lock().unwrap().samples.clear();
    }

    /// Couples `sink` to this meter: future samples land in both.
    pub fn bind(&self, sink: &SingleMeter) {
        self.bound.lock().unwrap().push(sink.core.clone());
    }

    /// Removes the coupling to `sink` established by [`bind`](Self::bind).
    pub fn unbind(&self, sink: &SingleMeter) {
        self.bound.lock().unwrap().retain(|core| !Arc::ptr_eq(core, &sink.core));
    }
}

/// Host-level load view: the host meters every node meter is bound to, plus
/// the engines whose object counts make up the host's data load.
///
/// Shared by the host runtime and the gossip exchange, so neither needs a
/// back-pointer to the other.
pub struct HostLoadTracker {
    endpoint: NetworkEndpoint,
    /// Host busy meter; node busy meters bind to it.
    pub busy: BusyMeter,
    /// Host single meter; node single meters bind to it.
    pub single: SingleMeter,
    engines: Mutex<HashMap<NodeId, Arc<dyn StorageEngine>>>,
    freshness: AtomicU64,
}

impl HostLoadTracker {
    /// Creates the tracker with empty meters.
    pub fn new(
        endpoint: NetworkEndpoint,
        clock: Arc<dyn Clock>,
        busy_window: Duration,
        single_samples: usize,
    ) -> Self {
        Self {
            endpoint,
            busy: BusyMeter::new(clock, busy_window),
            single: SingleMeter::new(single_samples),
            engines: Mutex::new(HashMap::new()),
            freshness: AtomicU64::new(0),
        }
    }

    /// Starts counting `engine`'s objects towards the host data load.
    pub fn track(&self, id: NodeId, engine: Arc<dyn StorageEngine>) {
        self.engines.lock().unwrap().insert(id, engine);
    }

    /// Stops counting the engine registered under `id`.
    pub fn untrack(&self, id: NodeId) {
        self.engines.lock().unwrap().remove(&id);
    }

    /// Object count over all tracked engines.
    pub fn data(&self) -> u64 {
        self.engines.lock().unwrap().values().map(|engine| engine.object_count()).sum()
    }

    /// Current host load reading.
    pub fn reading(&self) -> LoadReading {
        LoadReading { busy: self.busy.value(), single: self.single.value(), data: self.data() }
    }

    /// A fresh directory record describing this host. Each call mints a new
    /// freshness timestamp, so the record replaces any older one.
    pub fn own_record(&self) -> PeerRecord {
        let reading = self.reading();
        PeerRecord {
            endpoint: self.endpoint,
            busy: reading.busy,
            single: reading.single,
            data: reading.data,
            timestamp: self.freshness.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    /// Resets both host meters.
    pub fn reset(&self) {
        self.busy.reset();
        self.single.reset();
    }
}
