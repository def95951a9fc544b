//! Shared test infrastructure for index and broadcast integration tests.

// Shared across test binaries; not every helper is used by each.
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use routebeacon::broadcast::{Delta, PeerWriter};
use routebeacon::index::{DeltaSink, PublishItem};
use routebeacon::Error;

/// Delta sink that records everything the index emits.
pub struct RecordingSink {
    deltas: Mutex<Vec<Delta>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deltas: Mutex::new(Vec::new()),
        })
    }

    /// Drain and return every recorded delta.
    pub fn take(&self) -> Vec<Delta> {
        std::mem::take(&mut *self.deltas.lock())
    }
}

#[async_trait]
impl DeltaSink for RecordingSink {
    async fn publish_delta(&self, delta: Delta) {
        self.deltas.lock().push(delta);
    }
}

/// A fake peer: records delivered deltas and can be switched into a failing
/// mode to exercise the hub's error handling.
#[derive(Clone, Default)]
pub struct PeerRecorder {
    deltas: Arc<Mutex<Vec<Delta>>>,
    fail: Arc<AtomicBool>,
}

struct RecorderWriter(PeerRecorder);

#[async_trait]
impl PeerWriter for RecorderWriter {
    async fn send(&mut self, delta: &Delta) -> Result<(), Error> {
        if self.0.fail.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::other("simulated peer failure")));
        }
        self.0.deltas.lock().push(delta.clone());
        Ok(())
    }
}

impl PeerRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer backed by this recorder, for handing to the hub.
    pub fn writer(&self) -> Box<dyn PeerWriter> {
        Box::new(RecorderWriter(self.clone()))
    }

    /// Make every subsequent delivery fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::Release);
    }

    /// Deltas delivered so far, in order.
    pub fn deltas(&self) -> Vec<Delta> {
        self.deltas.lock().clone()
    }

    /// The address set this peer holds after applying every delivered delta
    /// in order, starting from empty.
    pub fn view(&self) -> Vec<Ipv4Addr> {
        let mut held = BTreeSet::new();
        for delta in self.deltas.lock().iter() {
            for address in &delta.to_remove {
                held.remove(address);
            }
            for address in &delta.to_add {
                held.insert(*address);
            }
        }
        held.into_iter().collect()
    }
}

pub fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn addrs(list: &[&str]) -> Vec<Ipv4Addr> {
    list.iter().map(|s| addr(s)).collect()
}

/// Build a publish item from (address, expiry) pairs.
pub fn publish_item(
    domain: &str,
    expire: DateTime<Utc>,
    record: &[(&str, DateTime<Utc>)],
) -> PublishItem {
    let record: HashMap<Ipv4Addr, DateTime<Utc>> =
        record.iter().map(|(a, t)| (addr(a), *t)).collect();
    PublishItem {
        domain: domain.to_string(),
        expire,
        record,
    }
}

/// Assert the delta soundness contract: both lists sorted ascending,
/// duplicate-free and disjoint.
pub fn assert_sound(delta: &Delta) {
    let mut sorted = delta.to_add.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(delta.to_add, sorted, "to_add must be sorted and unique");

    let mut sorted = delta.to_remove.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(delta.to_remove, sorted, "to_remove must be sorted and unique");

    let adds: BTreeSet<_> = delta.to_add.iter().collect();
    assert!(
        delta.to_remove.iter().all(|a| !adds.contains(a)),
        "to_add and to_remove must be disjoint"
    );
}
