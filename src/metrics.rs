//! Metrics instrumentation for routebeacon.
//!
//! All metrics are prefixed with `routebeacon.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

use crate::broadcast::UpdateCause;

/// Record an upstream DNS query.
pub fn record_query(server: &str, result: QueryResult, duration: std::time::Duration) {
    let result_str = match result {
        QueryResult::Success => "success",
        QueryResult::Timeout => "timeout",
        QueryResult::Error => "error",
    };

    counter!("routebeacon.resolver.query.count", "server" => server.to_string(), "result" => result_str)
        .increment(1);
    histogram!("routebeacon.resolver.query.duration.seconds", "server" => server.to_string())
        .record(duration.as_secs_f64());
}

/// Outcome of a single upstream query for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// The server answered.
    Success,
    /// The query timed out (soft failure).
    Timeout,
    /// The query failed with an error.
    Error,
}

/// Record one resolver tick.
pub fn record_resolve_tick(domains: usize, duration: std::time::Duration) {
    counter!("routebeacon.resolver.tick.count").increment(1);
    histogram!("routebeacon.resolver.tick.domains").record(domains as f64);
    histogram!("routebeacon.resolver.tick.duration.seconds").record(duration.as_secs_f64());
}

/// Record a delta accepted by the broadcast hub.
pub fn record_broadcast(cause: UpdateCause, added: usize, removed: usize) {
    counter!("routebeacon.broadcast.delta.count", "cause" => cause.as_str()).increment(1);
    counter!("routebeacon.broadcast.address.added").increment(added as u64);
    counter!("routebeacon.broadcast.address.removed").increment(removed as u64);
}

/// Record a peer registry change.
pub fn record_peer_event(event: PeerEvent) {
    let event_str = match event {
        PeerEvent::Attached => "attached",
        PeerEvent::Replaced => "replaced",
        PeerEvent::Detached => "detached",
    };

    counter!("routebeacon.broadcast.peer.event.count", "event" => event_str).increment(1);
}

/// Peer registry change kinds.
#[derive(Debug, Clone, Copy)]
pub enum PeerEvent {
    /// A new peer writer was registered.
    Attached,
    /// An existing peer's writer was replaced.
    Replaced,
    /// A peer writer was removed.
    Detached,
}

/// Record a failed write to a peer.
pub fn record_peer_write_error(peer: &str) {
    counter!("routebeacon.broadcast.peer.write_error.count", "peer" => peer.to_string())
        .increment(1);
}

/// Record UPDATE frames written to a peer (End-of-RIB included).
pub fn record_update_frames(peer: &str, frames: usize) {
    counter!("routebeacon.bgp.update_frames.count", "peer" => peer.to_string())
        .increment(frames as u64);
}

/// Record index sizes (call periodically or on change).
pub fn record_state_counts(domains: usize, addresses: usize) {
    gauge!("routebeacon.state.domains.count").set(domains as f64);
    gauge!("routebeacon.state.addresses.count").set(addresses as f64);
}

/// Record the number of registered peers.
pub fn record_peer_count(peers: usize) {
    gauge!("routebeacon.broadcast.peers.count").set(peers as f64);
}

/// Record the size of the advertised set after a delta was applied.
pub fn record_advertised(count: usize) {
    gauge!("routebeacon.broadcast.advertised.count").set(count as f64);
}

/// Record a refcount invariant violation detected by the index self-check.
pub fn record_invariant_violation() {
    counter!("routebeacon.index.invariant_violation.count").increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
