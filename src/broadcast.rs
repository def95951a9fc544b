//! Broadcast hub: the single writer that owns the advertised set.
//!
//! The hub task is the only place the canonical advertised set and the peer
//! registry are touched. Index mutations hand it deltas through a bounded
//! channel; the session layer hands it peer attach/detach events. Because one
//! task consumes both channels, every peer observes the attach-time snapshot
//! and all later deltas in a single, consistent order.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Error;
use crate::index::DeltaSink;
use crate::metrics::{self, PeerEvent};

/// Capacity of the action and delta channels.
const CHANNEL_CAPACITY: usize = 16;

/// What triggered a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCause {
    /// An operator deleted a domain.
    ApiDelete,
    /// An operator renamed a domain.
    ApiUpdate,
    /// The resolver published fresh answers.
    ResolverPublish,
    /// Attach-time replay of the advertised set to a new peer.
    Snapshot,
}

impl UpdateCause {
    /// Stable label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiDelete => "api-delete",
            Self::ApiUpdate => "api-update",
            Self::ResolverPublish => "resolver-publish",
            Self::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for UpdateCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An incremental change to the advertised set.
///
/// Both lists are sorted ascending and duplicate-free once
/// [`Delta::normalize`] has run; the index normalizes every delta before
/// emitting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// What triggered this delta.
    pub cause: UpdateCause,
    /// Addresses that became reachable.
    pub to_add: Vec<Ipv4Addr>,
    /// Addresses with no remaining owner.
    pub to_remove: Vec<Ipv4Addr>,
}

impl Delta {
    /// An empty delta for the given cause.
    pub fn new(cause: UpdateCause) -> Self {
        Self {
            cause,
            to_add: Vec::new(),
            to_remove: Vec::new(),
        }
    }

    /// True when there is nothing to announce and nothing to withdraw.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Sort both lists ascending and drop duplicates, giving peers a
    /// deterministic replay order.
    pub fn normalize(&mut self) {
        self.to_add.sort_unstable();
        self.to_add.dedup();
        self.to_remove.sort_unstable();
        self.to_remove.dedup();
    }
}

/// Sink for one peer's update stream.
///
/// Implementations render a delta onto the wire; the BGP adapter provides the
/// production implementation. Errors are reported back to the hub, which logs
/// them and moves on. Tearing down a broken session is the session layer's
/// job and eventually surfaces as a detach.
#[async_trait]
pub trait PeerWriter: Send {
    /// Deliver one delta to the peer.
    async fn send(&mut self, delta: &Delta) -> Result<(), Error>;
}

enum PeerAction {
    Attach {
        peer: String,
        writer: Box<dyn PeerWriter>,
    },
    Detach {
        peer: String,
    },
}

/// Cloneable handle for feeding the hub.
///
/// All methods become no-ops once the hub has shut down, so late callers
/// never block on a dead task.
#[derive(Clone)]
pub struct Broadcaster {
    closed: Arc<AtomicBool>,
    actions: mpsc::Sender<PeerAction>,
    deltas: mpsc::Sender<Delta>,
}

impl Broadcaster {
    /// Create a connected handle/hub pair. The hub must be driven with
    /// [`BroadcastHub::run`].
    pub fn new() -> (Broadcaster, BroadcastHub) {
        let closed = Arc::new(AtomicBool::new(false));
        let (actions_tx, actions_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (deltas_tx, deltas_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let handle = Broadcaster {
            closed: closed.clone(),
            actions: actions_tx,
            deltas: deltas_tx,
        };

        let hub = BroadcastHub {
            closed,
            _keepalive: handle.clone(),
            actions: actions_rx,
            deltas: deltas_rx,
            advertised: BTreeSet::new(),
            peers: HashMap::new(),
        };

        (handle, hub)
    }

    /// Register a writer for `peer`, replacing any previous session's writer.
    /// The hub replays the current advertised set to the new writer.
    pub async fn add_peer(&self, peer: impl Into<String>, writer: Box<dyn PeerWriter>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let peer = peer.into();
        if self
            .actions
            .send(PeerAction::Attach { peer, writer })
            .await
            .is_err()
        {
            debug!("broadcast hub gone, dropping peer attach");
        }
    }

    /// Remove `peer` from the registry. No delta is sent.
    pub async fn del_peer(&self, peer: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        if self
            .actions
            .send(PeerAction::Detach {
                peer: peer.to_string(),
            })
            .await
            .is_err()
        {
            debug!("broadcast hub gone, dropping peer detach");
        }
    }

    /// Queue a delta for application and fan-out.
    pub async fn broadcast(&self, delta: Delta) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        if self.deltas.send(delta).await.is_err() {
            debug!("broadcast hub gone, dropping delta");
        }
    }
}

#[async_trait]
impl DeltaSink for Broadcaster {
    async fn publish_delta(&self, delta: Delta) {
        self.broadcast(delta).await;
    }
}

/// The hub task's state: the advertised set and the peer registry, owned
/// exclusively.
pub struct BroadcastHub {
    closed: Arc<AtomicBool>,
    // Keeps the channels open while the hub runs; shutdown comes from the
    // cancellation token, not from senders going away.
    _keepalive: Broadcaster,
    actions: mpsc::Receiver<PeerAction>,
    deltas: mpsc::Receiver<Delta>,
    advertised: BTreeSet<Ipv4Addr>,
    peers: HashMap<String, Box<dyn PeerWriter>>,
}

impl BroadcastHub {
    /// Drive the hub until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("broadcast hub started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }

                action = self.actions.recv() => match action {
                    Some(action) => self.handle_action(action).await,
                    None => {
                        debug!("all broadcast handles dropped");
                        return;
                    }
                },

                delta = self.deltas.recv() => match delta {
                    Some(delta) => self.handle_delta(delta).await,
                    None => return,
                },
            }
        }
    }

    /// Mark closed so handle calls become no-ops, deliver in-flight deltas,
    /// exit.
    async fn shutdown(&mut self) {
        self.closed.store(true, Ordering::Release);

        while let Ok(delta) = self.deltas.try_recv() {
            self.handle_delta(delta).await;
        }

        info!(
            peers = self.peers.len(),
            advertised = self.advertised.len(),
            "broadcast hub shut down"
        );
    }

    async fn handle_action(&mut self, action: PeerAction) {
        match action {
            PeerAction::Attach { peer, mut writer } => {
                let replaced = self.peers.contains_key(&peer);

                info!(
                    peer = %peer,
                    replaced,
                    advertised = self.advertised.len(),
                    "peer attached"
                );

                if self.advertised.is_empty() {
                    debug!(peer = %peer, "nothing to replay");
                } else {
                    let snapshot = Delta {
                        cause: UpdateCause::Snapshot,
                        to_add: self.advertised.iter().copied().collect(),
                        to_remove: Vec::new(),
                    };

                    if let Err(err) = writer.send(&snapshot).await {
                        error!(peer = %peer, %err, "could not replay snapshot");
                        metrics::record_peer_write_error(&peer);
                    }
                }

                self.peers.insert(peer, writer);
                metrics::record_peer_event(if replaced {
                    PeerEvent::Replaced
                } else {
                    PeerEvent::Attached
                });
                metrics::record_peer_count(self.peers.len());
            }
            PeerAction::Detach { peer } => {
                if self.peers.remove(&peer).is_some() {
                    info!(peer = %peer, remaining = self.peers.len(), "peer detached");
                    metrics::record_peer_event(PeerEvent::Detached);
                    metrics::record_peer_count(self.peers.len());
                }
            }
        }
    }

    async fn handle_delta(&mut self, delta: Delta) {
        if delta.is_empty() {
            debug!(cause = %delta.cause, "ignoring empty delta");
            return;
        }

        // Removes before adds; the index keeps the sets disjoint, but the
        // order is part of the contract.
        for address in &delta.to_remove {
            self.advertised.remove(address);
        }
        for address in &delta.to_add {
            self.advertised.insert(*address);
        }

        metrics::record_broadcast(delta.cause, delta.to_add.len(), delta.to_remove.len());
        metrics::record_advertised(self.advertised.len());

        debug!(
            cause = %delta.cause,
            added = delta.to_add.len(),
            removed = delta.to_remove.len(),
            advertised = self.advertised.len(),
            peers = self.peers.len(),
            "fanning out delta"
        );

        for (peer, writer) in self.peers.iter_mut() {
            if let Err(err) = writer.send(&delta).await {
                // Keep the peer registered; it resyncs from the snapshot on
                // its next attach.
                error!(peer = %peer, %err, "could not deliver delta");
                metrics::record_peer_write_error(peer);
            }
        }
    }
}
