//! BGP session adapter.
//!
//! Bridges established peer sessions to the broadcast hub. The session layer
//! (which owns OPEN/KEEPALIVE negotiation and the peer FSM) calls
//! [`BgpAdapter::on_established`] and [`BgpAdapter::on_closed`] and hands
//! over an [`UpdateSink`] for the write half; everything downstream of
//! "session is up" lives here: rendering deltas into UPDATE frames, the
//! End-of-RIB protocol, and reconnect scheduling for configured peers.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::broadcast::{Broadcaster, Delta, PeerWriter};
use crate::config::BgpConfig;
use crate::error::Error;
use crate::metrics;
use crate::packet::{self, Origin, PathAttributes, END_OF_RIB};

/// Write half of one established session, provided by the session layer.
#[async_trait]
pub trait UpdateSink: Send {
    /// Write one UPDATE message body to the peer.
    async fn write_update(&mut self, body: &[u8]) -> std::io::Result<()>;
}

/// Control surface back into the session layer, used to re-establish
/// configured peers after their session closed.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Tear down and re-dial the given peer.
    async fn restart_peer(&self, peer: Ipv4Addr);
}

/// Adapter between peer sessions and the broadcast hub.
pub struct BgpAdapter {
    attributes: PathAttributes,
    clients: Vec<Ipv4Addr>,
    settle_delay: Duration,
    reconnect_backoff: Duration,
    broadcaster: Broadcaster,
    control: Arc<dyn SessionControl>,
}

impl BgpAdapter {
    /// Build an adapter from configuration.
    pub fn new(
        config: &BgpConfig,
        broadcaster: Broadcaster,
        control: Arc<dyn SessionControl>,
    ) -> Result<Self, Error> {
        let attributes = PathAttributes {
            origin: Origin::from_config(&config.origin)?,
            // iBGP self-origination: no ASNs on the path.
            as_path: Vec::new(),
            next_hop: config.next_hop.unwrap_or(config.router_id),
            local_pref: config.local_pref,
        };

        Ok(Self {
            attributes,
            clients: config.clients.clone(),
            settle_delay: config.settle_delay(),
            reconnect_backoff: config.reconnect_backoff(),
            broadcaster,
            control,
        })
    }

    /// Handle a freshly established session.
    ///
    /// Waits out the settle delay so the peer can finish its OPEN
    /// bookkeeping, writes the initial End-of-RIB, then registers the writer
    /// with the hub; the attach-time snapshot replay carries the starting
    /// table.
    pub async fn on_established(&self, peer: Ipv4Addr, mut sink: Box<dyn UpdateSink>) {
        info!(%peer, "peer established");

        tokio::time::sleep(self.settle_delay).await;

        if let Err(err) = sink.write_update(&END_OF_RIB).await {
            // Broken before it carried anything; the session layer will
            // notice and close, which re-enters through on_closed.
            error!(%peer, %err, "could not write initial end-of-rib");
            return;
        }

        let peer_id = peer.to_string();
        metrics::record_update_frames(&peer_id, 1);

        let writer = SessionWriter {
            peer: peer_id.clone(),
            attributes: self.attributes.clone(),
            sink,
        };
        self.broadcaster.add_peer(peer_id, Box::new(writer)).await;
    }

    /// Handle a closed session: deregister the peer and, for configured
    /// peers, ask the session layer to re-establish after a short backoff.
    pub async fn on_closed(&self, peer: Ipv4Addr) {
        info!(%peer, "peer closed");
        self.broadcaster.del_peer(&peer.to_string()).await;

        if !self.clients.contains(&peer) {
            return;
        }

        let control = self.control.clone();
        let backoff = self.reconnect_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            info!(%peer, "re-establishing configured peer");
            control.restart_peer(peer).await;
        });
    }
}

/// Per-peer writer handed to the hub: renders deltas into UPDATE frames and
/// terminates each batch with End-of-RIB.
struct SessionWriter {
    peer: String,
    attributes: PathAttributes,
    sink: Box<dyn UpdateSink>,
}

#[async_trait]
impl PeerWriter for SessionWriter {
    async fn send(&mut self, delta: &Delta) -> Result<(), Error> {
        let frames = packet::encode_delta(&delta.to_add, &delta.to_remove, &self.attributes)?;

        for frame in &frames {
            self.sink.write_update(frame).await?;
        }
        self.sink.write_update(&END_OF_RIB).await?;

        metrics::record_update_frames(&self.peer, frames.len() + 1);
        debug!(
            peer = %self.peer,
            cause = %delta.cause,
            frames = frames.len(),
            "update written"
        );
        Ok(())
    }
}
