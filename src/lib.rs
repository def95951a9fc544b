//! Routebeacon - announce DNS-resolved destinations as BGP host routes.
//!
//! This crate runs a control plane that continuously resolves a configured
//! set of DNS names, keeps a reference-counted union of every live IPv4
//! address across those names, and announces that union as /32 routes to
//! BGP peers. When a name's answer set changes - new addresses, expired
//! addresses, operator edits over the admin API - peers receive incremental
//! UPDATE messages instead of a full table.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                           routebeacon                             │
//! │                                                                   │
//! │  ┌────────────┐  Publish   ┌──────────────┐  Delta  ┌──────────┐ │
//! │  │  Resolver  │───────────▶│ DomainIndex  │────────▶│Broadcast │ │
//! │  │ (per-tick  │            │ (refcounted  │         │   hub    │ │
//! │  │  queries)  │            │  addresses)  │         └────┬─────┘ │
//! │  └────────────┘            └──────▲───────┘              │       │
//! │                                   │ CRUD                 │ per   │
//! │  ┌────────────┐                   │                      │ peer  │
//! │  │ Admin API  │───────────────────┘              ┌───────▼─────┐ │
//! │  │ (axum)     │                                  │ BGP adapter │ │
//! │  └────────────┘                                  │ (UPDATE     │ │
//! │                                                  │  frames)    │ │
//! └──────────────────────────────────────────────────┴─────────────┴─┘
//! ```
//!
//! The BGP session layer itself (OPEN/KEEPALIVE negotiation, the peer FSM)
//! is not part of this crate; it drives [`bgp::BgpAdapter`] through the
//! [`bgp::UpdateSink`] and [`bgp::SessionControl`] traits.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use routebeacon::{Config, Daemon};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = load_config();
//!     let daemon = Daemon::new(config, vec!["example.com".into()]).unwrap();
//!
//!     let cancel = CancellationToken::new();
//!     daemon.run(cancel).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod api;
pub mod bgp;
pub mod bootstrap;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod index;
pub mod metrics;
pub mod packet;
pub mod resolver;
pub mod server;
pub mod telemetry;

// Re-export main types
pub use broadcast::{Broadcaster, Delta, PeerWriter, UpdateCause};
pub use config::Config;
pub use error::Error;
pub use index::{DomainIndex, IndexEntry, PublishItem};
pub use server::Daemon;
