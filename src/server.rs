//! Daemon wiring and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api;
use crate::bgp::{BgpAdapter, SessionControl};
use crate::broadcast::{BroadcastHub, Broadcaster};
use crate::config::Config;
use crate::error::Error;
use crate::index::DomainIndex;
use crate::metrics;
use crate::packet::Origin;
use crate::resolver::Resolver;

/// Interval for emitting state gauges.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit index size gauges.
async fn metrics_loop(index: Arc<DomainIndex>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }

            _ = interval.tick() => {
                let (domains, addresses) = index.counts();
                metrics::record_state_counts(domains, addresses);
            }
        }
    }
}

/// The assembled control plane: index, broadcast hub, resolver and admin
/// API, sharing one lifecycle.
pub struct Daemon {
    config: Config,
    index: Arc<DomainIndex>,
    broadcaster: Broadcaster,
    hub: BroadcastHub,
}

impl Daemon {
    /// Assemble a daemon from configuration and the bootstrap domain list.
    pub fn new(config: Config, domains: Vec<String>) -> Result<Self, Error> {
        if config.bgp.enabled {
            // Surface origin typos at startup instead of at first session.
            Origin::from_config(&config.bgp.origin)?;
        }

        let (broadcaster, hub) = Broadcaster::new();
        let index = Arc::new(DomainIndex::with_domains(
            Arc::new(broadcaster.clone()),
            domains,
        ));

        Ok(Self {
            config,
            index,
            broadcaster,
            hub,
        })
    }

    /// The shared index, for embedding callers.
    pub fn index(&self) -> Arc<DomainIndex> {
        self.index.clone()
    }

    /// Build the session adapter the external BGP session layer drives.
    pub fn bgp_adapter(&self, control: Arc<dyn SessionControl>) -> Result<BgpAdapter, Error> {
        BgpAdapter::new(&self.config.bgp, self.broadcaster.clone(), control)
    }

    /// Run every component until `cancel` fires, then drain within the
    /// configured shutdown window.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        let Daemon {
            config,
            index,
            broadcaster: _broadcaster,
            hub,
        } = self;

        info!(
            api = %config.api.address,
            bgp_enabled = config.bgp.enabled,
            dns_servers = config.dns.servers.len(),
            "starting daemon"
        );

        let hub_task = tokio::spawn(hub.run(cancel.clone()));

        let resolver = Resolver::new(config.dns.clone(), index.clone());
        let resolver_task = tokio::spawn(resolver.run(cancel.clone()));

        let metrics_task = tokio::spawn(metrics_loop(index.clone(), cancel.clone()));

        let mut api_task = tokio::spawn(api::serve(
            config.api.clone(),
            index.clone(),
            cancel.clone(),
        ));

        let mut api_joined = false;
        let api_result: Result<(), Error> = tokio::select! {
            _ = cancel.cancelled() => Ok(()),

            result = &mut api_task => {
                api_joined = true;
                cancel.cancel();
                match result {
                    Ok(inner) => inner,
                    Err(err) => Err(Error::Io(std::io::Error::other(format!(
                        "admin api task failed: {err}"
                    )))),
                }
            }
        };

        info!("shutdown requested, draining");

        let drain = async {
            let _ = hub_task.await;
            let _ = resolver_task.await;
            let _ = metrics_task.await;
            if !api_joined {
                match (&mut api_task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!(%err, "admin api failed during shutdown"),
                    Err(err) => error!(%err, "admin api task failed"),
                }
            }
        };

        if tokio::time::timeout(config.shutdown(), drain).await.is_err() {
            warn!(
                window_secs = config.shutdown_secs,
                "shutdown window elapsed, abandoning in-flight work"
            );
        }

        info!("daemon stopped");
        api_result
    }
}
