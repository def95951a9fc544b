//! Periodic DNS refresh loop.
//!
//! Each tick asks every upstream server about every expired domain, merges
//! the answers per domain (union of A records, later expiry wins for
//! duplicates) and publishes the result into the index. Individual query
//! timeouts are soft; a tick interrupted by shutdown publishes nothing.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DnsConfig;
use crate::error::Error;
use crate::index::{DomainIndex, PublishItem};
use crate::metrics::{self, QueryResult, Timer};

/// EDNS0 receive buffer advertised on every query.
const EDNS_BUFFER_SIZE: u16 = 4096;

/// Message ids only need to pair a response with its in-flight query; each
/// query uses a dedicated socket, so a counter is enough.
static QUERY_ID: AtomicU16 = AtomicU16::new(1);

/// One server's answer for one domain: addresses with their record TTLs.
#[derive(Debug)]
struct Answer {
    domain: String,
    records: Vec<(Ipv4Addr, u32)>,
}

fn build_query(domain: &str) -> Result<Message, Error> {
    let name = Name::from_ascii(domain)?;

    let mut message = Message::new();
    message.set_id(QUERY_ID.fetch_add(1, Ordering::Relaxed));
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, RecordType::A));

    let mut edns = Edns::new();
    edns.set_max_payload(EDNS_BUFFER_SIZE);
    edns.set_dnssec_ok(true);
    message.set_edns(edns);

    Ok(message)
}

async fn exchange(server: SocketAddr, message: &Message) -> Result<Message, Error> {
    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind).await?;
    socket.send_to(&message.to_vec()?, server).await?;

    let mut buf = [0u8; EDNS_BUFFER_SIZE as usize];
    let (len, _) = socket.recv_from(&mut buf).await?;
    Ok(Message::from_vec(&buf[..len])?)
}

/// Run one query. `None` means the query contributes nothing this tick.
async fn resolve_one(server: SocketAddr, domain: String, timeout: Duration) -> Option<Answer> {
    let timer = Timer::start();
    let server_label = server.to_string();

    let message = match build_query(&domain) {
        Ok(message) => message,
        Err(err) => {
            error!(%domain, %err, "could not build query");
            return None;
        }
    };

    let response = match tokio::time::timeout(timeout, exchange(server, &message)).await {
        Err(_) => {
            // Soft failure; the domain stays expired and is retried next tick.
            debug!(%domain, server = %server, "query timed out");
            metrics::record_query(&server_label, QueryResult::Timeout, timer.elapsed());
            return None;
        }
        Ok(Err(err)) => {
            error!(%domain, server = %server, %err, "could not resolve domain");
            metrics::record_query(&server_label, QueryResult::Error, timer.elapsed());
            return None;
        }
        Ok(Ok(response)) => response,
    };

    if response.id() != message.id() {
        warn!(%domain, server = %server, "response id mismatch, dropping");
        metrics::record_query(&server_label, QueryResult::Error, timer.elapsed());
        return None;
    }

    if response.response_code() != ResponseCode::NoError {
        debug!(
            %domain,
            server = %server,
            code = %response.response_code(),
            "negative response"
        );
    }

    let records: Vec<(Ipv4Addr, u32)> = response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(a) => Some((a.0, record.ttl())),
            _ => None,
        })
        .collect();

    debug!(
        %domain,
        server = %server,
        answers = records.len(),
        "query answered"
    );
    metrics::record_query(&server_label, QueryResult::Success, timer.elapsed());

    Some(Answer { domain, records })
}

/// Fold per-server answers into one [`PublishItem`] per domain.
///
/// Addresses are the union across servers; a duplicate keeps the later
/// expiry. Each domain's refresh deadline is an hour out, independent of
/// record TTLs.
fn merge_answers(answers: impl IntoIterator<Item = Answer>, now: DateTime<Utc>) -> Vec<PublishItem> {
    let refresh = now + ChronoDuration::hours(1);

    let mut items: HashMap<String, PublishItem> = HashMap::new();
    for answer in answers {
        let item = items
            .entry(answer.domain.clone())
            .or_insert_with(|| PublishItem {
                domain: answer.domain,
                expire: refresh,
                record: HashMap::new(),
            });

        for (address, ttl) in answer.records {
            let expires = now + ChronoDuration::seconds(i64::from(ttl));
            match item.record.get_mut(&address) {
                Some(existing) => {
                    if expires > *existing {
                        *existing = expires;
                    }
                }
                None => {
                    item.record.insert(address, expires);
                }
            }
        }
    }

    items.into_values().collect()
}

/// The refresh loop.
pub struct Resolver {
    config: DnsConfig,
    index: Arc<DomainIndex>,
}

impl Resolver {
    /// A resolver refreshing `index` against the configured servers.
    pub fn new(config: DnsConfig, index: Arc<DomainIndex>) -> Self {
        Self { config, index }
    }

    /// Tick until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            servers = ?self.config.servers,
            interval_secs = self.config.interval_secs,
            "resolver started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("resolver shutting down");
                    return;
                }

                _ = ticker.tick() => self.tick(&cancel).await,
            }
        }
    }

    async fn tick(&self, cancel: &CancellationToken) {
        let timer = Timer::start();

        let expired = self.index.expired_domains();
        if expired.is_empty() {
            debug!("nothing to resolve");
            return;
        }

        let timeout = self.config.timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        let mut queries = Vec::with_capacity(expired.len() * self.config.servers.len());
        for domain in &expired {
            for server in &self.config.servers {
                queries.push((*server, domain.clone()));
            }
        }

        let mut in_flight = stream::iter(queries)
            .map(|(server, domain)| resolve_one(server, domain, timeout))
            .buffer_unordered(self.config.concurrency.max(1));

        let mut answers = Vec::new();
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("tick cancelled, discarding partial results");
                    return;
                }

                _ = tokio::time::sleep_until(deadline) => {
                    warn!(collected = answers.len(), "tick deadline reached");
                    break;
                }

                next = in_flight.next() => match next {
                    Some(Some(answer)) => answers.push(answer),
                    Some(None) => {}
                    None => break,
                },
            }
        }
        drop(in_flight);

        let items = merge_answers(answers, Utc::now());
        let published = items.len();
        if published > 0 {
            self.index.publish(items).await;
        }

        metrics::record_resolve_tick(expired.len(), timer.elapsed());
        info!(
            domains = expired.len(),
            published,
            spent = ?timer.elapsed(),
            "resolve done"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn query_carries_edns_and_recursion() {
        let message = build_query("example.com").unwrap();

        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.queries()[0].query_type(), RecordType::A);
        assert!(message.recursion_desired());

        let edns = message.extensions().as_ref().unwrap();
        assert_eq!(edns.max_payload(), EDNS_BUFFER_SIZE);
        assert!(edns.flags().dnssec_ok);
    }

    #[test]
    fn merge_unions_across_servers() {
        let now = Utc::now();
        let answers = vec![
            Answer {
                domain: "example.com".into(),
                records: vec![(addr("192.0.2.1"), 60)],
            },
            Answer {
                domain: "example.com".into(),
                records: vec![(addr("192.0.2.1"), 300), (addr("192.0.2.2"), 60)],
            },
        ];

        let items = merge_answers(answers, now);
        assert_eq!(items.len(), 1);

        let item = &items[0];
        assert_eq!(item.domain, "example.com");
        assert_eq!(item.expire, now + ChronoDuration::hours(1));
        assert_eq!(item.record.len(), 2);
        // Duplicate answer keeps the longer lease.
        assert_eq!(
            item.record[&addr("192.0.2.1")],
            now + ChronoDuration::seconds(300)
        );
        assert_eq!(
            item.record[&addr("192.0.2.2")],
            now + ChronoDuration::seconds(60)
        );
    }

    #[test]
    fn merge_keeps_empty_answers() {
        // A clean "no records" response still publishes, so stale addresses
        // age out instead of lingering forever.
        let now = Utc::now();
        let items = merge_answers(
            vec![Answer {
                domain: "gone.example".into(),
                records: vec![],
            }],
            now,
        );

        assert_eq!(items.len(), 1);
        assert!(items[0].record.is_empty());
    }

    #[tokio::test]
    async fn resolves_against_loopback_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..len]).unwrap();

            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);
            response.add_query(query.queries()[0].clone());
            let name = query.queries()[0].name().clone();
            response.add_answer(Record::from_rdata(
                name,
                300,
                RData::A(A::from(addr("192.0.2.1"))),
            ));

            server
                .send_to(&response.to_vec().unwrap(), from)
                .await
                .unwrap();
        });

        let answer = resolve_one(server_addr, "example.com".into(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(answer.domain, "example.com");
        assert_eq!(answer.records, vec![(addr("192.0.2.1"), 300)]);
    }

    #[tokio::test]
    async fn silent_server_is_a_soft_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = silent.local_addr().unwrap();

        let answer = resolve_one(
            server_addr,
            "example.com".into(),
            Duration::from_millis(50),
        )
        .await;
        assert!(answer.is_none());
    }
}
