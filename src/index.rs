//! Reference-counted address index.
//!
//! The index is the single source of truth for which domains exist, which
//! addresses each domain currently resolves to, and how many domains hold
//! each address. Every mutation computes the incremental effect on the
//! process-wide address set and hands it to the broadcast hub as a
//! [`Delta`]; an address is announced while at least one domain holds it and
//! withdrawn only when the last holder lets go.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broadcast::{Delta, UpdateCause};
use crate::error::Error;
use crate::metrics;

/// Receiver for deltas emitted by index mutations.
///
/// Production wires this to the broadcast hub; tests substitute a recorder.
#[async_trait]
pub trait DeltaSink: Send + Sync {
    /// Accept one non-empty delta.
    async fn publish_delta(&self, delta: Delta);
}

/// One domain's freshly resolved answer set, produced by the resolver.
#[derive(Debug, Clone)]
pub struct PublishItem {
    /// The domain the answers belong to.
    pub domain: String,
    /// The domain's next refresh deadline.
    pub expire: DateTime<Utc>,
    /// Address to expiry for every answer seen this cycle.
    pub record: HashMap<Ipv4Addr, DateTime<Utc>>,
}

/// Read-only view of one indexed domain, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    /// The domain name.
    pub domain: String,
    /// The domain's current addresses, sorted ascending.
    pub record: Vec<Ipv4Addr>,
    /// When the domain next becomes due for re-resolution.
    pub expire: DateTime<Utc>,
}

#[derive(Debug)]
struct DomainEntry {
    /// Address to expiry; the authoritative per-domain answer set.
    addresses: HashMap<Ipv4Addr, DateTime<Utc>>,
    /// Refresh deadline for the domain itself.
    expire: DateTime<Utc>,
    /// Sorted copy of the address keys, kept in sync for cheap listing.
    record: Vec<Ipv4Addr>,
}

impl DomainEntry {
    fn empty() -> Self {
        Self {
            addresses: HashMap::new(),
            expire: DateTime::UNIX_EPOCH,
            record: Vec::new(),
        }
    }

    fn rebuild_snapshot(&mut self) {
        self.record = self.addresses.keys().copied().collect();
        self.record.sort_unstable();
    }
}

/// Canonical form used as the map key: lower-cased, no trailing dot.
fn canonical(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// Drop one domain's hold on each of `addresses`, collecting the addresses
/// whose count reached zero.
fn release_addresses<'a>(
    ips: &mut HashMap<Ipv4Addr, usize>,
    addresses: impl Iterator<Item = &'a Ipv4Addr>,
    removed: &mut Vec<Ipv4Addr>,
) {
    for address in addresses {
        match ips.get_mut(address) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                ips.remove(address);
                removed.push(*address);
            }
            None => warn!(%address, "no refcount for held address"),
        }
    }
}

/// Domain-to-addresses map with a process-wide address refcount.
///
/// Mutations take the address lock exclusively for their full duration and
/// emit their delta only after releasing it, so the hub's channel can apply
/// backpressure without holding up readers. Reads take it in shared mode and
/// return consistent snapshots.
pub struct DomainIndex {
    // Lock order: `ips` before `domains` wherever both are held.
    ips: RwLock<HashMap<Ipv4Addr, usize>>,
    domains: RwLock<HashMap<String, DomainEntry>>,
    sink: Arc<dyn DeltaSink>,
}

impl DomainIndex {
    /// An empty index feeding `sink`.
    pub fn new(sink: Arc<dyn DeltaSink>) -> Self {
        Self {
            ips: RwLock::new(HashMap::new()),
            domains: RwLock::new(HashMap::new()),
            sink,
        }
    }

    /// An index seeded with `domains`, each with no addresses and an already
    /// passed refresh deadline, so the first resolver tick picks them up.
    pub fn with_domains<I, S>(sink: Arc<dyn DeltaSink>, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let index = Self::new(sink);
        {
            let mut map = index.domains.write();
            for domain in domains {
                map.entry(canonical(domain.as_ref()))
                    .or_insert_with(DomainEntry::empty);
            }
        }
        index
    }

    /// Insert a new domain with an empty answer set.
    ///
    /// Emits no delta; the next resolver cycle fills the entry in.
    pub async fn create(&self, domain: &str) -> Result<(), Error> {
        let domain = canonical(domain);

        {
            let ips = self.ips.write();
            let mut domains = self.domains.write();

            if domains.contains_key(&domain) {
                return Err(Error::AlreadyExists(domain));
            }

            domains.insert(domain.clone(), DomainEntry::empty());
            self.check_refcounts("create", &ips, &domains);
        }

        info!(%domain, "domain created");
        Ok(())
    }

    /// Remove a domain, withdrawing every address it was the last holder of.
    pub async fn delete(&self, domain: &str) -> Result<(), Error> {
        let domain = canonical(domain);

        let delta = {
            let mut ips = self.ips.write();
            let mut domains = self.domains.write();

            let entry = domains
                .remove(&domain)
                .ok_or_else(|| Error::NotFound(domain.clone()))?;

            let mut delta = Delta::new(UpdateCause::ApiDelete);
            release_addresses(&mut ips, entry.addresses.keys(), &mut delta.to_remove);
            delta.normalize();

            self.check_refcounts("delete", &ips, &domains);
            delta
        };

        info!(%domain, withdrawn = delta.to_remove.len(), "domain deleted");
        self.emit(delta).await;
        Ok(())
    }

    /// Rename a domain, dropping the old entry's addresses and starting the
    /// new name from an empty, already-expired entry.
    ///
    /// The interim withdrawal is intentional: the new name re-acquires its
    /// addresses on the next resolver cycle.
    pub async fn rename(&self, old: &str, new: &str) -> Result<(), Error> {
        let old = canonical(old);
        let new = canonical(new);

        let delta = {
            let mut ips = self.ips.write();
            let mut domains = self.domains.write();

            if domains.contains_key(&new) {
                return Err(Error::AlreadyExists(new));
            }

            let entry = domains
                .remove(&old)
                .ok_or_else(|| Error::NotFound(old.clone()))?;

            let mut delta = Delta::new(UpdateCause::ApiUpdate);
            release_addresses(&mut ips, entry.addresses.keys(), &mut delta.to_remove);
            delta.normalize();

            domains.insert(new.clone(), DomainEntry::empty());
            self.check_refcounts("rename", &ips, &domains);
            delta
        };

        info!(
            %old,
            %new,
            withdrawn = delta.to_remove.len(),
            "domain renamed"
        );
        self.emit(delta).await;
        Ok(())
    }

    /// Merge freshly resolved answers into the index.
    ///
    /// Per item: answers already expired on arrival are dropped; new
    /// addresses take (or add to) a refcount; addresses missing from the new
    /// answer are retained while their previous expiry is still in the
    /// future and released once it has passed; addresses present in both
    /// keep the later expiry. Domains deleted since the resolver sampled
    /// them are skipped.
    pub async fn publish(&self, items: Vec<PublishItem>) {
        let now = Utc::now();

        let delta = {
            let mut ips = self.ips.write();
            let mut domains = self.domains.write();
            let mut delta = Delta::new(UpdateCause::ResolverPublish);

            for item in items {
                let domain = canonical(&item.domain);
                let Some(entry) = domains.get_mut(&domain) else {
                    debug!(%domain, "domain gone, dropping publish item");
                    continue;
                };

                let mut merged: HashMap<Ipv4Addr, DateTime<Utc>> =
                    HashMap::with_capacity(item.record.len());

                for (address, expires) in item.record {
                    if expires <= now {
                        continue;
                    }

                    if let Some(previous) = entry.addresses.get(&address) {
                        merged.insert(address, expires.max(*previous));
                        continue;
                    }

                    let count = ips.entry(address).or_insert(0);
                    if *count == 0 {
                        delta.to_add.push(address);
                    }
                    *count += 1;
                    merged.insert(address, expires);
                }

                for (address, expires) in entry.addresses.drain() {
                    if merged.contains_key(&address) {
                        continue;
                    }

                    // A transient empty answer must not withdraw a route
                    // whose lease has not run out yet.
                    if expires > now {
                        merged.insert(address, expires);
                        continue;
                    }

                    release_addresses(&mut ips, std::iter::once(&address), &mut delta.to_remove);
                }

                entry.addresses = merged;
                entry.expire = item.expire;
                entry.rebuild_snapshot();
            }

            // An address can transit zero within a single bulk publish; only
            // its final state decides which list it belongs on.
            delta.to_add.retain(|address| ips.contains_key(address));
            delta.to_remove.retain(|address| !ips.contains_key(address));
            delta.normalize();

            self.check_refcounts("publish", &ips, &domains);
            delta
        };

        if !delta.is_empty() {
            debug!(
                added = delta.to_add.len(),
                removed = delta.to_remove.len(),
                "publish changed the advertised set"
            );
        }
        self.emit(delta).await;
    }

    /// Every domain currently in the index.
    pub fn list_domains(&self) -> Vec<String> {
        let _ips = self.ips.read();
        self.domains.read().keys().cloned().collect()
    }

    /// Domains whose refresh deadline has passed; the resolver's work queue.
    pub fn expired_domains(&self) -> Vec<String> {
        let now = Utc::now();
        let _ips = self.ips.read();
        self.domains
            .read()
            .iter()
            .filter(|(_, entry)| entry.expire <= now)
            .map(|(domain, _)| domain.clone())
            .collect()
    }

    /// Every address with a positive refcount, sorted ascending. Equals the
    /// advertised set at quiescence.
    pub fn ips_list(&self) -> Vec<Ipv4Addr> {
        let ips = self.ips.read();
        let mut out: Vec<Ipv4Addr> = ips
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(address, _)| *address)
            .collect();
        out.sort_unstable();
        out
    }

    /// Consistent snapshot of every entry, for the admin listing.
    pub fn list_entries(&self) -> Vec<IndexEntry> {
        let _ips = self.ips.read();
        self.domains
            .read()
            .iter()
            .map(|(domain, entry)| IndexEntry {
                domain: domain.clone(),
                record: entry.record.clone(),
                expire: entry.expire,
            })
            .collect()
    }

    /// Current index sizes: (domains, addresses).
    pub fn counts(&self) -> (usize, usize) {
        let ips = self.ips.read();
        let domains = self.domains.read();
        (domains.len(), ips.len())
    }

    async fn emit(&self, delta: Delta) {
        if delta.is_empty() {
            return;
        }
        self.sink.publish_delta(delta).await;
    }

    /// Diagnostic cross-check: every tracked refcount must equal the number
    /// of domains holding that address. Logs and counts violations, never
    /// mutates.
    fn check_refcounts(
        &self,
        op: &str,
        ips: &HashMap<Ipv4Addr, usize>,
        domains: &HashMap<String, DomainEntry>,
    ) {
        let mut expected: HashMap<Ipv4Addr, usize> = HashMap::new();
        for entry in domains.values() {
            for address in entry.addresses.keys() {
                *expected.entry(*address).or_insert(0) += 1;
            }
        }

        if &expected != ips {
            warn!(
                op,
                tracked = ips.len(),
                expected = expected.len(),
                "address refcounts diverged from domain state"
            );
            metrics::record_invariant_violation();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;

    struct RecordingSink {
        deltas: Mutex<Vec<Delta>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                deltas: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<Delta> {
            std::mem::take(&mut *self.deltas.lock())
        }
    }

    #[async_trait]
    impl DeltaSink for RecordingSink {
        async fn publish_delta(&self, delta: Delta) {
            self.deltas.lock().push(delta);
        }
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn item(domain: &str, expire: DateTime<Utc>, record: &[(&str, DateTime<Utc>)]) -> PublishItem {
        PublishItem {
            domain: domain.to_string(),
            expire,
            record: record.iter().map(|(a, t)| (addr(a), *t)).collect(),
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let sink = RecordingSink::new();
        let index = DomainIndex::new(sink.clone());

        index.create("google.com").await.unwrap();
        let err = index.create("google.com").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn names_are_canonicalized() {
        let sink = RecordingSink::new();
        let index = DomainIndex::new(sink);

        index.create("Example.COM.").await.unwrap();
        let err = index.create("example.com").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(index.list_domains(), vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn delete_missing_domain_fails() {
        let sink = RecordingSink::new();
        let index = DomainIndex::new(sink);

        let err = index.delete("google.com").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn publish_skips_unknown_domains() {
        let sink = RecordingSink::new();
        let index = DomainIndex::new(sink.clone());

        let one = Utc::now() + ChronoDuration::hours(1);
        index
            .publish(vec![item("nobody.example", one, &[("10.0.0.1", one)])])
            .await;

        assert!(sink.take().is_empty());
        assert!(index.ips_list().is_empty());
        assert!(index.list_domains().is_empty());
    }

    #[tokio::test]
    async fn publish_drops_answers_expired_on_arrival() {
        let sink = RecordingSink::new();
        let index = DomainIndex::new(sink.clone());
        index.create("google.com").await.unwrap();

        let past = Utc::now() - ChronoDuration::seconds(1);
        index
            .publish(vec![item(
                "google.com",
                past,
                &[("127.0.0.1", past), ("127.0.0.2", past)],
            )])
            .await;

        assert!(sink.take().is_empty());
        assert!(index.ips_list().is_empty());
        assert_eq!(index.list_domains(), vec!["google.com".to_string()]);
        assert_eq!(index.expired_domains(), vec!["google.com".to_string()]);
    }

    #[tokio::test]
    async fn shared_address_withdrawn_only_with_last_holder() {
        let sink = RecordingSink::new();
        let index = DomainIndex::new(sink.clone());
        index.create("a.example").await.unwrap();
        index.create("b.example").await.unwrap();

        let one = Utc::now() + ChronoDuration::hours(1);
        index
            .publish(vec![item("a.example", one, &[("10.0.0.1", one)])])
            .await;
        index
            .publish(vec![item("b.example", one, &[("10.0.0.1", one)])])
            .await;

        // Second publish must not re-announce the shared address.
        let deltas = sink.take();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].to_add, vec![addr("10.0.0.1")]);

        // First holder leaves: refcount stays positive, nothing broadcast.
        index.delete("a.example").await.unwrap();
        assert!(sink.take().is_empty());
        assert_eq!(index.ips_list(), vec![addr("10.0.0.1")]);

        // Last holder leaves: the address is withdrawn.
        index.delete("b.example").await.unwrap();
        let deltas = sink.take();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].cause, UpdateCause::ApiDelete);
        assert_eq!(deltas[0].to_remove, vec![addr("10.0.0.1")]);
        assert!(index.ips_list().is_empty());
    }

    #[tokio::test]
    async fn transient_empty_answer_keeps_live_addresses() {
        let sink = RecordingSink::new();
        let index = DomainIndex::new(sink.clone());
        index.create("google.com").await.unwrap();

        let one = Utc::now() + ChronoDuration::hours(1);
        index
            .publish(vec![item(
                "google.com",
                one,
                &[("10.0.0.1", one), ("10.0.0.2", one)],
            )])
            .await;
        sink.take();

        // Answer shrinks to one address while the other is still leased.
        index
            .publish(vec![item("google.com", one, &[("10.0.0.1", one)])])
            .await;

        assert!(sink.take().is_empty());
        assert_eq!(index.ips_list(), vec![addr("10.0.0.1"), addr("10.0.0.2")]);
    }

    #[tokio::test]
    async fn stale_address_is_released_on_next_publish() {
        let sink = RecordingSink::new();
        let index = DomainIndex::new(sink.clone());
        index.create("google.com").await.unwrap();

        let one = Utc::now() + ChronoDuration::hours(1);
        let soon = Utc::now() + ChronoDuration::milliseconds(30);
        index
            .publish(vec![item(
                "google.com",
                one,
                &[("10.0.0.1", one), ("10.0.0.2", soon)],
            )])
            .await;
        sink.take();

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        index
            .publish(vec![item("google.com", one, &[("10.0.0.1", one)])])
            .await;

        let deltas = sink.take();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].cause, UpdateCause::ResolverPublish);
        assert!(deltas[0].to_add.is_empty());
        assert_eq!(deltas[0].to_remove, vec![addr("10.0.0.2")]);
        assert_eq!(index.ips_list(), vec![addr("10.0.0.1")]);
    }

    #[tokio::test]
    async fn duplicate_answers_keep_the_later_expiry() {
        let sink = RecordingSink::new();
        let index = DomainIndex::new(sink.clone());
        index.create("google.com").await.unwrap();

        let one = Utc::now() + ChronoDuration::hours(1);
        let soon = Utc::now() + ChronoDuration::milliseconds(30);

        index
            .publish(vec![item("google.com", one, &[("10.0.0.1", one)])])
            .await;
        // A shorter lease from a slower server must not shorten the stored one.
        index
            .publish(vec![item("google.com", one, &[("10.0.0.1", soon)])])
            .await;
        sink.take();

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        index.publish(vec![item("google.com", one, &[])]).await;
        assert!(sink.take().is_empty());
        assert_eq!(index.ips_list(), vec![addr("10.0.0.1")]);
    }

    #[tokio::test]
    async fn publish_is_idempotent() {
        let sink = RecordingSink::new();
        let index = DomainIndex::new(sink.clone());
        index.create("google.com").await.unwrap();

        let one = Utc::now() + ChronoDuration::hours(1);
        let answers = vec![item(
            "google.com",
            one,
            &[("10.0.0.1", one), ("10.0.0.2", one)],
        )];

        index.publish(answers.clone()).await;
        assert_eq!(sink.take().len(), 1);

        index.publish(answers).await;
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn seeded_domains_start_expired() {
        let sink = RecordingSink::new();
        let index =
            DomainIndex::with_domains(sink, ["www.google.com".to_string(), "ya.ru.".to_string()]);

        let mut expired = index.expired_domains();
        expired.sort();
        assert_eq!(expired, vec!["www.google.com", "ya.ru"]);
        assert!(index.ips_list().is_empty());
    }

    #[tokio::test]
    async fn entries_expose_sorted_records() {
        let sink = RecordingSink::new();
        let index = DomainIndex::new(sink);
        index.create("google.com").await.unwrap();

        let one = Utc::now() + ChronoDuration::hours(1);
        index
            .publish(vec![item(
                "google.com",
                one,
                &[("10.0.0.9", one), ("10.0.0.1", one), ("9.9.9.9", one)],
            )])
            .await;

        let entries = index.list_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].domain, "google.com");
        assert_eq!(
            entries[0].record,
            vec![addr("9.9.9.9"), addr("10.0.0.1"), addr("10.0.0.9")]
        );
        assert_eq!(entries[0].expire, one);
    }
}
