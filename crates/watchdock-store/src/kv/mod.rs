//! Key-value backend: records live under `containers/<name>/<field>`.
//!
//! Change detection diffs each listing against the last known snapshot. Our
//! own writes update the snapshot first, so they diff to nothing.

mod consul;
pub use consul::ConsulKv;

pub mod mapping;

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use watchdock_model::{ContainerSpec, Event, EventKind, Origin};

use crate::{EventRx, EventTx, StateStore, StoreError};

pub const DEFAULT_PREFIX: &str = "containers";

const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One prefix listing and the store index it reflects.
#[derive(Debug, Clone, Default)]
pub struct KvListing {
    pub index: u64,
    pub pairs: Vec<KvPair>,
}

/// Minimal key-value contract the store needs.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Ordered pairs under `prefix`. With `wait_index`, block until the index moves past it
    /// (or the server-side wait elapses).
    async fn list(&self, prefix: &str, wait_index: Option<u64>) -> Result<KvListing, StoreError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Delete `prefix` and everything below it.
    async fn delete_tree(&self, prefix: &str) -> Result<(), StoreError>;
}

/// Key-value [`StateStore`].
pub struct KvStore<C> {
    client: C,
    prefix: String,
    snapshot: BTreeMap<String, ContainerSpec>,
    index: u64,
    label: String,
    retry_delay: Duration,
}

impl<C: KvClient> KvStore<C> {
    pub fn new(client: C, label: impl Into<String>) -> Self {
        Self::with_prefix(client, label, DEFAULT_PREFIX)
    }

    pub fn with_prefix(client: C, label: impl Into<String>, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.trim_matches('/').to_string(),
            snapshot: BTreeMap::new(),
            index: 0,
            label: label.into(),
            retry_delay: RETRY_DELAY,
        }
    }

    /// Wait between a failed listing and the next attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn snapshot(&self) -> &BTreeMap<String, ContainerSpec> {
        &self.snapshot
    }

    /// Compare a fresh listing against the snapshot and adopt it.
    ///
    /// Names whose record is currently invalid keep their previous value.
    pub fn diff(&mut self, listing: &KvListing) -> Vec<Event> {
        let mut next = BTreeMap::new();
        for (name, res) in mapping::specs_from_pairs(&self.prefix, &listing.pairs) {
            match res {
                Ok(spec) => {
                    next.insert(name, spec);
                }
                Err(e) => {
                    warn!(store = %self.label, %name, error = %e, "invalid record");
                    if let Some(prev) = self.snapshot.get(&name) {
                        next.insert(name, prev.clone());
                    }
                }
            }
        }

        let mut events = Vec::new();
        for (name, spec) in &next {
            if self.snapshot.get(name) != Some(spec) {
                info!(store = %self.label, %name, "record changed");
                events.push(Event::upsert(spec.clone(), Origin::Store));
            }
        }
        for name in self.snapshot.keys() {
            if !next.contains_key(name) {
                info!(store = %self.label, %name, "record removed");
                events.push(Event::tombstone(name.clone(), Origin::Store));
            }
        }

        self.snapshot = next;
        events
    }

    /// Persist an event coming from the runtime.
    #[instrument(
        level = "debug",
        skip(self, event),
        fields(name = %event.name(), kind = ?event.kind())
    )]
    pub async fn apply(&mut self, event: &Event) -> Result<(), StoreError> {
        if event.origin() == Origin::Store {
            trace!("ignoring event produced by a store");
            return Ok(());
        }
        let name = event.name().to_string();

        match event.kind() {
            EventKind::Tombstone => {
                self.snapshot.remove(&name);
                self.client
                    .delete_tree(&format!("{}/{}/", self.prefix, name))
                    .await?;
                info!(store = %self.label, %name, "record deleted");
            }
            EventKind::Upsert => {
                let stored = mapping::as_stored(&self.prefix, event.record());
                self.snapshot.insert(name.clone(), stored);
                for pair in mapping::pairs_from_spec(&self.prefix, event.record()) {
                    self.client.put(&pair.key, &pair.value).await?;
                }
                debug!(store = %self.label, %name, "record written");
            }
        }
        Ok(())
    }

    fn adopt_index(&mut self, index: u64) {
        // A backwards index means the server state was reset.
        self.index = if index < self.index { 0 } else { index };
    }
}

#[async_trait]
impl<C: KvClient + 'static> StateStore for KvStore<C> {
    fn name(&self) -> &str {
        &self.label
    }

    async fn start(&mut self, outbound: &EventTx) -> Result<usize, StoreError> {
        let listing = self.client.list(&self.prefix, None).await?;
        self.adopt_index(listing.index);
        let events = self.diff(&listing);
        let n = events.len();
        for ev in events {
            if outbound.send(ev).is_err() {
                break;
            }
        }
        info!(store = %self.label, records = n, "initial scan complete");
        Ok(n)
    }

    async fn sync(
        &mut self,
        mut inbound: EventRx,
        outbound: EventTx,
        shutdown: CancellationToken,
    ) -> Result<(), StoreError> {
        info!(store = %self.label, prefix = %self.prefix, "watching for changes");

        loop {
            let prefix = self.prefix.clone();
            let wait_index = Some(self.index);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(store = %self.label, "shutdown requested");
                    return Ok(());
                }
                res = self.client.list(&prefix, wait_index) => match res {
                    Ok(listing) => {
                        if listing.index == self.index {
                            continue;
                        }
                        self.adopt_index(listing.index);
                        for ev in self.diff(&listing) {
                            if outbound.send(ev).is_err() {
                                debug!(store = %self.label, "runtime side closed");
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            store = %self.label,
                            error = %e,
                            retry_in = ?self.retry_delay,
                            "listing failed"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(self.retry_delay) => {}
                        }
                    }
                },
                msg = inbound.recv() => match msg {
                    Some(ev) => {
                        if let Err(e) = self.apply(&ev).await {
                            warn!(
                                store = %self.label,
                                name = %ev.name(),
                                error = %e,
                                "failed to persist event"
                            );
                        }
                    }
                    None => {
                        debug!(store = %self.label, "inbound channel closed");
                        return Ok(());
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use tokio::sync::{Notify, mpsc};

    use super::*;

    /// In-memory KV with a monotonically increasing index; waiting lists block like Consul's.
    #[derive(Default)]
    struct MemoryKv {
        inner: Mutex<(u64, BTreeMap<String, Vec<u8>>)>,
        changed: Notify,
        lists: AtomicUsize,
        failures: AtomicUsize,
        expire: AtomicBool,
    }

    impl MemoryKv {
        fn write(&self, f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>)) {
            {
                let mut g = self.inner.lock().unwrap();
                g.0 += 1;
                f(&mut g.1);
            }
            self.changed.notify_waiters();
        }

        fn set(&self, key: &str, value: &str) {
            self.write(|m| {
                m.insert(key.to_string(), value.as_bytes().to_vec());
            });
        }

        fn keys(&self) -> Vec<String> {
            self.inner.lock().unwrap().1.keys().cloned().collect()
        }

        fn lists(&self) -> usize {
            self.lists.load(Ordering::SeqCst)
        }

        /// The next `n` listings fail.
        fn fail_lists(&self, n: usize) {
            self.failures.store(n, Ordering::SeqCst);
        }

        /// Release a blocked listing with the index unchanged, as a server-side timeout does.
        fn expire_wait(&self) {
            self.expire.store(true, Ordering::SeqCst);
            self.changed.notify_waiters();
        }

        fn snapshot(&self, prefix: &str) -> KvListing {
            let g = self.inner.lock().unwrap();
            KvListing {
                index: g.0,
                pairs: g
                    .1
                    .iter()
                    .filter(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| KvPair::new(k.clone(), v.clone()))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl KvClient for &'static MemoryKv {
        async fn list(
            &self,
            prefix: &str,
            wait_index: Option<u64>,
        ) -> Result<KvListing, StoreError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Kv("connection refused".into()));
            }

            loop {
                let notified = self.changed.notified();
                let listing = self.snapshot(prefix);
                if wait_index.is_none_or(|w| listing.index > w) {
                    return Ok(listing);
                }
                notified.await;
                if self.expire.swap(false, Ordering::SeqCst) {
                    return Ok(self.snapshot(prefix));
                }
            }
        }

        async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
            self.write(|m| {
                m.insert(key.to_string(), value.to_vec());
            });
            Ok(())
        }

        async fn delete_tree(&self, prefix: &str) -> Result<(), StoreError> {
            self.write(|m| m.retain(|k, _| !k.starts_with(prefix)));
            Ok(())
        }
    }

    fn kv() -> &'static MemoryKv {
        Box::leak(Box::new(MemoryKv::default()))
    }

    async fn listing(kv: &'static MemoryKv) -> KvListing {
        kv.list(DEFAULT_PREFIX, None).await.unwrap()
    }

    struct Syncing {
        to_store: EventTx,
        from_store: EventRx,
        shutdown: CancellationToken,
    }

    async fn syncing(kv: &'static MemoryKv) -> Syncing {
        let mut store = KvStore::new(kv, "kv:test").with_retry_delay(Duration::from_millis(10));
        let (out_tx, from_store) = mpsc::unbounded_channel();
        store.start(&out_tx).await.unwrap();

        let (to_store, inbound) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { store.sync(inbound, out_tx, token).await });
        settle().await;

        Syncing {
            to_store,
            from_store,
            shutdown,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn next(rx: &mut EventRx) -> Event {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn start_emits_one_upsert_per_record() {
        let kv = kv();
        kv.set("containers/web/image", "nginx");
        kv.set("containers/db/image", "postgres");
        kv.set("other/x/image", "ignored");

        let mut store = KvStore::new(kv, "kv:test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(store.start(&tx).await.unwrap(), 2);

        let mut names = vec![
            rx.try_recv().unwrap().name().to_string(),
            rx.try_recv().unwrap().name().to_string(),
        ];
        names.sort();
        assert_eq!(names, vec!["db", "web"]);
    }

    #[tokio::test]
    async fn external_changes_are_diffed() {
        let kv = kv();
        kv.set("containers/web/image", "nginx:1");
        kv.set("containers/db/image", "postgres");
        let mut store = KvStore::new(kv, "kv:test");
        store.diff(&listing(kv).await);

        kv.set("containers/web/image", "nginx:2");
        kv.delete_tree("containers/db/").await.unwrap();
        kv.set("containers/cache/image", "redis");

        let events = store.diff(&listing(kv).await);
        let summary: Vec<_> = events.iter().map(|e| (e.name(), e.kind())).collect();
        assert_eq!(
            summary,
            vec![
                ("cache", EventKind::Upsert),
                ("web", EventKind::Upsert),
                ("db", EventKind::Tombstone),
            ]
        );
        assert!(store.diff(&listing(kv).await).is_empty());
    }

    #[tokio::test]
    async fn own_writes_diff_to_nothing() {
        let kv = kv();
        let mut store = KvStore::new(kv, "kv:test");

        let spec = ContainerSpec {
            cmd: vec!["serve".into()],
            config: Some(Default::default()),
            ..ContainerSpec::new("api", "acme/api:1.0")
        };
        store
            .apply(&Event::upsert(spec, Origin::Runtime))
            .await
            .unwrap();
        assert!(kv.keys().contains(&"containers/api/image".to_string()));
        assert!(store.diff(&listing(kv).await).is_empty());

        store
            .apply(&Event::tombstone("api", Origin::Runtime))
            .await
            .unwrap();
        assert!(kv.keys().is_empty());
        assert!(store.diff(&listing(kv).await).is_empty());
    }

    #[tokio::test]
    async fn tombstone_does_not_touch_names_sharing_a_prefix() {
        let kv = kv();
        kv.set("containers/web/image", "nginx");
        kv.set("containers/webapp/image", "app");
        let mut store = KvStore::new(kv, "kv:test");
        store.diff(&listing(kv).await);

        store
            .apply(&Event::tombstone("web", Origin::Runtime))
            .await
            .unwrap();
        assert_eq!(kv.keys(), vec!["containers/webapp/image".to_string()]);
    }

    #[tokio::test]
    async fn invalid_record_keeps_previous_value() {
        let kv = kv();
        kv.set("containers/db/image", "postgres");
        let mut store = KvStore::new(kv, "kv:test");
        store.diff(&listing(kv).await);

        kv.set("containers/db/maxinstances", "lots");
        assert!(store.diff(&listing(kv).await).is_empty());
        assert_eq!(store.snapshot()["db"].image, "postgres");
    }

    #[test]
    fn backwards_index_resets_to_zero() {
        let mut store = KvStore::new(kv(), "kv:test");
        store.adopt_index(7);
        assert_eq!(store.index, 7);
        store.adopt_index(9);
        assert_eq!(store.index, 9);
        store.adopt_index(3);
        assert_eq!(store.index, 0);
    }

    #[tokio::test]
    async fn sync_reports_an_external_write_once() {
        let kv = kv();
        let mut rt = syncing(kv).await;

        kv.set("containers/web/image", "nginx");
        let ev = next(&mut rt.from_store).await;
        assert_eq!((ev.name(), ev.kind()), ("web", EventKind::Upsert));
        assert_eq!(ev.origin(), Origin::Store);

        settle().await;
        assert!(rt.from_store.try_recv().is_err());
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn sync_does_not_echo_runtime_writes() {
        let kv = kv();
        let mut rt = syncing(kv).await;

        let spec = ContainerSpec {
            config: Some(Default::default()),
            ..ContainerSpec::new("api", "acme/api:1.0")
        };
        rt.to_store
            .send(Event::upsert(spec, Origin::Runtime))
            .unwrap();
        settle().await;
        assert!(kv.keys().contains(&"containers/api/image".to_string()));
        assert!(rt.from_store.try_recv().is_err());

        kv.set("containers/api/image", "acme/api:2.0");
        let ev = next(&mut rt.from_store).await;
        assert_eq!(ev.name(), "api");
        assert_eq!(ev.record().image, "acme/api:2.0");
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn sync_keeps_waiting_when_the_index_is_unchanged() {
        let kv = kv();
        kv.set("containers/web/image", "nginx");
        let mut rt = syncing(kv).await;
        let _initial = rt.from_store.recv().await.unwrap();

        let before = kv.lists();
        kv.expire_wait();
        settle().await;
        assert!(kv.lists() > before);
        assert!(rt.from_store.try_recv().is_err());

        kv.set("containers/db/image", "postgres");
        assert_eq!(next(&mut rt.from_store).await.name(), "db");
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn sync_retries_failed_listings() {
        let kv = kv();
        kv.fail_lists(2);
        let mut store = KvStore::new(kv, "kv:test").with_retry_delay(Duration::from_millis(10));
        let (out_tx, mut from_store) = mpsc::unbounded_channel();
        let (_to_store, inbound) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move { store.sync(inbound, out_tx, shutdown).await }
        });
        settle().await;
        assert!(kv.lists() >= 3);

        kv.set("containers/web/image", "nginx");
        assert_eq!(next(&mut from_store).await.name(), "web");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_retry_wait() {
        let kv = kv();
        kv.fail_lists(1);
        let mut store = KvStore::new(kv, "kv:test").with_retry_delay(Duration::from_secs(3600));
        let (out_tx, _from_store) = mpsc::unbounded_channel();
        let (_to_store, inbound) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { store.sync(inbound, out_tx, shutdown).await }
        });
        settle().await;

        shutdown.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap();
        assert!(res.unwrap().is_ok());
    }
}
