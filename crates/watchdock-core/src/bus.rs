//! Wiring between the stores and the reconciler.
//!
//! All stores feed one desired-state channel into the reconciler; the
//! reconciler feeds a separate observed channel into each store.

use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use watchdock_store::StateStore;

use crate::{BusError, ContainerEngine, Fanout, Reconciler, ReconcilerHandle};

pub struct Bus<E> {
    stores: Vec<Box<dyn StateStore>>,
    reconciler: Reconciler<E>,
}

impl<E: ContainerEngine> Bus<E> {
    pub fn new(reconciler: Reconciler<E>) -> Self {
        Self {
            stores: Vec::new(),
            reconciler,
        }
    }

    pub fn with_store(mut self, store: impl StateStore + 'static) -> Self {
        self.add_store(Box::new(store));
        self
    }

    pub fn add_store(&mut self, store: Box<dyn StateStore>) {
        self.stores.push(store);
    }

    pub fn handle(&self) -> ReconcilerHandle {
        self.reconciler.handle()
    }

    /// Start every store, inventory the engine, then run all loops until `shutdown`.
    ///
    /// The first loop that fails cancels the rest and its error is returned.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BusError> {
        let Bus {
            mut stores,
            mut reconciler,
        } = self;

        let (desired_tx, desired_rx) = mpsc::unbounded_channel();
        let mut fanout = Fanout::default();
        let mut observed = Vec::with_capacity(stores.len());

        for store in stores.iter_mut() {
            let (tx, rx) = mpsc::unbounded_channel();
            fanout.push(tx);
            observed.push(rx);

            let records = store.start(&desired_tx).await?;
            info!(store = store.name(), records, "store started");
        }
        reconciler.start(&fanout).await?;

        let mut set = JoinSet::new();
        for (mut store, inbound) in stores.into_iter().zip(observed) {
            let outbound = desired_tx.clone();
            let token = shutdown.clone();
            set.spawn(async move {
                store
                    .sync(inbound, outbound, token)
                    .await
                    .map_err(BusError::from)
            });
        }
        drop(desired_tx);

        let token = shutdown.clone();
        set.spawn(async move {
            reconciler
                .run(desired_rx, fanout, token)
                .await
                .map_err(BusError::from)
        });

        while let Some(res) = set.join_next().await {
            let err = match res {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => BusError::Join(e.to_string()),
            };
            error!(error = %err, "bus loop failed; shutting down");
            shutdown.cancel();
            return Err(err);
        }
        info!("bus stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc, time::Duration};

    use tokio::task::JoinHandle;
    use watchdock_store::{DirConfig, DirStore};

    use super::*;
    use crate::{EngineEvent, ReconcilerConfig, testing::MockEngine};

    fn cfg() -> ReconcilerConfig {
        ReconcilerConfig {
            sweep_interval: Duration::from_secs(3600),
            prune: false,
            ..Default::default()
        }
    }

    fn launch(
        engine: Arc<MockEngine>,
        dir: &Path,
    ) -> (ReconcilerHandle, CancellationToken, JoinHandle<Result<(), BusError>>) {
        let store = DirStore::new(DirConfig::new(dir)).unwrap();
        let bus = Bus::new(Reconciler::new(engine, cfg())).with_store(store);
        let handle = bus.handle();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(bus.run(shutdown.clone()));
        (handle, shutdown, task)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn file_entry_is_created_once() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("api.json"),
            r#"{"Name":"api","Image":"acme/api:1.0"}"#,
        )
        .unwrap();

        let engine = Arc::new(MockEngine::new());
        engine.add_image("acme/api:1.0");
        let (_handle, shutdown, task) = launch(engine.clone(), tmp.path());

        assert!(wait_for(|| engine.is_running("api")).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let calls = engine.calls();
        assert_eq!(calls.create, vec!["api"]);
        assert_eq!(calls.start.len(), 1);
        assert!(calls.pull.is_empty());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_destroy_deletes_backing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(MockEngine::new());
        engine.add_image("redis");
        let id = engine.add_container("cache", "redis", true);

        let (handle, shutdown, task) = launch(engine.clone(), tmp.path());
        let file = tmp.path().join("cache.json");
        assert!(wait_for(|| file.exists()).await);

        engine
            .emit(EngineEvent::new(&id, Some("/cache"), "destroy"))
            .await;
        assert!(wait_for(|| !file.exists()).await);
        assert!(handle.snapshot().await.iter().all(|r| r.name != "cache"));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removed_file_is_forgotten_and_killed() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(MockEngine::new());
        engine.add_image("nginx");
        let (handle, shutdown, task) = launch(engine.clone(), tmp.path());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let file = tmp.path().join("web.json");
        std::fs::write(&file, r#"{"Name":"web","Image":"nginx"}"#).unwrap();
        assert!(wait_for(|| engine.is_running("web")).await);

        std::fs::remove_file(&file).unwrap();
        assert!(wait_for(|| !engine.is_running("web")).await);
        assert!(handle.snapshot().await.is_empty());
        assert!(!file.exists());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_inventory_aborts_startup() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(MockEngine::new());
        engine.fail_listing();

        let (_handle, _shutdown, task) = launch(engine, tmp.path());
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::Reconcile(_)));
    }
}
