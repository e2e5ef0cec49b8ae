//! Reconciler actor.
//!
//! One loop owns `known` and the pull table; the engine subscription, sweep
//! ticks, inbound events and replies from detached tasks all pass through it.

mod handle;
use handle::Command;
pub use handle::ReconcilerHandle;

mod sweep;

use std::{
    collections::{BTreeMap, HashMap, btree_map},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use watchdock_model::{
    ContainerId, ContainerName, ContainerSpec, Event, EventKind, ImagePullState, Origin,
    RuntimeContainerRef,
};
use watchdock_store::{EventRx, EventTx};

use crate::{
    ContainerEngine, EngineEvent, EngineEventRx, PullSlot, ReconcileError, reconcile_one, view,
};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub sweep_interval: Duration,
    /// Remove dangling images (and containers on them) at the end of a sweep.
    pub prune: bool,
    /// First wait before re-subscribing to a lost engine stream; doubles per failure.
    pub resubscribe_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            prune: true,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }
}

/// Delivers every runtime event to each connected store.
#[derive(Clone, Default)]
pub struct Fanout {
    sinks: Vec<EventTx>,
}

impl Fanout {
    pub fn new(sinks: Vec<EventTx>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: EventTx) {
        self.sinks.push(sink);
    }

    /// Returns how many stores accepted the event.
    pub fn send(&self, event: Event) -> usize {
        self.sinks
            .iter()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }
}

struct PullEntry {
    state: ImagePullState,
    waiters: Vec<oneshot::Sender<bool>>,
}

pub struct Reconciler<E> {
    engine: Arc<E>,
    cfg: ReconcilerConfig,
    known: BTreeMap<ContainerName, RuntimeContainerRef>,
    pulling: HashMap<String, PullEntry>,
    /// Names the stores removed recently; a container coming up under one is discarded.
    withdrawn: HashMap<ContainerName, Instant>,
    revision: u64,
    sweeping: bool,
    events: Option<EngineEventRx>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl<E: ContainerEngine> Reconciler<E> {
    pub fn new(engine: Arc<E>, cfg: ReconcilerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            cfg,
            known: BTreeMap::new(),
            pulling: HashMap::new(),
            withdrawn: HashMap::new(),
            revision: 0,
            sweeping: false,
            events: None,
            cmd_tx,
            cmd_rx,
        }
    }

    pub fn handle(&self) -> ReconcilerHandle {
        ReconcilerHandle::new(self.cmd_tx.clone())
    }

    /// Subscribe to engine notifications, then register every existing container
    /// and announce it to the stores.
    pub async fn start(&mut self, out: &Fanout) -> Result<usize, ReconcileError> {
        self.events = Some(self.engine.events().await.map_err(ReconcileError::Startup)?);

        let containers = self
            .engine
            .list_containers(true)
            .await
            .map_err(ReconcileError::Startup)?;

        for c in &containers {
            let details = self
                .engine
                .inspect_container(&c.id)
                .await
                .map_err(ReconcileError::Startup)?;
            let entry = RuntimeContainerRef::from(details);
            debug!(name = %entry.name, id = %c.id, "inventoried container");
            out.send(Event::upsert(
                ContainerSpec::from_runtime(&entry),
                Origin::Runtime,
            ));
            self.known.insert(entry.name.clone(), entry);
        }

        info!(containers = containers.len(), "engine inventory complete");
        Ok(containers.len())
    }

    /// Serve until `shutdown` fires or every store hung up.
    pub async fn run(
        mut self,
        mut inbound: EventRx,
        out: Fanout,
        shutdown: CancellationToken,
    ) -> Result<(), ReconcileError> {
        let mut ticker = tokio::time::interval(self.cfg.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(interval = ?self.cfg.sweep_interval, "reconciler running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("shutdown requested");
                    return Ok(());
                }
                Some(cmd) = self.cmd_rx.recv() => self.on_command(cmd, &out),
                ev = next_engine_event(&mut self.events) => match ev {
                    Some(ev) => self.on_engine_event(ev, &out),
                    None => {
                        warn!("engine event stream ended; resubscribing");
                        self.events = None;
                        self.spawn_resubscribe();
                    }
                },
                msg = inbound.recv() => match msg {
                    Some(ev) => self.on_event(ev),
                    None => {
                        debug!("all stores disconnected");
                        return Ok(());
                    }
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }
    }

    fn on_event(&mut self, ev: Event) {
        if ev.origin() == Origin::Runtime {
            trace!(name = %ev.name(), "ignoring event produced by the runtime");
            return;
        }
        let name = ev.name().to_string();

        match ev.kind() {
            EventKind::Tombstone => {
                if self.known.remove(&name).is_some() {
                    info!(%name, "entry removed from desired state");
                }
                self.withdrawn.insert(name.clone(), Instant::now());
                self.spawn_kill(name);
            }
            EventKind::Upsert => {
                self.withdrawn.remove(&name);
                self.revision += 1;
                let desired = RuntimeContainerRef {
                    revision: self.revision,
                    ..RuntimeContainerRef::from_spec(ev.record())
                };
                let entry = match self.known.entry(name) {
                    btree_map::Entry::Occupied(mut o) => {
                        let entry = o.get_mut();
                        entry.update_from(desired);
                        entry.revision = self.revision;
                        entry.clone()
                    }
                    btree_map::Entry::Vacant(v) => v.insert(desired).clone(),
                };
                debug!(
                    name = %entry.name,
                    image = %entry.image,
                    revision = entry.revision,
                    "desired entry registered"
                );
                self.spawn_reconcile(entry);
            }
        }
    }

    fn on_engine_event(&mut self, ev: EngineEvent, out: &Fanout) {
        view::log_engine_event(&ev);

        match ev.status.as_str() {
            "start" => {
                if let Some(name) = ev.name.as_deref()
                    && let Some(entry) = self.known.get_mut(name)
                {
                    if entry.id.is_none() {
                        entry.id = Some(ev.id);
                    }
                    return;
                }
                if self.name_of(&ev.id).is_some() {
                    return;
                }
                self.spawn_inspect(ev.id);
            }
            "destroy" => {
                let Some(name) = self.name_of(&ev.id) else {
                    trace!(id = %ev.id, "destroyed container was not tracked");
                    return;
                };
                if self.known.get(&name).is_some_and(|r| r.protect) {
                    debug!(%name, id = %ev.id, "protected entry destroyed; not reported");
                    return;
                }
                self.known.remove(&name);
                info!(%name, id = %ev.id, "tracked container destroyed");
                out.send(Event::tombstone(name, Origin::Runtime));
            }
            _ => {}
        }
    }

    fn on_command(&mut self, cmd: Command, out: &Fanout) {
        match cmd {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.known.values().cloned().collect());
            }
            Command::AcquirePull { image, reply } => {
                let slot = match self.pulling.get_mut(&image) {
                    Some(entry) => {
                        let (tx, rx) = oneshot::channel();
                        entry.waiters.push(tx);
                        PullSlot::Wait(rx)
                    }
                    None => {
                        self.pulling.insert(
                            image.clone(),
                            PullEntry {
                                state: ImagePullState::Pulling,
                                waiters: Vec::new(),
                            },
                        );
                        PullSlot::Lead
                    }
                };
                // A leader that vanished before hearing back would block the image forever.
                if let Err(PullSlot::Lead) = reply.send(slot) {
                    self.release_pull(&image, false);
                }
            }
            Command::ReleasePull { image, ok } => self.release_pull(&image, ok),
            Command::PullsInFlight(reply) => {
                let n = self
                    .pulling
                    .values()
                    .filter(|p| p.state == ImagePullState::Pulling)
                    .count();
                let _ = reply.send(n);
            }
            Command::MayStart {
                name,
                revision,
                reply,
            } => {
                let current = self.known.get(&name).is_some_and(|r| r.revision == revision);
                let _ = reply.send(current);
            }
            Command::Register(entry) => {
                if self.is_withdrawn(&entry.name) {
                    info!(name = %entry.name, "container started under a removed name; discarding");
                    if let Some(id) = entry.id {
                        self.spawn_discard(entry.name, id);
                    }
                    return;
                }
                match self.known.entry(entry.name.clone()) {
                    btree_map::Entry::Occupied(mut o) => o.get_mut().update_from(entry),
                    btree_map::Entry::Vacant(v) => {
                        info!(name = %entry.name, "adopted container started outside the stores");
                        out.send(Event::upsert(
                            ContainerSpec::from_runtime(&entry),
                            Origin::Runtime,
                        ));
                        v.insert(entry);
                    }
                }
            }
            Command::RecordId { name, id, started } => match self.known.get_mut(&name) {
                Some(entry) => entry.id = Some(id),
                None if started => {
                    info!(%name, %id, "entry removed while its container came up; discarding");
                    self.spawn_discard(name, id);
                }
                None => trace!(%name, %id, "id for an entry no longer tracked"),
            },
            Command::Protect(id) => {
                if let Some(entry) = self
                    .known
                    .values_mut()
                    .find(|r| r.id.as_deref() == Some(id.as_str()))
                {
                    entry.protect = true;
                }
            }
            Command::Subscribed(rx) => {
                info!("engine notifications resubscribed");
                self.events = Some(rx);
            }
            Command::SweepDone => self.sweeping = false,
        }
    }

    fn on_tick(&mut self) {
        if self.sweeping {
            debug!("previous sweep still running; tick skipped");
            return;
        }
        // Every entry a sweep touches is protected from here on.
        for entry in self.known.values_mut() {
            entry.protect = true;
        }
        let horizon = self.cfg.sweep_interval;
        self.withdrawn.retain(|_, at| at.elapsed() < horizon);
        let snapshot: Vec<_> = self.known.values().cloned().collect();

        self.sweeping = true;
        tokio::spawn(sweep::run(
            Arc::clone(&self.engine),
            self.handle(),
            snapshot,
            self.cfg.prune,
        ));
    }

    fn release_pull(&mut self, image: &str, ok: bool) {
        if let Some(entry) = self.pulling.remove(image) {
            trace!(%image, ok, waiters = entry.waiters.len(), "pull released");
            for w in entry.waiters {
                let _ = w.send(ok);
            }
        }
    }

    fn is_withdrawn(&self, name: &str) -> bool {
        self.withdrawn
            .get(name)
            .is_some_and(|at| at.elapsed() < self.cfg.sweep_interval)
    }

    fn name_of(&self, id: &str) -> Option<ContainerName> {
        self.known
            .values()
            .find(|r| r.id.as_deref() == Some(id))
            .map(|r| r.name.clone())
    }

    fn spawn_reconcile(&self, entry: RuntimeContainerRef) {
        let engine = Arc::clone(&self.engine);
        let handle = self.handle();
        tokio::spawn(async move {
            match reconcile_one(engine.as_ref(), &handle, &entry).await {
                Ok(out) => handle.record(&entry.name, &out),
                Err(e) => warn!(name = %entry.name, error = %e, "reconcile failed"),
            }
        });
    }

    fn spawn_kill(&self, name: ContainerName) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let containers = match engine.list_containers(true).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(%name, error = %e, "cannot resolve container to kill");
                    return;
                }
            };
            match containers.into_iter().find(|c| c.has_name(&name)) {
                Some(c) if c.running => match engine.kill_container(&c.id).await {
                    Ok(()) => info!(%name, id = %c.id, "container killed"),
                    Err(e) => warn!(%name, id = %c.id, error = %e, "kill failed"),
                },
                Some(c) => debug!(%name, id = %c.id, "container already stopped"),
                None => debug!(%name, "no container to kill"),
            }
        });
    }

    fn spawn_discard(&self, name: ContainerName, id: ContainerId) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            match engine.remove_container(&id).await {
                Ok(()) => info!(%name, %id, "discarded container of removed entry"),
                Err(e) if e.is_not_found() => debug!(%name, %id, "container already gone"),
                Err(e) => warn!(%name, %id, error = %e, "discard failed"),
            }
        });
    }

    fn spawn_resubscribe(&self) {
        let engine = Arc::clone(&self.engine);
        let handle = self.handle();
        let mut delay = self.cfg.resubscribe_delay;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                if handle.is_closed() {
                    return;
                }
                match engine.events().await {
                    Ok(rx) => {
                        handle.subscribed(rx);
                        return;
                    }
                    Err(e) => {
                        delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
                        warn!(error = %e, retry_in = ?delay, "engine resubscribe failed");
                    }
                }
            }
        });
    }

    fn spawn_inspect(&self, id: String) {
        let engine = Arc::clone(&self.engine);
        let handle = self.handle();
        tokio::spawn(async move {
            match engine.inspect_container(&id).await {
                Ok(details) => handle.register(details.into()),
                Err(e) if e.is_not_found() => debug!(%id, "started container vanished"),
                Err(e) => warn!(%id, error = %e, "inspect failed"),
            }
        });
    }
}

async fn next_engine_event(rx: &mut Option<EngineEventRx>) -> Option<EngineEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{Outcome, PullGate, testing::MockEngine};

    struct Running {
        handle: ReconcilerHandle,
        to_reconciler: EventTx,
        from_reconciler: EventRx,
        shutdown: CancellationToken,
    }

    async fn spawn(engine: Arc<MockEngine>, cfg: ReconcilerConfig) -> (Running, usize) {
        let (to_reconciler, inbound) = mpsc::unbounded_channel();
        let (out_tx, from_reconciler) = mpsc::unbounded_channel();
        let out = Fanout::new(vec![out_tx]);

        let mut rec = Reconciler::new(engine, cfg);
        let n = rec.start(&out).await.unwrap();
        let handle = rec.handle();
        let shutdown = CancellationToken::new();
        tokio::spawn(rec.run(inbound, out, shutdown.clone()));

        (
            Running {
                handle,
                to_reconciler,
                from_reconciler,
                shutdown,
            },
            n,
        )
    }

    fn no_sweeps() -> ReconcilerConfig {
        ReconcilerConfig {
            sweep_interval: Duration::from_secs(3600),
            prune: true,
            ..Default::default()
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn tracked_id(handle: &ReconcilerHandle, name: &str) -> Option<String> {
        handle
            .snapshot()
            .await
            .into_iter()
            .find(|r| r.name == name)
            .and_then(|r| r.id)
    }

    #[tokio::test]
    async fn inventory_announces_existing_containers() {
        let engine = Arc::new(MockEngine::new());
        engine.add_image("redis:7");
        engine.add_container("cache", "redis:7", true);

        let (mut rt, n) = spawn(engine, no_sweeps()).await;
        assert_eq!(n, 1);

        let ev = rt.from_reconciler.recv().await.unwrap();
        assert_eq!(ev.kind(), EventKind::Upsert);
        assert_eq!(ev.origin(), Origin::Runtime);
        assert_eq!(ev.name(), "cache");
        assert!(ev.record().config.is_some());
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn failed_inventory_is_fatal() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_listing();
        let mut rec = Reconciler::new(engine, no_sweeps());
        let err = rec.start(&Fanout::default()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Startup(_)));
    }

    #[tokio::test]
    async fn store_upsert_creates_and_starts_once() {
        let engine = Arc::new(MockEngine::new());
        let (rt, _) = spawn(engine.clone(), no_sweeps()).await;

        rt.to_reconciler
            .send(Event::upsert(
                ContainerSpec::new("api", "acme/api:1.0"),
                Origin::Store,
            ))
            .unwrap();
        settle().await;

        let calls = engine.calls();
        assert_eq!(calls.create, vec!["api", "api"]);
        assert_eq!(calls.start.len(), 1);
        assert!(engine.is_running("api"));
        assert_eq!(tracked_id(&rt.handle, "api").await, Some(calls.start[0].clone()));

        // Same entry again: nothing mutates.
        rt.to_reconciler
            .send(Event::upsert(
                ContainerSpec::new("api", "acme/api:1.0"),
                Origin::Store,
            ))
            .unwrap();
        settle().await;
        assert_eq!(engine.calls(), calls);
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn runtime_origin_events_are_ignored() {
        let engine = Arc::new(MockEngine::new());
        let (rt, _) = spawn(engine.clone(), no_sweeps()).await;

        rt.to_reconciler
            .send(Event::upsert(ContainerSpec::new("api", "acme/api"), Origin::Runtime))
            .unwrap();
        settle().await;
        assert!(engine.calls().create.is_empty());
        assert!(rt.handle.snapshot().await.is_empty());
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn tombstone_forgets_and_kills() {
        let engine = Arc::new(MockEngine::new());
        let (rt, _) = spawn(engine.clone(), no_sweeps()).await;

        rt.to_reconciler
            .send(Event::upsert(ContainerSpec::new("web", "nginx"), Origin::Store))
            .unwrap();
        settle().await;
        assert!(engine.is_running("web"));

        rt.to_reconciler
            .send(Event::tombstone("web", Origin::Store))
            .unwrap();
        settle().await;

        assert!(rt.handle.snapshot().await.is_empty());
        assert!(!engine.is_running("web"));
        assert_eq!(engine.calls().kill.len(), 1);
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn tombstone_during_pull_keeps_container_down() {
        let engine = Arc::new(MockEngine::with_pull_delay(Duration::from_millis(100)));
        let (mut rt, _) = spawn(engine.clone(), no_sweeps()).await;

        rt.to_reconciler
            .send(Event::upsert(ContainerSpec::new("web", "nginx"), Origin::Store))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        rt.to_reconciler
            .send(Event::tombstone("web", Origin::Store))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let calls = engine.calls();
        assert!(calls.start.is_empty());
        assert_eq!(calls.remove.len(), 1);
        assert!(!engine.has_container("web"));
        assert!(rt.handle.snapshot().await.is_empty());
        assert!(rt.from_reconciler.try_recv().is_err());
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn start_under_removed_name_is_discarded() {
        let engine = Arc::new(MockEngine::new());
        let (mut rt, _) = spawn(engine.clone(), no_sweeps()).await;

        rt.to_reconciler
            .send(Event::tombstone("web", Origin::Store))
            .unwrap();
        settle().await;

        engine.add_image("nginx");
        let id = engine.add_container("web", "nginx", true);
        engine.emit(EngineEvent::new(&id, Some("/web"), "start")).await;
        settle().await;

        assert!(!engine.has_container("web"));
        assert_eq!(engine.calls().remove, vec![id]);
        assert!(rt.handle.snapshot().await.is_empty());
        assert!(rt.from_reconciler.try_recv().is_err());
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn late_start_report_for_forgotten_entry_is_discarded() {
        let engine = Arc::new(MockEngine::new());
        let (rt, _) = spawn(engine.clone(), no_sweeps()).await;

        engine.add_image("nginx");
        let id = engine.add_container("web", "nginx", true);
        rt.handle.record("web", &Outcome::Created(id.clone()));
        settle().await;

        assert!(!engine.has_container("web"));
        assert_eq!(engine.calls().remove, vec![id]);
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn upsert_after_tombstone_is_started_again() {
        let engine = Arc::new(MockEngine::new());
        let (rt, _) = spawn(engine.clone(), no_sweeps()).await;

        rt.to_reconciler
            .send(Event::tombstone("web", Origin::Store))
            .unwrap();
        rt.to_reconciler
            .send(Event::upsert(ContainerSpec::new("web", "nginx"), Origin::Store))
            .unwrap();
        settle().await;

        assert!(engine.is_running("web"));
        assert!(tracked_id(&rt.handle, "web").await.is_some());
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn lost_engine_stream_is_resubscribed() {
        let engine = Arc::new(MockEngine::new());
        engine.add_image("redis");
        let id = engine.add_container("cache", "redis", true);

        let cfg = ReconcilerConfig {
            resubscribe_delay: Duration::from_millis(10),
            ..no_sweeps()
        };
        let (mut rt, _) = spawn(engine.clone(), cfg).await;
        let _inventory = rt.from_reconciler.recv().await.unwrap();
        assert_eq!(engine.subscriptions(), 1);

        engine.drop_subscriber();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.subscriptions(), 2);

        engine.emit(EngineEvent::new(&id, Some("/cache"), "destroy")).await;
        let ev = tokio::time::timeout(Duration::from_secs(1), rt.from_reconciler.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(ev.is_tombstone());
        assert_eq!(ev.name(), "cache");
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn unprotected_destroy_emits_tombstone() {
        let engine = Arc::new(MockEngine::new());
        engine.add_image("redis");
        let id = engine.add_container("cache", "redis", true);

        let (mut rt, _) = spawn(engine.clone(), no_sweeps()).await;
        let _inventory = rt.from_reconciler.recv().await.unwrap();

        engine.emit(EngineEvent::new(&id, Some("/cache"), "destroy")).await;
        let ev = rt.from_reconciler.recv().await.unwrap();
        assert!(ev.is_tombstone());
        assert_eq!(ev.name(), "cache");
        assert!(rt.handle.snapshot().await.is_empty());
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn protected_destroy_is_not_reported() {
        let engine = Arc::new(MockEngine::new());
        engine.add_image("redis");
        let id = engine.add_container("cache", "redis", true);

        let (mut rt, _) = spawn(engine.clone(), no_sweeps()).await;
        let _inventory = rt.from_reconciler.recv().await.unwrap();

        rt.handle.protect(&id);
        engine.emit(EngineEvent::new(&id, Some("cache"), "destroy")).await;
        settle().await;

        assert!(rt.from_reconciler.try_recv().is_err());
        assert_eq!(rt.handle.snapshot().await.len(), 1);
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn untracked_start_is_adopted() {
        let engine = Arc::new(MockEngine::new());
        let (mut rt, _) = spawn(engine.clone(), no_sweeps()).await;

        engine.add_image("busybox");
        let id = engine.add_container("adhoc", "busybox", true);
        engine.emit(EngineEvent::new(&id, Some("/adhoc"), "start")).await;

        let ev = rt.from_reconciler.recv().await.unwrap();
        assert_eq!(ev.kind(), EventKind::Upsert);
        assert_eq!(ev.name(), "adhoc");
        assert_eq!(tracked_id(&rt.handle, "adhoc").await, Some(id));
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn concurrent_pulls_of_one_image_share_a_leader() {
        let engine = Arc::new(MockEngine::with_pull_delay(Duration::from_millis(50)));
        let (rt, _) = spawn(engine.clone(), no_sweeps()).await;

        for name in ["one", "two"] {
            rt.to_reconciler
                .send(Event::upsert(
                    ContainerSpec::new(name, "acme/base:latest"),
                    Origin::Store,
                ))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(engine.calls().pull, vec!["acme/base:latest"]);
        assert!(engine.is_running("one"));
        assert!(engine.is_running("two"));
        assert_eq!(rt.handle.pulls_in_flight().await, 0);
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn gate_parks_second_requester() {
        let engine = Arc::new(MockEngine::new());
        let (rt, _) = spawn(engine, no_sweeps()).await;

        assert!(matches!(rt.handle.acquire("acme/base:latest").await, PullSlot::Lead));
        let PullSlot::Wait(done) = rt.handle.acquire("acme/base:latest").await else {
            panic!("second requester must wait");
        };
        assert_eq!(rt.handle.pulls_in_flight().await, 1);

        rt.handle.release("acme/base:latest", true).await;
        assert_eq!(done.await, Ok(true));
        assert_eq!(rt.handle.pulls_in_flight().await, 0);
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn sweep_pulls_each_image_once_and_converges() {
        let engine = Arc::new(MockEngine::new());
        let (rt, _) = spawn(engine.clone(), no_sweeps()).await;

        rt.handle.register(RuntimeContainerRef::from_spec(&ContainerSpec::new(
            "one",
            "acme/base:latest",
        )));
        rt.handle.register(RuntimeContainerRef::from_spec(&ContainerSpec::new(
            "two",
            "acme/base",
        )));
        let snapshot = rt.handle.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        sweep::run(engine.clone(), rt.handle.clone(), snapshot, true).await;

        let calls = engine.calls();
        assert_eq!(calls.pull, vec!["acme/base:latest"]);
        let mut created = calls.create.clone();
        created.sort();
        assert_eq!(created, vec!["one", "two"]);
        assert!(engine.is_running("one") && engine.is_running("two"));
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn prune_removes_dangling_images_and_their_containers() {
        let engine = Arc::new(MockEngine::new());
        engine.add_untagged_image("sha256:old");
        engine.add_image("nginx");
        let stale = engine.add_container("web", "sha256:old", true);
        engine.add_container("fresh", "nginx", true);

        let (rt, _) = spawn(engine.clone(), no_sweeps()).await;
        sweep::prune_untagged(engine.as_ref(), &rt.handle).await;

        let calls = engine.calls();
        assert_eq!(calls.remove, vec![stale]);
        assert_eq!(calls.remove_image, vec!["sha256:old"]);
        assert!(engine.has_image("nginx"));
        assert!(engine.is_running("fresh"));
        rt.shutdown.cancel();
    }

    #[tokio::test]
    async fn tick_protects_every_entry() {
        let engine = Arc::new(MockEngine::new());
        engine.add_image("redis");
        let id = engine.add_container("cache", "redis", true);

        let cfg = ReconcilerConfig {
            sweep_interval: Duration::from_millis(30),
            prune: false,
            ..Default::default()
        };
        let (mut rt, _) = spawn(engine.clone(), cfg).await;
        let _inventory = rt.from_reconciler.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(rt.handle.snapshot().await.iter().all(|r| r.protect));
        engine.emit(EngineEvent::new(&id, Some("cache"), "destroy")).await;
        settle().await;
        assert!(rt.from_reconciler.try_recv().is_err());
        rt.shutdown.cancel();
    }
}
