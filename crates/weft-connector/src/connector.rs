//! Connector — one running instance of a microservice on the fabric.
//!
//! A connector owns the identity (hostname, random instance id,
//! version), the lifecycle state machine, the transport link, the
//! subscription set, the distributed cache partition, and the task
//! carriers bound to its lifetime.
//!
//! State machine: `NEW → STARTING → STARTED → SHUTTING_DOWN →
//! TERMINATED`. `startup` is a no-op once started, `shutdown` once
//! stopped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use http::Request;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use weft_core::fragment::Defrag;
use weft_core::httpx::Body;
use weft_core::{subject, Deployment, Error, FabricConfig, Result};

use crate::dlru::DistributedCache;
use crate::stats::Counters;
use crate::subscribe::Subscription;
use crate::transport::Transport;

/// Callback bound to a lifecycle edge. Startup hooks run after the
/// connector joined the fabric; a failing one aborts the startup.
pub type LifecycleHook =
    std::sync::Arc<dyn Fn(Connector) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Requests nested deeper than this are broken as cycles.
pub const MAX_CALL_DEPTH: u32 = 32;

/// Budget applied when the caller sets no deadline.
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(20);

/// How long shutdown waits for spawned tasks before aborting them.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Defrag caretaker cadence and the idle cutoff for abandoned sets.
const DEFRAG_SCAN_INTERVAL: Duration = Duration::from_secs(15);
const DEFRAG_MAX_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    New,
    Starting,
    Started,
    ShuttingDown,
    Terminated,
}

pub(crate) struct Active {
    pub transport: Transport,
    pub cfg: FabricConfig,
}

pub(crate) struct Inner {
    pub hostname: String,
    pub id: String,
    pub version: AtomicU32,
    pub cfg: Mutex<FabricConfig>,
    pub state: Mutex<LifecycleState>,
    pub active: Mutex<Option<Arc<Active>>>,
    pub subs: Mutex<HashMap<String, Arc<Subscription>>>,
    /// Known responders per multicast subject.
    pub responders: DashMap<String, std::collections::HashSet<String>>,
    pub req_defrag: Defrag<Request<Body>>,
    pub tasks: Mutex<Vec<JoinHandle<()>>>,
    pub tickers: Mutex<HashMap<String, JoinHandle<()>>>,
    pub shutdown_tx: watch::Sender<bool>,
    pub cache: DistributedCache,
    pub counters: Counters,
    pub on_startup: Mutex<Vec<LifecycleHook>>,
    pub on_shutdown: Mutex<Vec<LifecycleHook>>,
}

/// Handle to a connector; clones share the instance.
#[derive(Clone)]
pub struct Connector {
    pub(crate) inner: Arc<Inner>,
}

impl Connector {
    /// A new connector for `hostname`, configured from the environment.
    /// Identity id is a fresh random hex string.
    pub fn new(hostname: &str) -> Result<Connector> {
        subject::validate_host(hostname)?;
        let cfg = FabricConfig::from_env()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Connector {
            inner: Arc::new(Inner {
                hostname: hostname.to_string(),
                id: crate::messaging::new_id(),
                version: AtomicU32::new(0),
                cfg: Mutex::new(cfg),
                state: Mutex::new(LifecycleState::New),
                active: Mutex::new(None),
                subs: Mutex::new(HashMap::new()),
                responders: DashMap::new(),
                req_defrag: Defrag::new(),
                tasks: Mutex::new(Vec::new()),
                tickers: Mutex::new(HashMap::new()),
                shutdown_tx,
                cache: DistributedCache::new(),
                counters: Counters::default(),
                on_startup: Mutex::new(Vec::new()),
                on_shutdown: Mutex::new(Vec::new()),
            }),
        })
    }

    // ── Identity ─────────────────────────────────────────────────────────

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn version(&self) -> u32 {
        self.inner.version.load(Ordering::Relaxed)
    }

    pub fn plane(&self) -> String {
        match self.inner.active.lock().expect("active lock").as_ref() {
            Some(a) => a.cfg.plane.clone(),
            None => self.inner.cfg.lock().expect("cfg lock").plane.clone(),
        }
    }

    pub fn deployment(&self) -> Deployment {
        match self.inner.active.lock().expect("active lock").as_ref() {
            Some(a) => a.cfg.deployment,
            None => self.inner.cfg.lock().expect("cfg lock").deployment,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock().expect("state lock")
    }

    /// Observed-false until shutdown begins; tasks spawned with
    /// [`Connector::go`] should watch it.
    pub fn lifetime(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    // ── Pre-startup configuration ────────────────────────────────────────

    pub fn set_version(&self, version: u32) -> &Self {
        self.inner.version.store(version, Ordering::Relaxed);
        self
    }

    /// Replace the environment-derived configuration. Fails once
    /// started.
    pub fn set_config(&self, cfg: FabricConfig) -> Result<&Self> {
        if self.state() != LifecycleState::New {
            return Err(Error::new("configuration is fixed after startup"));
        }
        cfg.validate()?;
        *self.inner.cfg.lock().expect("cfg lock") = cfg;
        Ok(self)
    }

    pub fn set_plane(&self, plane: &str) -> Result<&Self> {
        subject::validate_plane(plane)?;
        self.inner.cfg.lock().expect("cfg lock").plane = plane.to_string();
        Ok(self)
    }

    pub fn set_deployment(&self, deployment: Deployment) -> &Self {
        self.inner.cfg.lock().expect("cfg lock").deployment = deployment;
        self
    }

    pub fn set_locality(&self, locality: &str) -> &Self {
        self.inner.cfg.lock().expect("cfg lock").locality = locality.to_string();
        self
    }

    /// Run `hook` at the end of startup, once the fabric is joined.
    pub fn set_on_startup(&self, hook: LifecycleHook) -> &Self {
        self.inner.on_startup.lock().expect("hooks lock").push(hook);
        self
    }

    /// Run `hook` first thing at shutdown, while still fully serving.
    pub fn set_on_shutdown(&self, hook: LifecycleHook) -> &Self {
        self.inner.on_shutdown.lock().expect("hooks lock").push(hook);
        self
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Join the fabric: open the transport, activate subscriptions,
    /// announce the cache partition. No-op when already started.
    pub async fn startup(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            match *state {
                LifecycleState::New | LifecycleState::Terminated => {
                    *state = LifecycleState::Starting;
                }
                LifecycleState::Started | LifecycleState::Starting => return Ok(()),
                LifecycleState::ShuttingDown => {
                    return Err(Error::new("startup during shutdown"));
                }
            }
        }

        match self.startup_inner().await {
            Ok(()) => {
                *self.inner.state.lock().expect("state lock") = LifecycleState::Started;
                tracing::info!(
                    host = self.hostname(),
                    id = self.id(),
                    plane = %self.plane(),
                    version = self.version(),
                    "connector started"
                );
                Ok(())
            }
            Err(e) => {
                if let Some(active) = self.inner.active.lock().expect("active lock").take() {
                    active.transport.close().await;
                }
                // The cache partition re-registers on the next attempt.
                self.inner.subs.lock().expect("subs lock").retain(|_, s| !s.internal);
                *self.inner.state.lock().expect("state lock") = LifecycleState::New;
                Err(e.trace())
            }
        }
    }

    async fn startup_inner(&self) -> Result<()> {
        let cfg = self.inner.cfg.lock().expect("cfg lock").clone();
        cfg.validate()?;
        self.inner.shutdown_tx.send_replace(false);

        let transport = Transport::open(&cfg).await?;
        *self.inner.active.lock().expect("active lock") =
            Some(Arc::new(Active { transport, cfg }));

        // The cache partition's own subscriptions, before activation.
        crate::dlru::register_subscriptions(self)?;

        let subs: Vec<Arc<Subscription>> = {
            self.inner.subs.lock().expect("subs lock").values().cloned().collect()
        };
        for sub in subs {
            self.activate(&sub).await?;
        }

        self.inner.cache.join(self).await;
        self.spawn_defrag_caretaker();

        let hooks: Vec<LifecycleHook> =
            self.inner.on_startup.lock().expect("hooks lock").clone();
        for hook in hooks {
            hook(self.clone()).await.map_err(|e| e.context("startup hook"))?;
        }
        Ok(())
    }

    /// Leave the fabric: rescue the cache partition, stop tickers,
    /// drain tasks, unsubscribe, close the broker link. No-op when not
    /// started.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            if *state != LifecycleState::Started {
                return Ok(());
            }
            *state = LifecycleState::ShuttingDown;
        }
        tracing::info!(host = self.hostname(), id = self.id(), "connector shutting down");

        let hooks: Vec<LifecycleHook> =
            self.inner.on_shutdown.lock().expect("hooks lock").clone();
        for hook in hooks {
            if let Err(e) = hook(self.clone()).await {
                tracing::warn!(error = %e, "shutdown hook failed");
            }
        }

        // Application subscriptions go first so no new work arrives
        // while the cache partition is still reachable for rescue.
        let (app_subs, internal_subs): (Vec<_>, Vec<_>) = {
            let mut subs = self.inner.subs.lock().expect("subs lock");
            let all: Vec<Arc<Subscription>> = subs.drain().map(|(_, s)| s).collect();
            all.into_iter().partition(|s| !s.internal)
        };
        for sub in &app_subs {
            self.deactivate(sub);
        }

        self.inner.cache.rescue_and_leave(self).await;

        for (_, ticker) in self.inner.tickers.lock().expect("tickers lock").drain() {
            ticker.abort();
        }

        let _ = self.inner.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> =
            self.inner.tasks.lock().expect("tasks lock").drain(..).collect();
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }

        for sub in &internal_subs {
            self.deactivate(sub);
        }
        if let Some(active) = self.inner.active.lock().expect("active lock").take() {
            active.transport.close().await;
        }
        self.inner.responders.clear();

        *self.inner.state.lock().expect("state lock") = LifecycleState::Terminated;
        tracing::info!(host = self.hostname(), id = self.id(), "connector terminated");
        Ok(())
    }

    pub(crate) fn active(&self) -> Result<Arc<Active>> {
        self.inner
            .active
            .lock()
            .expect("active lock")
            .clone()
            .ok_or_else(Error::no_transport)
    }

    fn spawn_defrag_caretaker(&self) {
        let conn = self.clone();
        let mut lifetime = self.lifetime();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + DEFRAG_SCAN_INTERVAL;
            let mut scan = tokio::time::interval_at(start, DEFRAG_SCAN_INTERVAL);
            loop {
                tokio::select! {
                    _ = scan.tick() => {
                        for msg_id in conn.inner.req_defrag.purge_idle(DEFRAG_MAX_IDLE) {
                            tracing::warn!(msg_id, "abandoned fragment set discarded");
                        }
                    }
                    _ = lifetime.changed() => break,
                }
            }
        });
        self.inner.tasks.lock().expect("tasks lock").push(handle);
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("hostname", &self.inner.hostname)
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
