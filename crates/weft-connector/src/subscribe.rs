//! Subscriptions — HTTP-ish handlers bound to host-qualified subjects.
//!
//! `subscribe("GET", "/obj/{id}", handler, opts)` derives the subject
//! from `(plane, port, reversed host, METHOD, path)` and registers the
//! handler. The default queue is the hostname, so replicas load-balance;
//! `pervasive()` removes the queue so every replica sees every message.
//!
//! Each subscription also carries an id-qualified twin subject
//! (`<id>.<host>`) used for direct addressing: continuation fragments of
//! a large request are sent there so they land on the instance that
//! received fragment 1.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use http::{Request, Response};

use weft_core::boolexpr::Expr;
use weft_core::httpx::{Body, PathPattern};
use weft_core::{subject, Error, Result};

use crate::connector::{Connector, LifecycleState};
use crate::transport::TransportSub;

/// An async request handler.
pub type HttpHandler = Arc<
    dyn Fn(Request<Body>) -> BoxFuture<'static, Result<Response<Body>>> + Send + Sync,
>;

/// Wrap an async closure into an [`HttpHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HttpHandler
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Response<Body>>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Options for [`Connector::subscribe`].
#[derive(Default, Clone)]
pub struct SubOptions {
    queue: Option<String>,
    pervasive: bool,
    actor: Option<String>,
    pub(crate) internal: bool,
}

impl SubOptions {
    pub fn new() -> SubOptions {
        SubOptions::default()
    }

    /// Load-balance under a custom queue instead of the hostname.
    pub fn queue(mut self, name: &str) -> SubOptions {
        self.queue = Some(name.to_string());
        self
    }

    /// No queue: every subscription receives every message.
    pub fn pervasive(mut self) -> SubOptions {
        self.pervasive = true;
        self
    }

    /// Gate the handler on a claims predicate; callers failing it get
    /// a 403 without the handler running.
    pub fn actor(mut self, expr: &str) -> SubOptions {
        self.actor = Some(expr.to_string());
        self
    }
}

/// A registered subscription.
pub struct Subscription {
    pub method: String,
    pub pattern: PathPattern,
    pub queue: String,
    pub(crate) actor_expr: Option<Expr>,
    pub(crate) internal: bool,
    pub(crate) handler: HttpHandler,
    pub(crate) live: Mutex<Vec<Arc<TransportSub>>>,
}

const METHODS: [&str; 8] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "*"];

impl Connector {
    /// Register a handler for `method path`. Returns the key accepted by
    /// [`Connector::unsubscribe`]. Fails fast on a duplicate route, a
    /// bad method, a malformed pattern, or an invalid actor predicate.
    pub async fn subscribe(
        &self,
        method: &str,
        path: &str,
        handler: HttpHandler,
        opts: SubOptions,
    ) -> Result<String> {
        let key = self.register(method, path, handler, opts)?;
        if self.state() == LifecycleState::Started {
            let sub = self
                .inner
                .subs
                .lock()
                .expect("subs lock")
                .get(&key)
                .cloned();
            if let Some(sub) = sub {
                if let Err(e) = self.activate(&sub).await {
                    self.inner.subs.lock().expect("subs lock").remove(&key);
                    return Err(e);
                }
            }
        }
        Ok(key)
    }

    /// Validate and record a subscription without touching the
    /// transport; startup activates everything recorded.
    pub(crate) fn register(
        &self,
        method: &str,
        path: &str,
        handler: HttpHandler,
        opts: SubOptions,
    ) -> Result<String> {
        let method = normalize_method(method)?;
        let pattern = PathPattern::parse(path)?;
        let queue = if opts.pervasive {
            String::new()
        } else {
            opts.queue.unwrap_or_else(|| self.hostname().to_string())
        };
        let actor_expr = match &opts.actor {
            None => None,
            Some(src) => {
                Some(Expr::parse(src).map_err(|e| Error::bad_request(e.to_string()))?)
            }
        };

        let key = format!("{method} {}", pattern.as_str());
        let sub = Arc::new(Subscription {
            method,
            pattern,
            queue,
            actor_expr,
            internal: opts.internal,
            handler,
            live: Mutex::new(Vec::new()),
        });

        let mut subs = self.inner.subs.lock().expect("subs lock");
        if subs.contains_key(&key) {
            return Err(Error::bad_request(format!("duplicate subscription '{key}'")));
        }
        subs.insert(key.clone(), sub);
        Ok(key)
    }

    /// Remove a subscription by its key. Idempotent.
    pub fn unsubscribe(&self, key: &str) -> Result<()> {
        let sub = self.inner.subs.lock().expect("subs lock").remove(key);
        if let Some(sub) = sub {
            self.deactivate(&sub);
        }
        Ok(())
    }

    pub(crate) async fn activate(&self, sub: &Arc<Subscription>) -> Result<()> {
        let active = self.active()?;
        let path = sub.pattern.subject_path();
        let main_subject = subject::for_request(
            &active.cfg.plane,
            subject::DEFAULT_PORT,
            self.hostname(),
            &sub.method,
            &path,
        );
        let direct_host = format!("{}.{}", self.id(), self.hostname());
        let direct_subject = subject::for_request(
            &active.cfg.plane,
            subject::DEFAULT_PORT,
            &direct_host,
            &sub.method,
            &path,
        );

        let handler = self.delivery_handler(sub.clone());
        let main = active.transport.queue_subscribe(&main_subject, &sub.queue, handler.clone()).await?;
        let twin = active.transport.subscribe(&direct_subject, handler).await?;
        let mut live = sub.live.lock().expect("subscription live lock");
        live.push(main);
        live.push(twin);
        tracing::debug!(
            host = self.hostname(),
            subject = %main_subject,
            queue = %sub.queue,
            "subscribed"
        );
        Ok(())
    }

    pub(crate) fn deactivate(&self, sub: &Arc<Subscription>) {
        let Ok(active) = self.active() else {
            return;
        };
        for ts in sub.live.lock().expect("subscription live lock").drain(..) {
            active.transport.unsubscribe(&ts);
        }
    }
}

fn normalize_method(method: &str) -> Result<String> {
    let m = method.to_uppercase();
    let m = if m == "ANY" { "*".to_string() } else { m };
    if METHODS.contains(&m.as_str()) {
        Ok(m)
    } else {
        Err(Error::bad_request(format!("invalid method '{method}'")))
    }
}
