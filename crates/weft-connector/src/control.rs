//! Lifetime-bound concurrency: task carriers, parallel batches,
//! tickers, and the virtual clock.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;

use weft_core::{Deployment, Error, Result};

use crate::connector::{Connector, LifecycleState};
use crate::context::Context;

/// Periodic callback run by [`Connector::start_ticker`].
pub type TickerHandler =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<()>> + Send + Sync>;

impl Connector {
    /// Spawn a task bound to the connector lifetime. Shutdown signals
    /// [`Connector::lifetime`], waits out the grace window, then aborts
    /// what remains. Errors are logged, not propagated.
    pub fn go<F>(&self, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let host = self.hostname().to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::warn!(host, error = %e, "background task failed");
            }
        });
        self.inner.tasks.lock().expect("tasks lock").push(handle);
    }

    /// Run a batch of jobs concurrently; wait for all, surface the
    /// first error.
    pub async fn parallel(&self, jobs: Vec<BoxFuture<'static, Result<()>>>) -> Result<()> {
        let results = futures::future::join_all(jobs).await;
        for r in results {
            r?;
        }
        Ok(())
    }

    /// Run `handler` every `interval` while the connector is started.
    /// Each run gets the interval as its budget; runs never overlap.
    pub fn start_ticker(
        &self,
        name: &str,
        interval: Duration,
        handler: TickerHandler,
    ) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::bad_request("ticker interval must be positive"));
        }
        {
            let tickers = self.inner.tickers.lock().expect("tickers lock");
            if tickers.contains_key(name) {
                return Err(Error::bad_request(format!("duplicate ticker '{name}'")));
            }
        }

        let conn = self.clone();
        let mut lifetime = self.lifetime();
        let ticker_name = name.to_string();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut tick = tokio::time::interval_at(start, interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if conn.state() != LifecycleState::Started {
                            continue;
                        }
                        crate::stats::Counters::bump(&conn.inner.counters.ticker_runs);
                        let ctx = Context::background().with_timeout(interval);
                        let run = tokio::time::timeout(interval, handler(ctx));
                        match run.await {
                            Err(_) => {
                                tracing::warn!(ticker = %ticker_name, "ticker run overran its interval");
                            }
                            Ok(Err(e)) => {
                                tracing::warn!(ticker = %ticker_name, error = %e, "ticker run failed");
                            }
                            Ok(Ok(())) => {}
                        }
                    }
                    _ = lifetime.changed() => break,
                }
            }
        });
        self.inner.tickers.lock().expect("tickers lock").insert(name.to_string(), handle);
        Ok(())
    }

    /// Stop one ticker by name. Idempotent.
    pub fn stop_ticker(&self, name: &str) {
        if let Some(handle) = self.inner.tickers.lock().expect("tickers lock").remove(name) {
            handle.abort();
        }
    }

    /// The current time as the ambient frame sees it: wall clock plus
    /// the frame's clock shift. Shifts are test scaffolding and are
    /// ignored under a PROD deployment.
    pub fn now(&self, ctx: &Context) -> SystemTime {
        let now = SystemTime::now();
        let shift = ctx.frame().clock_shift_ms();
        if shift == 0 || self.deployment() == Deployment::Prod {
            return now;
        }
        if shift > 0 {
            now + Duration::from_millis(shift as u64)
        } else {
            now - Duration::from_millis(shift.unsigned_abs())
        }
    }

    /// Sleep up to `d`, clipped by the context deadline.
    pub async fn sleep(&self, ctx: &Context, d: Duration) {
        match ctx.deadline() {
            Some(deadline) => {
                let until = deadline.min(tokio::time::Instant::now() + d);
                tokio::time::sleep_until(until).await;
            }
            None => tokio::time::sleep(d).await,
        }
    }
}
