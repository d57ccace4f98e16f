//! Runtime surface: tickers, the virtual clock, lifetime-bound tasks,
//! route captures, lifecycle hooks, and counters.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use http::Response;
use serde_json::json;
use weft_connector::{handler_fn, path_args, Context, Req, SubOptions};
use weft_core::frame::FrameMut;
use weft_core::httpx::{read_json, Body};
use weft_core::{Deployment, FabricConfig};

use crate::{fresh_plane, init_logging, start_connector, test_config};

/// Tickers fire on their interval while started and stop at shutdown.
#[tokio::test]
async fn tickers_run_and_stop() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let conn = start_connector("tick.fabric", &plane).await?;

    let fired = Arc::new(AtomicU32::new(0));
    let counter = fired.clone();
    conn.start_ticker(
        "pulse",
        Duration::from_millis(50),
        Arc::new(move |_ctx| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }),
    )?;
    // Duplicate names are rejected.
    assert!(conn
        .start_ticker("pulse", Duration::from_millis(50), Arc::new(|_| Box::pin(async { Ok(()) })))
        .is_err());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let seen = fired.load(Ordering::SeqCst);
    assert!(seen >= 3, "ticker fired only {seen} times");
    assert!(conn.stats().ticker_runs >= u64::from(seen));

    conn.shutdown().await?;
    let frozen = fired.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), frozen, "ticker survived shutdown");
    Ok(())
}

/// `now(ctx)` honors the frame's clock shift outside PROD and ignores
/// it under PROD.
#[tokio::test]
async fn clock_shift_is_deployment_gated() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let testing = start_connector("clock.fabric", &plane).await?;

    let mut req = http::Request::new(Body::empty());
    FrameMut::of(req.headers_mut()).set_clock_shift_ms(3_600_000);
    let ctx = Context::of(&req);

    let skew = testing
        .now(&ctx)
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    assert!(skew > Duration::from_secs(3590), "shift not applied: {skew:?}");

    let prod = weft_connector::Connector::new("clock.fabric")?;
    prod.set_config(FabricConfig {
        deployment: Deployment::Prod,
        ..test_config(&fresh_plane())
    })?;
    let skew = prod
        .now(&ctx)
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    assert!(skew < Duration::from_secs(10), "PROD honored a clock shift");

    testing.shutdown().await?;
    Ok(())
}

/// `go` tasks drain at shutdown; `parallel` surfaces the first error.
#[tokio::test]
async fn go_and_parallel() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let conn = start_connector("work.fabric", &plane).await?;

    let done = Arc::new(AtomicU32::new(0));
    let flag = done.clone();
    let mut lifetime = conn.lifetime();
    conn.go(async move {
        let _ = lifetime.changed().await;
        flag.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let touched = Arc::new(AtomicU32::new(0));
    let jobs: Vec<futures::future::BoxFuture<'static, weft_core::Result<()>>> = (0..4)
        .map(|i| {
            let touched = touched.clone();
            let job: futures::future::BoxFuture<'static, weft_core::Result<()>> =
                Box::pin(async move {
                    touched.fetch_add(1, Ordering::SeqCst);
                    if i == 2 {
                        Err(weft_core::Error::newc(418, "job 2 spilled"))
                    } else {
                        Ok(())
                    }
                });
            job
        })
        .collect();
    let err = conn.parallel(jobs).await.unwrap_err();
    assert_eq!(err.status_code, 418);
    assert_eq!(touched.load(Ordering::SeqCst), 4, "parallel must run every job");

    conn.shutdown().await?;
    assert_eq!(done.load(Ordering::SeqCst), 1, "go task did not observe shutdown");
    Ok(())
}

/// Route captures reach the handler through the request extensions.
#[tokio::test]
async fn path_captures_reach_handlers() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let srv = start_connector("routes.fabric", &plane).await?;
    let caller = start_connector("caller.fabric", &plane).await?;

    srv.subscribe(
        "GET",
        "/obj/{id}/child/{sub}",
        handler_fn(|req| async move {
            let args = path_args(&req);
            let body = format!("{}/{}", args.get("id").unwrap_or(""), args.get("sub").unwrap_or(""));
            Ok(Response::new(Body::from(body)))
        }),
        SubOptions::new(),
    )
    .await?;

    let res = caller
        .request(&Context::background(), Req::get("https://routes.fabric/obj/42/child/leg"))
        .await?;
    assert_eq!(res.into_body().to_text(), "42/leg");

    srv.shutdown().await?;
    caller.shutdown().await?;
    Ok(())
}

/// A deep-object query built by the caller decodes on the serving side.
#[tokio::test]
async fn deep_object_queries_round_trip() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let srv = start_connector("query.fabric", &plane).await?;
    let caller = start_connector("caller.fabric", &plane).await?;

    srv.subscribe(
        "POST",
        "/filter",
        handler_fn(|req| async move {
            let body: serde_json::Value = read_json(&req)?;
            let query = req.uri().query().unwrap_or("").to_string();
            let decoded = weft_core::httpx::query::decode(&query)?;
            let out = json!({"body": body, "query": decoded});
            Ok(Response::new(Body::from(serde_json::to_vec(&out)?)))
        }),
        SubOptions::new(),
    )
    .await?;

    let res = caller
        .request(
            &Context::background(),
            Req::post("https://query.fabric/filter")
                .query_obj(&json!({"filter": {"age": {"gte": 21}}}))
                .json(&json!({"page": 2}))?,
        )
        .await?;
    let v: serde_json::Value = serde_json::from_slice(&res.into_body().to_bytes())?;
    assert_eq!(v["query"]["filter"]["age"]["gte"], 21);
    assert_eq!(v["body"]["page"], 2);

    srv.shutdown().await?;
    caller.shutdown().await?;
    Ok(())
}

/// Lifecycle hooks run on their edges, and counters move with traffic.
#[tokio::test]
async fn hooks_and_counters() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let conn = weft_connector::Connector::new("hooked.fabric")?;
    conn.set_config(test_config(&plane))?;

    let edges = Arc::new(AtomicU32::new(0));
    let up = edges.clone();
    conn.set_on_startup(Arc::new(move |_c| {
        let up = up.clone();
        Box::pin(async move {
            up.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }));
    let down = edges.clone();
    conn.set_on_shutdown(Arc::new(move |_c| {
        let down = down.clone();
        Box::pin(async move {
            down.fetch_add(10, Ordering::SeqCst);
            Ok(())
        })
    }));

    conn.startup().await?;
    assert_eq!(edges.load(Ordering::SeqCst), 1);

    conn.subscribe(
        "GET",
        "/ping",
        handler_fn(|_req| async { Ok(Response::new(Body::from("pong"))) }),
        SubOptions::new(),
    )
    .await?;
    let caller = start_connector("caller.fabric", &plane).await?;
    caller.request(&Context::background(), Req::get("https://hooked.fabric/ping")).await?;

    assert!(conn.stats().inbound_served >= 1);
    assert!(caller.stats().outbound_requests >= 1);

    conn.shutdown().await?;
    assert_eq!(edges.load(Ordering::SeqCst), 11);
    caller.shutdown().await?;
    Ok(())
}
