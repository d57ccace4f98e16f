//! Unicast round-trips and multicast fan-in.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use http::Response;
use weft_connector::{handler_fn, Context, Req, SubOptions};
use weft_core::httpx::Body;

use crate::{fresh_plane, init_logging, start_connector};

/// Two subscribers answer `GET /echo` on one hostname; five unicasts
/// each land on exactly one of them, and both serve at least once.
#[tokio::test]
async fn unicast_round_trip() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let alpha = start_connector("echo.fabric", &plane).await?;
    let beta = start_connector("echo.fabric", &plane).await?;
    let caller = start_connector("caller.fabric", &plane).await?;

    // Same hostname, same (default) queue: the ring at the subject
    // round-robins the two replicas.
    alpha
        .subscribe(
            "GET",
            "/echo",
            handler_fn(|_req| async { Ok(Response::new(Body::from("A"))) }),
            SubOptions::new(),
        )
        .await?;
    beta.subscribe(
        "GET",
        "/echo",
        handler_fn(|_req| async { Ok(Response::new(Body::from("B"))) }),
        SubOptions::new(),
    )
    .await?;

    let mut seen = Vec::new();
    for _ in 0..5 {
        let res = caller
            .request(&Context::background(), Req::get("https://echo.fabric/echo"))
            .await?;
        seen.push(res.into_body().to_text());
    }

    assert_eq!(seen.len(), 5);
    for body in &seen {
        assert!(body == "A" || body == "B", "unexpected body {body}");
    }
    let distinct: HashSet<&String> = seen.iter().collect();
    assert_eq!(distinct.len(), 2, "both subscribers must serve at least once: {seen:?}");

    for c in [&alpha, &beta, &caller] {
        c.shutdown().await?;
    }
    Ok(())
}

/// A multicast reaches both subscribers; the stream ends by itself once
/// every known responder acked.
#[tokio::test]
async fn multicast_fan_in() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let alpha = start_connector("echo.fabric", &plane).await?;
    let beta = start_connector("echo.fabric", &plane).await?;
    let caller = start_connector("caller.fabric", &plane).await?;

    alpha
        .subscribe(
            "GET",
            "/echo",
            handler_fn(|_req| async { Ok(Response::new(Body::from("A"))) }),
            SubOptions::new().pervasive(),
        )
        .await?;
    beta.subscribe(
        "GET",
        "/echo",
        handler_fn(|_req| async { Ok(Response::new(Body::from("B"))) }),
        SubOptions::new().pervasive(),
    )
    .await?;

    // Discovery round: the first multicast to a subject waits out its
    // whole budget while the responder set is learned.
    let warmup = caller
        .publish(
            &Context::background(),
            Req::get("https://echo.fabric/echo").budget(Duration::from_millis(800)),
        )
        .await?;
    assert_eq!(warmup.collect().await?.len(), 2);

    // Known-responders round: terminates deterministically on the acks.
    let started = std::time::Instant::now();
    let mut responses = caller
        .publish(&Context::background(), Req::get("https://echo.fabric/echo"))
        .await?;
    let mut bodies = Vec::new();
    while let Some(item) = responses.next().await {
        bodies.push(item?.into_body().to_text());
    }
    bodies.sort();
    assert_eq!(bodies, vec!["A", "B"]);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "known-responder multicast should not wait out the full budget"
    );

    for c in [&alpha, &beta, &caller] {
        c.shutdown().await?;
    }
    Ok(())
}

/// Handler errors cross the wire with their status preserved, and a
/// handler panic comes back as an error response instead of silence.
#[tokio::test]
async fn errors_and_panics_come_back() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let srv = start_connector("flaky.fabric", &plane).await?;
    let caller = start_connector("caller.fabric", &plane).await?;

    srv.subscribe(
        "GET",
        "/teapot",
        handler_fn(|_req| async { Err(weft_core::Error::newc(418, "short and stout")) }),
        SubOptions::new(),
    )
    .await?;
    srv.subscribe(
        "GET",
        "/boom",
        handler_fn(|_req| async { panic!("kaboom") }),
        SubOptions::new(),
    )
    .await?;

    let err = caller
        .request(&Context::background(), Req::get("https://flaky.fabric/teapot"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code, 418);
    assert_eq!(err.message, "short and stout");

    let err = caller
        .request(
            &Context::background(),
            Req::get("https://flaky.fabric/boom").budget(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();
    assert!(err.message.contains("kaboom"), "got: {}", err.message);

    srv.shutdown().await?;
    caller.shutdown().await?;
    Ok(())
}

/// Requests to a host nobody serves fail with "no transport" on an
/// in-process plane.
#[tokio::test]
async fn unserved_host_is_no_transport() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let caller = start_connector("caller.fabric", &plane).await?;
    let err = caller
        .request(&Context::background(), Req::get("https://ghost.fabric/x"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code, 503);
    caller.shutdown().await?;
    Ok(())
}

/// Baggage set by the caller arrives on the served request.
#[tokio::test]
async fn baggage_flows_downstream() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let srv = start_connector("bag.fabric", &plane).await?;
    let caller = start_connector("caller.fabric", &plane).await?;

    srv.subscribe(
        "GET",
        "/peek",
        handler_fn(|req| async move {
            let tenant = weft_core::Frame::of(req.headers())
                .baggage("tenant")
                .unwrap_or("")
                .to_string();
            Ok(Response::new(Body::from(tenant)))
        }),
        SubOptions::new(),
    )
    .await?;

    let res = caller
        .request(
            &Context::background(),
            Req::get("https://bag.fabric/peek").baggage("tenant", "acme"),
        )
        .await?;
    assert_eq!(res.into_body().to_text(), "acme");

    srv.shutdown().await?;
    caller.shutdown().await?;
    Ok(())
}
