//! Large payloads through the fragmentation pipeline.

use anyhow::Result;
use http::Response;
use weft_connector::{handler_fn, Context, Req, SubOptions};
use weft_core::httpx::Body;

use crate::{fresh_plane, init_logging, start_connector};

/// A 5 MB body crosses a 1 MiB payload ceiling in 768 KiB fragments,
/// is reassembled by the echo handler's connector, and the echoed
/// response survives the trip back byte for byte.
#[tokio::test]
async fn five_megabyte_echo() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let srv = start_connector("blob.fabric", &plane).await?;
    let caller = start_connector("caller.fabric", &plane).await?;

    srv.subscribe(
        "POST",
        "/echo",
        handler_fn(|req| async move { Ok(Response::new(req.into_body())) }),
        SubOptions::new(),
    )
    .await?;

    let payload: Vec<u8> = (0..5 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let res = caller
        .request(
            &Context::background(),
            Req::post("https://blob.fabric/echo").body(payload.clone()),
        )
        .await?;

    let echoed = res.into_body().to_bytes();
    assert_eq!(echoed.len(), payload.len());
    assert_eq!(echoed.as_ref(), &payload[..], "echoed body diverged");

    srv.shutdown().await?;
    caller.shutdown().await?;
    Ok(())
}

/// Fragmented requests reassemble on one replica even when several
/// share the queue: the continuation fragments chase fragment 1 to the
/// instance that acked it.
#[tokio::test]
async fn fragments_stick_to_one_replica() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let one = start_connector("blob.fabric", &plane).await?;
    let two = start_connector("blob.fabric", &plane).await?;
    let caller = start_connector("caller.fabric", &plane).await?;

    let echo = || {
        handler_fn(|req| async move {
            let len = req.body().len().to_string();
            Ok(Response::new(Body::from(len)))
        })
    };
    one.subscribe("POST", "/sum", echo(), SubOptions::new()).await?;
    two.subscribe("POST", "/sum", echo(), SubOptions::new()).await?;

    let payload = vec![7u8; 2 * 1024 * 1024];
    for _ in 0..4 {
        let res = caller
            .request(
                &Context::background(),
                Req::post("https://blob.fabric/sum").body(payload.clone()),
            )
            .await?;
        assert_eq!(res.into_body().to_text(), payload.len().to_string());
    }

    for c in [&one, &two, &caller] {
        c.shutdown().await?;
    }
    Ok(())
}
