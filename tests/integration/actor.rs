//! Actor-claims predicates guarding subscriptions.

use anyhow::Result;
use http::Response;
use serde_json::json;
use weft_connector::{handler_fn, Context, Req, SubOptions};
use weft_core::httpx::Body;

use crate::{fresh_plane, init_logging, start_connector};

fn claims() -> serde_json::Value {
    json!({
        "iss": "first_issuer",
        "roles": "admin,manager,user",
        "groups": ["sales", "engineering"],
        "super_user": true
    })
}

/// The predicate from the service gate evaluates against the caller's
/// claims: a manager from the right issuer passes, a director
/// requirement rejects with 403, and no claims at all reject too.
#[tokio::test]
async fn predicates_gate_handlers() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let srv = start_connector("guarded.fabric", &plane).await?;
    let caller = start_connector("caller.fabric", &plane).await?;

    srv.subscribe(
        "GET",
        "/managers",
        handler_fn(|_req| async { Ok(Response::new(Body::from("in"))) }),
        SubOptions::new().actor(
            "iss=='first_issuer' && super_user && groups.sales && !groups.hr && roles=~'manager'",
        ),
    )
    .await?;
    srv.subscribe(
        "GET",
        "/directors",
        handler_fn(|_req| async { Ok(Response::new(Body::from("in"))) }),
        SubOptions::new().actor("roles=~'director'"),
    )
    .await?;

    let res = caller
        .request(
            &Context::background(),
            Req::get("https://guarded.fabric/managers").actor(&claims())?,
        )
        .await?;
    assert_eq!(res.into_body().to_text(), "in");

    let err = caller
        .request(
            &Context::background(),
            Req::get("https://guarded.fabric/directors").actor(&claims())?,
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code, 403);

    let err = caller
        .request(&Context::background(), Req::get("https://guarded.fabric/managers"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code, 403);

    srv.shutdown().await?;
    caller.shutdown().await?;
    Ok(())
}

/// A malformed predicate is rejected when the subscription is created,
/// not at call time.
#[tokio::test]
async fn malformed_predicate_fails_subscribe() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let srv = start_connector("guarded.fabric", &plane).await?;

    let err = srv
        .subscribe(
            "GET",
            "/broken",
            handler_fn(|_req| async { Ok(Response::new(Body::empty())) }),
            SubOptions::new().actor("(true"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code, 400);

    srv.shutdown().await?;
    Ok(())
}

/// Claims attached to an inbound request flow onward to nested calls
/// without the intermediate service doing anything.
#[tokio::test]
async fn claims_propagate_through_nested_calls() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let front = start_connector("front.fabric", &plane).await?;
    let back = start_connector("back.fabric", &plane).await?;
    let caller = start_connector("caller.fabric", &plane).await?;

    back.subscribe(
        "GET",
        "/inner",
        handler_fn(|_req| async { Ok(Response::new(Body::from("deep"))) }),
        SubOptions::new().actor("groups.engineering"),
    )
    .await?;

    let front_clone = front.clone();
    front
        .subscribe(
            "GET",
            "/outer",
            handler_fn(move |req| {
                let conn = front_clone.clone();
                async move {
                    let ctx = Context::of(&req);
                    let res = conn.request(&ctx, Req::get("https://back.fabric/inner")).await?;
                    Ok(res)
                }
            }),
            SubOptions::new(),
        )
        .await?;

    let res = caller
        .request(
            &Context::background(),
            Req::get("https://front.fabric/outer").actor(&claims())?,
        )
        .await?;
    assert_eq!(res.into_body().to_text(), "deep");

    for c in [&front, &back, &caller] {
        c.shutdown().await?;
    }
    Ok(())
}
