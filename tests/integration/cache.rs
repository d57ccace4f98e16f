//! Distributed cache scenarios: sharded store/load, deletion, and the
//! rescue of a leaving replica's partition.

use anyhow::Result;
use bytes::Bytes;
use weft_connector::{Connector, Context, LoadOptions, StoreOptions};

use crate::{fresh_plane, init_logging, start_connector};

async fn cache_peers(plane: &str, n: usize) -> Result<Vec<Connector>> {
    let mut peers = Vec::new();
    for _ in 0..n {
        peers.push(start_connector("vault.fabric", plane).await?);
    }
    Ok(peers)
}

/// One peer stores without replication; the element lands on its owner
/// yet every peer can load it, and a delete from any peer removes it
/// for all.
#[tokio::test]
async fn store_load_delete_across_three_peers() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let peers = cache_peers(&plane, 3).await?;
    let (alpha, beta, gamma) = (&peers[0], &peers[1], &peers[2]);
    let ctx = Context::background();

    alpha.cache().store(&ctx, "A", Bytes::from_static(b"AAA"), StoreOptions::new()).await?;

    for peer in [alpha, beta, gamma] {
        let got = peer.cache().load(&ctx, "A", LoadOptions::new()).await?;
        assert_eq!(got.as_deref(), Some(&b"AAA"[..]), "load failed on {}", peer.id());
    }

    // Exactly one replica holds the unreplicated copy.
    let copies: usize = peers.iter().map(|p| p.cache().local_len()).sum();
    assert_eq!(copies, 1);

    gamma.cache().delete(&ctx, "A").await?;
    for peer in [alpha, beta, gamma] {
        let got = peer.cache().load(&ctx, "A", LoadOptions::new()).await?;
        assert!(got.is_none(), "stale copy on {}", peer.id());
    }

    for peer in &peers {
        peer.shutdown().await?;
    }
    Ok(())
}

/// Replicated stores land everywhere and aggregate counts see one
/// logical entry per replica.
#[tokio::test]
async fn replicated_store_is_everywhere() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let peers = cache_peers(&plane, 3).await?;
    let ctx = Context::background();

    peers[0]
        .cache()
        .store(&ctx, "shared", Bytes::from_static(b"xyz"), StoreOptions::new().replicate())
        .await?;

    for peer in &peers {
        assert_eq!(peer.cache().local_len(), 1, "replica {} missing copy", peer.id());
        let got = peer.cache().load(&ctx, "shared", LoadOptions::new()).await?;
        assert_eq!(got.as_deref(), Some(&b"xyz"[..]));
    }
    assert_eq!(peers[0].cache().len(&ctx).await?, 3);
    assert_eq!(peers[0].cache().weight(&ctx).await?, 9);

    for peer in &peers {
        peer.shutdown().await?;
    }
    Ok(())
}

/// A shutdown replica rescues its whole partition: the survivors end up
/// holding all 2048 entries between them, and every key still loads
/// from either survivor.
#[tokio::test]
async fn rescue_on_shutdown() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let alpha = start_connector("vault.fabric", &plane).await?;
    let ctx = Context::background();

    // Alone on the plane, alpha owns everything it stores.
    for i in 0..2048 {
        alpha
            .cache()
            .store(&ctx, &i.to_string(), Bytes::from(format!("value-{i}")), StoreOptions::new())
            .await?;
    }
    assert_eq!(alpha.cache().local_len(), 2048);

    let beta = start_connector("vault.fabric", &plane).await?;
    let gamma = start_connector("vault.fabric", &plane).await?;

    alpha.shutdown().await?;

    let survivors = beta.cache().local_len() + gamma.cache().local_len();
    assert_eq!(survivors, 2048, "rescue lost entries");
    assert!(beta.cache().local_len() > 0, "rendezvous starved beta");
    assert!(gamma.cache().local_len() > 0, "rendezvous starved gamma");

    for i in 0..2048 {
        let key = i.to_string();
        let expected = format!("value-{i}");
        for peer in [&beta, &gamma] {
            let got = peer.cache().load(&ctx, &key, LoadOptions::new()).await?;
            assert_eq!(
                got.as_deref(),
                Some(expected.as_bytes()),
                "key {key} unreachable from {}",
                peer.id()
            );
        }
    }

    beta.shutdown().await?;
    gamma.shutdown().await?;
    Ok(())
}

/// Prefix and substring deletions apply on every peer, and an empty key
/// is rejected outright.
#[tokio::test]
async fn targeted_deletions_and_bad_input() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let peers = cache_peers(&plane, 2).await?;
    let ctx = Context::background();

    let opts = StoreOptions::new().replicate();
    peers[0].cache().store(&ctx, "user:1", Bytes::from_static(b"a"), opts).await?;
    peers[0].cache().store(&ctx, "user:2", Bytes::from_static(b"b"), opts).await?;
    peers[0].cache().store(&ctx, "group:9", Bytes::from_static(b"c"), opts).await?;

    peers[1].cache().delete_prefix(&ctx, "user:").await?;
    assert!(peers[0].cache().load(&ctx, "user:1", LoadOptions::new()).await?.is_none());
    assert!(peers[0].cache().load(&ctx, "group:9", LoadOptions::new()).await?.is_some());

    peers[0].cache().delete_contains(&ctx, "oup").await?;
    assert!(peers[1].cache().load(&ctx, "group:9", LoadOptions::new()).await?.is_none());

    let err = peers[0]
        .cache()
        .store(&ctx, "", Bytes::from_static(b"x"), StoreOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.message, "missing key");
    let err = peers[0].cache().load(&ctx, "", LoadOptions::new()).await.unwrap_err();
    assert_eq!(err.message, "missing key");

    for peer in &peers {
        peer.shutdown().await?;
    }
    Ok(())
}

/// JSON and compressed-JSON layers round-trip through the distributed
/// byte cache.
#[tokio::test]
async fn json_layers_round_trip() -> Result<()> {
    init_logging();
    let plane = fresh_plane();
    let peers = cache_peers(&plane, 2).await?;
    let ctx = Context::background();

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Doc {
        name: String,
        count: u32,
    }
    let doc = Doc { name: "weft".into(), count: 7 };

    peers[0]
        .cache()
        .store_json(&ctx, "doc", &doc, StoreOptions::new().replicate())
        .await?;
    let back: Option<Doc> = peers[1].cache().load_json(&ctx, "doc", LoadOptions::new()).await?;
    assert_eq!(back, Some(Doc { name: "weft".into(), count: 7 }));

    peers[1]
        .cache()
        .store_compressed_json(&ctx, "zdoc", &doc, StoreOptions::new().replicate())
        .await?;
    let back: Option<Doc> =
        peers[0].cache().load_compressed_json(&ctx, "zdoc", LoadOptions::new()).await?;
    assert_eq!(back, Some(Doc { name: "weft".into(), count: 7 }));

    for peer in &peers {
        peer.shutdown().await?;
    }
    Ok(())
}
