//! weft integration harness.
//!
//! End-to-end scenarios over the in-process short-circuit plane — no
//! broker required. The subject trie is process-global, so every test
//! runs on a plane of its own to stay isolated from its neighbors.
//!
//!   cargo test --test integration

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use weft_connector::Connector;
use weft_core::{Deployment, FabricConfig};

mod actor;
mod cache;
mod messaging;
mod payloads;
mod runtime;

static PLANE_SEQ: AtomicU64 = AtomicU64::new(1);

/// A plane name no other test shares.
pub fn fresh_plane() -> String {
    format!("it{}", PLANE_SEQ.fetch_add(1, Ordering::SeqCst))
}

pub fn test_config(plane: &str) -> FabricConfig {
    FabricConfig {
        plane: plane.to_string(),
        deployment: Deployment::Testing,
        short_circuit: true,
        ..FabricConfig::default()
    }
}

/// A started connector on the given plane.
pub async fn start_connector(hostname: &str, plane: &str) -> Result<Connector> {
    let conn = Connector::new(hostname)?;
    conn.set_config(test_config(plane))?;
    conn.startup().await?;
    Ok(conn)
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
