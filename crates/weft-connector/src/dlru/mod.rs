//! Distributed LRU cache — one partition per connector, cooperating
//! across the replicas of a hostname.
//!
//! Elements are sharded by rendezvous hashing over the current peer
//! view; a store lands on the key's owner (and everywhere with
//! replication), a load falls back to one multicast round, and an
//! optional checksum round detects divergent copies and evicts them
//! everywhere. A leaving replica rescues its partition to the
//! survivors before its goodbye ping.
//!
//! All coordination rides ordinary fabric messaging on pervasive
//! subscriptions under `/dcache/<hostname>/<op>`; replicas of a
//! hostname all see every round, and the caller skips its own loopback
//! delivery by instance id.

pub mod codec;
pub mod local;
pub mod rendezvous;

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use weft_core::frame::Frame;
use weft_core::httpx::Body;
use weft_core::{Error, Result};

use crate::connector::Connector;
use crate::context::Context;
use crate::messaging::Req;
use crate::subscribe::{handler_fn, SubOptions};

use local::LocalCache;

/// Budget for one coordination round.
const ROUND_BUDGET: Duration = Duration::from_secs(1);

/// Hard cap on the whole rescue scan at shutdown.
const RESCUE_CAP: Duration = Duration::from_secs(20);

/// Rescue batch ceiling in value bytes.
const RESCUE_BATCH_BYTES: usize = 256 * 1024;

const OPS: [&str; 10] = [
    "store", "load", "delete", "clear", "weight", "len", "checksum", "rescue", "join", "leave",
];

/// Options for a distributed store.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    replicate: bool,
}

impl StoreOptions {
    pub fn new() -> StoreOptions {
        StoreOptions::default()
    }

    /// Keep a copy on every peer, not only the owner.
    pub fn replicate(mut self) -> StoreOptions {
        self.replicate = true;
        self
    }
}

/// Options for a distributed load.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    bump: bool,
    consistency_check: bool,
    max_age: Option<Duration>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions { bump: true, consistency_check: true, max_age: None }
    }
}

impl LoadOptions {
    pub fn new() -> LoadOptions {
        LoadOptions::default()
    }

    /// Read without refreshing recency.
    pub fn no_bump(mut self) -> LoadOptions {
        self.bump = false;
        self
    }

    /// Skip the peer checksum round.
    pub fn no_consistency_check(mut self) -> LoadOptions {
        self.consistency_check = false;
        self
    }

    /// Reject entries older than `limit`.
    pub fn max_age(mut self, limit: Duration) -> LoadOptions {
        self.max_age = Some(limit);
        self
    }
}

#[derive(Serialize, Deserialize)]
struct RescueEntry {
    k: String,
    /// Hex-encoded value bytes.
    v: String,
}

/// The cache partition hosted by one connector.
pub struct DistributedCache {
    pub(crate) local: LocalCache,
    peers: Mutex<HashSet<String>>,
}

impl DistributedCache {
    pub(crate) fn new() -> DistributedCache {
        DistributedCache { local: LocalCache::new(), peers: Mutex::new(HashSet::new()) }
    }

    /// Current replica view: known peers plus self, sorted.
    fn view(&self, conn: &Connector) -> Vec<String> {
        let mut view: Vec<String> =
            self.peers.lock().expect("peers lock").iter().cloned().collect();
        view.push(conn.id().to_string());
        view.sort();
        view.dedup();
        view
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.lock().expect("peers lock").len()
    }

    fn op_url(&self, conn: &Connector, op: &str, query: &[(&str, String)]) -> String {
        let host = conn.hostname();
        let mut url = url::Url::parse(&format!("https://{host}/dcache/{host}/{op}"))
            .expect("static cache url");
        for (name, value) in query {
            url.query_pairs_mut().append_pair(name, value);
        }
        url.to_string()
    }

    /// Apply a store per the ownership rule: owners and replicating
    /// peers keep the value, everyone else sheds any stale copy.
    fn apply_store(&self, conn: &Connector, key: &str, value: Bytes, replicate: bool) {
        let view = self.view(conn);
        let owner = rendezvous::owner(key, view.iter().map(String::as_str));
        if replicate || owner == Some(conn.id()) {
            self.local.store(key, value);
        } else {
            self.local.delete(key);
        }
    }

    // ── Distributed operations ───────────────────────────────────────────

    pub(crate) async fn store(
        &self,
        conn: &Connector,
        ctx: &Context,
        key: &str,
        value: Bytes,
        opts: StoreOptions,
    ) -> Result<()> {
        require_key(key)?;
        self.apply_store(conn, key, value.clone(), opts.replicate);
        let url = self.op_url(
            conn,
            "store",
            &[("key", key.to_string()), ("replicate", opts.replicate.to_string())],
        );
        let responses = conn
            .publish(ctx, Req::post(&url).body(value).budget(ROUND_BUDGET))
            .await?;
        drain(responses).await;
        Ok(())
    }

    pub(crate) async fn load(
        &self,
        conn: &Connector,
        ctx: &Context,
        key: &str,
        opts: LoadOptions,
    ) -> Result<Option<Bytes>> {
        require_key(key)?;
        let local_hit = self.local.load(key, opts.bump, opts.max_age);

        if !opts.consistency_check {
            if local_hit.is_some() {
                return Ok(local_hit);
            }
            return self.remote_load(conn, ctx, key, opts, None).await;
        }

        // Checksum round: every holder must agree before a value is
        // trusted.
        let mut digests: HashSet<String> = self.checksum_round(conn, ctx, key).await?;
        if let Some(v) = &local_hit {
            digests.insert(digest_hex(v));
        }
        match digests.len() {
            0 => Ok(None),
            1 => {
                if local_hit.is_some() {
                    return Ok(local_hit);
                }
                let expected = digests.into_iter().next();
                self.remote_load(conn, ctx, key, opts, expected).await
            }
            _ => {
                tracing::warn!(key, "cache copies disagree, evicting everywhere");
                self.delete(conn, ctx, key).await?;
                Ok(None)
            }
        }
    }

    async fn remote_load(
        &self,
        conn: &Connector,
        ctx: &Context,
        key: &str,
        opts: LoadOptions,
        expected_digest: Option<String>,
    ) -> Result<Option<Bytes>> {
        let mut query = vec![
            ("key", key.to_string()),
            ("bump", opts.bump.to_string()),
        ];
        if let Some(limit) = opts.max_age {
            query.push(("max_age_ms", limit.as_millis().to_string()));
        }
        let url = self.op_url(conn, "load", &query);
        let mut responses =
            conn.publish(ctx, Req::post(&url).budget(ROUND_BUDGET)).await?;
        while let Some(item) = responses.next().await {
            let res = match item {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(error = %e, key, "peer load failed");
                    continue;
                }
            };
            if res.status() != StatusCode::OK {
                continue;
            }
            let value = res.body().to_bytes();
            if let Some(expected) = &expected_digest {
                if digest_hex(&value) != *expected {
                    tracing::warn!(key, "peer returned a divergent copy, evicting everywhere");
                    self.delete(conn, ctx, key).await?;
                    return Ok(None);
                }
            }
            return Ok(Some(value));
        }
        Ok(None)
    }

    async fn checksum_round(
        &self,
        conn: &Connector,
        ctx: &Context,
        key: &str,
    ) -> Result<HashSet<String>> {
        let url = self.op_url(conn, "checksum", &[("key", key.to_string())]);
        let mut responses =
            conn.publish(ctx, Req::post(&url).budget(ROUND_BUDGET)).await?;
        let mut digests = HashSet::new();
        while let Some(item) = responses.next().await {
            if let Ok(res) = item {
                if res.status() == StatusCode::OK {
                    digests.insert(res.body().to_text());
                }
            }
        }
        Ok(digests)
    }

    pub(crate) async fn delete(&self, conn: &Connector, ctx: &Context, key: &str) -> Result<()> {
        require_key(key)?;
        self.local.delete(key);
        self.broadcast_simple(conn, ctx, "delete", &[("key", key.to_string())]).await
    }

    pub(crate) async fn delete_prefix(
        &self,
        conn: &Connector,
        ctx: &Context,
        prefix: &str,
    ) -> Result<()> {
        self.local.delete_prefix(prefix);
        self.broadcast_simple(conn, ctx, "delete", &[("prefix", prefix.to_string())]).await
    }

    pub(crate) async fn delete_contains(
        &self,
        conn: &Connector,
        ctx: &Context,
        needle: &str,
    ) -> Result<()> {
        self.local.delete_contains(needle);
        self.broadcast_simple(conn, ctx, "delete", &[("contains", needle.to_string())]).await
    }

    pub(crate) async fn clear(&self, conn: &Connector, ctx: &Context) -> Result<()> {
        self.local.clear();
        self.broadcast_simple(conn, ctx, "clear", &[]).await
    }

    /// Total weight across all replicas: local plus one round.
    pub(crate) async fn weight(&self, conn: &Connector, ctx: &Context) -> Result<u64> {
        let mut total = self.local.weight() as u64;
        total += self.numeric_round(conn, ctx, "weight").await?;
        Ok(total)
    }

    /// Total entries across all replicas.
    pub(crate) async fn len(&self, conn: &Connector, ctx: &Context) -> Result<u64> {
        let mut total = self.local.len() as u64;
        total += self.numeric_round(conn, ctx, "len").await?;
        Ok(total)
    }

    async fn numeric_round(&self, conn: &Connector, ctx: &Context, op: &str) -> Result<u64> {
        let url = self.op_url(conn, op, &[]);
        let mut responses =
            conn.publish(ctx, Req::post(&url).budget(ROUND_BUDGET)).await?;
        let mut total = 0u64;
        while let Some(item) = responses.next().await {
            if let Ok(res) = item {
                if res.status() == StatusCode::OK {
                    total += res.body().to_text().trim().parse::<u64>().unwrap_or(0);
                }
            }
        }
        Ok(total)
    }

    async fn broadcast_simple(
        &self,
        conn: &Connector,
        ctx: &Context,
        op: &str,
        query: &[(&str, String)],
    ) -> Result<()> {
        let url = self.op_url(conn, op, query);
        let responses = conn.publish(ctx, Req::post(&url).budget(ROUND_BUDGET)).await?;
        drain(responses).await;
        Ok(())
    }

    // ── Membership ───────────────────────────────────────────────────────

    /// Announce this replica and learn the peer set from the acks.
    pub(crate) async fn join(&self, conn: &Connector) {
        let url = self.op_url(conn, "join", &[]);
        match conn.publish(&Context::background(), Req::post(&url).budget(ROUND_BUDGET)).await {
            Err(e) => tracing::warn!(error = %e, "cache join ping failed"),
            Ok(mut responses) => {
                let mut found = HashSet::new();
                while let Some(item) = responses.next().await {
                    if let Ok(res) = item {
                        let frame = Frame::of(res.headers());
                        if res.status() == StatusCode::OK {
                            if let Some(from) = frame.from_id() {
                                if from != conn.id() {
                                    found.insert(from.to_string());
                                }
                            }
                        }
                    }
                }
                let mut peers = self.peers.lock().expect("peers lock");
                peers.extend(found);
            }
        }
        self.reseed_responders(conn);
        tracing::debug!(
            host = conn.hostname(),
            id = conn.id(),
            peers = self.peer_count(),
            "cache partition joined"
        );
    }

    /// Rescue the partition to the survivors, then say goodbye.
    pub(crate) async fn rescue_and_leave(&self, conn: &Connector) {
        let survivors = self.peer_count();
        let snapshot = self.local.snapshot();
        if survivors > 0 && !snapshot.is_empty() {
            let rescued = snapshot.len();
            match tokio::time::timeout(RESCUE_CAP, self.rescue(conn, snapshot)).await {
                Ok(()) => {
                    tracing::info!(entries = rescued, "cache partition rescued");
                }
                Err(_) => {
                    tracing::warn!(entries = rescued, "cache rescue hit its time cap");
                }
            }
        }
        self.local.clear();

        let url = self.op_url(conn, "leave", &[]);
        match conn.publish(&Context::background(), Req::post(&url).budget(ROUND_BUDGET)).await {
            Ok(responses) => drain(responses).await,
            Err(e) => tracing::debug!(error = %e, "cache leave ping failed"),
        }
        self.peers.lock().expect("peers lock").clear();
    }

    async fn rescue(&self, conn: &Connector, snapshot: Vec<(String, Bytes)>) {
        let mut batch: Vec<RescueEntry> = Vec::new();
        let mut batch_bytes = 0usize;
        for (key, value) in snapshot {
            batch_bytes += value.len();
            batch.push(RescueEntry { k: key, v: hex::encode(&value) });
            if batch_bytes >= RESCUE_BATCH_BYTES {
                self.send_rescue_batch(conn, std::mem::take(&mut batch)).await;
                batch_bytes = 0;
            }
        }
        if !batch.is_empty() {
            self.send_rescue_batch(conn, batch).await;
        }
    }

    async fn send_rescue_batch(&self, conn: &Connector, batch: Vec<RescueEntry>) {
        let url = self.op_url(conn, "rescue", &[]);
        let req = match Req::post(&url).budget(ROUND_BUDGET).json(&batch) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "rescue batch serialization failed");
                return;
            }
        };
        match conn.publish(&Context::background(), req).await {
            Ok(responses) => drain(responses).await,
            Err(e) => tracing::warn!(error = %e, "rescue batch send failed"),
        }
    }

    /// Seed the known-responder sets of every cache subject so rounds
    /// complete as soon as all replicas acked instead of waiting out
    /// the budget.
    fn reseed_responders(&self, conn: &Connector) {
        let Ok(active) = conn.active() else {
            return;
        };
        let mut set: HashSet<String> =
            self.peers.lock().expect("peers lock").iter().cloned().collect();
        set.insert(conn.id().to_string());
        let host = conn.hostname();
        for op in OPS {
            let subject = weft_core::subject::for_request(
                &active.cfg.plane,
                weft_core::subject::DEFAULT_PORT,
                host,
                "POST",
                &format!("/dcache/{host}/{op}"),
            );
            conn.inner.responders.insert(subject, set.clone());
        }
    }
}

fn require_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::bad_request("missing key"));
    }
    Ok(())
}

fn digest_hex(value: &Bytes) -> String {
    hex::encode(blake3::hash(value).as_bytes())
}

async fn drain(mut responses: crate::messaging::Responses) {
    while responses.next().await.is_some() {}
}

// ── Inbound op handlers ──────────────────────────────────────────────────────

/// Register the partition's subscriptions on its connector. Called at
/// startup before subscription activation.
pub(crate) fn register_subscriptions(conn: &Connector) -> Result<()> {
    for op in OPS {
        let host = conn.hostname().to_string();
        let path = format!("/dcache/{host}/{op}");
        let handler = {
            let conn = conn.clone();
            handler_fn(move |req| {
                let conn = conn.clone();
                async move { handle_op(conn, op, req).await }
            })
        };
        let mut opts = SubOptions::new().pervasive();
        opts.internal = true;
        conn.register("POST", &path, handler, opts)?;
    }
    Ok(())
}

async fn handle_op(conn: Connector, op: &'static str, req: Request<Body>) -> Result<Response<Body>> {
    let frame = Frame::of(req.headers());
    let from = frame.from_id().unwrap_or("").to_string();
    if from == conn.id() {
        // Own loopback: the caller already applied the operation.
        return Ok(status_only(StatusCode::NO_CONTENT));
    }
    let cache = &conn.inner.cache;
    let query = query_map(req.uri());
    let get = |name: &str| query.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());

    match op {
        "store" => {
            let key = get("key").unwrap_or_default();
            require_key(&key)?;
            let replicate = get("replicate").as_deref() == Some("true");
            cache.apply_store(&conn, &key, req.body().to_bytes(), replicate);
            Ok(status_only(StatusCode::OK))
        }
        "load" => {
            let key = get("key").unwrap_or_default();
            require_key(&key)?;
            let bump = get("bump").as_deref() != Some("false");
            let max_age = get("max_age_ms")
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis);
            match cache.local.load(&key, bump, max_age) {
                Some(value) => Ok(body_response(Body::from(value))),
                None => Ok(status_only(StatusCode::NOT_FOUND)),
            }
        }
        "checksum" => {
            let key = get("key").unwrap_or_default();
            require_key(&key)?;
            match cache.local.load(&key, false, None) {
                Some(value) => Ok(body_response(Body::from(digest_hex(&value)))),
                None => Ok(status_only(StatusCode::NOT_FOUND)),
            }
        }
        "delete" => {
            if let Some(key) = get("key") {
                cache.local.delete(&key);
            } else if let Some(prefix) = get("prefix") {
                cache.local.delete_prefix(&prefix);
            } else if let Some(needle) = get("contains") {
                cache.local.delete_contains(&needle);
            } else {
                return Err(Error::bad_request("delete without key, prefix, or contains"));
            }
            Ok(status_only(StatusCode::OK))
        }
        "clear" => {
            cache.local.clear();
            Ok(status_only(StatusCode::OK))
        }
        "weight" => Ok(body_response(Body::from(cache.local.weight().to_string()))),
        "len" => Ok(body_response(Body::from(cache.local.len().to_string()))),
        "rescue" => {
            let entries: Vec<RescueEntry> = serde_json::from_slice(&req.body().to_bytes())?;
            // The rescuer is leaving: ownership is decided over the
            // surviving view.
            let mut view = cache.view(&conn);
            view.retain(|id| id != &from);
            for entry in entries {
                let owner = rendezvous::owner(&entry.k, view.iter().map(String::as_str));
                if owner == Some(conn.id()) {
                    match hex::decode(&entry.v) {
                        Ok(raw) => cache.local.store(&entry.k, Bytes::from(raw)),
                        Err(e) => {
                            tracing::warn!(key = %entry.k, error = %e, "bad rescue payload")
                        }
                    }
                }
            }
            Ok(status_only(StatusCode::OK))
        }
        "join" => {
            cache.peers.lock().expect("peers lock").insert(from);
            cache.reseed_responders(&conn);
            Ok(status_only(StatusCode::OK))
        }
        "leave" => {
            cache.peers.lock().expect("peers lock").remove(&from);
            cache.reseed_responders(&conn);
            Ok(status_only(StatusCode::OK))
        }
        other => Err(Error::bad_request(format!("unknown cache op '{other}'"))),
    }
}

fn status_only(status: StatusCode) -> Response<Body> {
    let mut rec = weft_core::httpx::ResponseRecorder::new();
    rec.set_status(status);
    rec.into_response()
}

fn body_response(body: Body) -> Response<Body> {
    Response::new(body)
}

fn query_map(uri: &http::Uri) -> Vec<(String, String)> {
    let Some(q) = uri.query() else {
        return Vec::new();
    };
    form_urlencoded_pairs(q)
}

fn form_urlencoded_pairs(q: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(q.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

// ── Public face on the connector ─────────────────────────────────────────────

/// Borrowed handle for cache calls: `conn.cache().store(...)`.
pub struct Cache<'a> {
    conn: &'a Connector,
}

impl Connector {
    pub fn cache(&self) -> Cache<'_> {
        Cache { conn: self }
    }
}

impl Cache<'_> {
    pub async fn store(
        &self,
        ctx: &Context,
        key: &str,
        value: impl Into<Bytes>,
        opts: StoreOptions,
    ) -> Result<()> {
        self.conn.inner.cache.store(self.conn, ctx, key, value.into(), opts).await
    }

    pub async fn load(&self, ctx: &Context, key: &str, opts: LoadOptions) -> Result<Option<Bytes>> {
        self.conn.inner.cache.load(self.conn, ctx, key, opts).await
    }

    pub async fn delete(&self, ctx: &Context, key: &str) -> Result<()> {
        self.conn.inner.cache.delete(self.conn, ctx, key).await
    }

    pub async fn delete_prefix(&self, ctx: &Context, prefix: &str) -> Result<()> {
        self.conn.inner.cache.delete_prefix(self.conn, ctx, prefix).await
    }

    pub async fn delete_contains(&self, ctx: &Context, needle: &str) -> Result<()> {
        self.conn.inner.cache.delete_contains(self.conn, ctx, needle).await
    }

    pub async fn clear(&self, ctx: &Context) -> Result<()> {
        self.conn.inner.cache.clear(self.conn, ctx).await
    }

    pub async fn weight(&self, ctx: &Context) -> Result<u64> {
        self.conn.inner.cache.weight(self.conn, ctx).await
    }

    pub async fn len(&self, ctx: &Context) -> Result<u64> {
        self.conn.inner.cache.len(self.conn, ctx).await
    }

    /// Entries held by this replica alone, without a round.
    pub fn local_len(&self) -> usize {
        self.conn.inner.cache.local.len()
    }

    pub fn local_weight(&self) -> usize {
        self.conn.inner.cache.local.weight()
    }

    /// Adjust this replica's weight budget.
    pub fn set_max_weight(&self, max_weight: usize) {
        self.conn.inner.cache.local.set_max_weight(max_weight);
    }
}
