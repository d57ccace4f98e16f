//! Transport — the hybrid short-circuit + broker message plane.
//!
//! Every connector in the process shares one subject trie (the
//! short-circuit plane); colocated subscribers are reached without
//! serialization. Anything that must cross process boundaries is
//! serialized as HTTP/1.1 text and published on NATS. Plane names baked
//! into subjects keep unrelated connector sets apart even though the
//! trie is process-wide.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;
use once_cell::sync::Lazy;
use rand::Rng;
use tokio::task::JoinHandle;

use weft_core::httpx::{codec, Body};
use weft_core::trie::{SubKey, SubjectTrie};
use weft_core::{Error, FabricConfig, Result};

/// Payload ceiling assumed when no broker advertises one.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// One inbound message. The transport carries exactly one of a request
/// object, a response object, or raw serialized bytes per delivery;
/// objects arrive only over the short-circuit, bytes over the broker or
/// when several local subscribers each need their own copy.
pub enum Delivery {
    Request(http::Request<Body>),
    Response(http::Response<Body>),
    Raw(Bytes),
}

impl Delivery {
    pub fn into_request(self) -> Result<http::Request<Body>> {
        match self {
            Delivery::Request(r) => Ok(r),
            Delivery::Raw(b) => codec::parse_request(b),
            Delivery::Response(_) => Err(Error::bad_request("expected a request delivery")),
        }
    }

    pub fn into_response(self) -> Result<http::Response<Body>> {
        match self {
            Delivery::Response(r) => Ok(r),
            Delivery::Raw(b) => codec::parse_response(b),
            Delivery::Request(_) => Err(Error::bad_request("expected a response delivery")),
        }
    }
}

/// One outbound message.
pub enum Outbound {
    Request(http::Request<Body>),
    Response(http::Response<Body>),
}

impl Outbound {
    fn to_wire(&self) -> Bytes {
        match self {
            Outbound::Request(r) => codec::write_request(r),
            Outbound::Response(r) => codec::write_response(r),
        }
    }

    fn into_delivery(self) -> Delivery {
        match self {
            Outbound::Request(r) => Delivery::Request(r),
            Outbound::Response(r) => Delivery::Response(r),
        }
    }
}

/// Subscriber callback. Must not block; long work is spawned.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// The process-wide short-circuit plane.
static LOCAL_PLANE: Lazy<SubjectTrie<DeliveryHandler>> = Lazy::new(SubjectTrie::new);

fn local_plane() -> &'static SubjectTrie<DeliveryHandler> {
    &LOCAL_PLANE
}

/// A live subscription on the transport.
pub struct TransportSub {
    pub subject: String,
    pub queue: String,
    trie_key: Option<SubKey>,
    broker_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A connector's link to the message plane.
pub struct Transport {
    client: Option<async_nats::Client>,
    short_circuit: bool,
    subs: Mutex<Vec<Arc<TransportSub>>>,
}

impl Transport {
    /// Open per configuration. An empty broker URL with short-circuit
    /// enabled yields a fully in-process transport.
    pub async fn open(cfg: &FabricConfig) -> Result<Transport> {
        if cfg.nats_url.is_empty() {
            if !cfg.short_circuit {
                return Err(Error::no_transport());
            }
            return Ok(Transport {
                client: None,
                short_circuit: true,
                subs: Mutex::new(Vec::new()),
            });
        }

        let mut opts = async_nats::ConnectOptions::new();
        if !cfg.nats_user.is_empty() {
            opts = opts.user_and_password(cfg.nats_user.clone(), cfg.nats_password.clone());
        }
        if !cfg.nats_token.is_empty() {
            opts = opts.token(cfg.nats_token.clone());
        }
        if !cfg.nats_ca.is_empty() {
            opts = opts.add_root_certificates(cfg.nats_ca.clone().into());
        }
        if !cfg.nats_cert.is_empty() && !cfg.nats_key.is_empty() {
            opts = opts
                .add_client_certificate(cfg.nats_cert.clone().into(), cfg.nats_key.clone().into());
        }
        let url = cfg.nats_url.clone();
        opts = opts.event_callback(move |event| {
            let url = url.clone();
            async move {
                match event {
                    async_nats::Event::Connected => {
                        tracing::info!(%url, "broker reconnected");
                    }
                    async_nats::Event::Disconnected => {
                        tracing::warn!(%url, "broker disconnected");
                    }
                    other => {
                        tracing::debug!(%url, event = %other, "broker event");
                    }
                }
            }
        });

        let client = opts
            .connect(cfg.nats_url.as_str())
            .await
            .map_err(|e| Error::newc(503, format!("broker connect: {e}")))?;
        tracing::info!(
            url = %cfg.nats_url,
            server_id = %client.server_info().server_id,
            "broker connected"
        );

        Ok(Transport {
            client: Some(client),
            short_circuit: cfg.short_circuit,
            subs: Mutex::new(Vec::new()),
        })
    }

    /// Broker-advertised payload ceiling; 1 MiB when in-process.
    pub fn max_payload(&self) -> usize {
        match &self.client {
            Some(c) => c.server_info().max_payload,
            None => DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn is_in_process(&self) -> bool {
        self.client.is_none()
    }

    /// Multicast. The broker is authoritative when connected — the
    /// short-circuit alone cannot reach remote subscribers, and local
    /// ones receive the broker's loopback.
    pub async fn publish(&self, subject: &str, msg: Outbound) -> Result<()> {
        if let Some(client) = &self.client {
            client
                .publish(subject.to_string(), msg.to_wire())
                .await
                .map_err(|e| Error::newc(503, format!("broker publish: {e}")))?;
            return Ok(());
        }
        if self.short_circuit {
            let handlers = local_plane().handlers(subject);
            deliver_local(handlers, msg);
            return Ok(());
        }
        Err(Error::no_transport())
    }

    /// Unicast request: one random local subscriber suffices; falls
    /// through to the broker when nobody local matches.
    pub async fn request(&self, subject: &str, msg: Outbound) -> Result<()> {
        if self.short_circuit {
            let mut handlers = local_plane().handlers(subject);
            if !handlers.is_empty() {
                let pick = rand::thread_rng().gen_range(0..handlers.len());
                let handler = handlers.swap_remove(pick);
                handler(msg.into_delivery());
                return Ok(());
            }
        }
        if let Some(client) = &self.client {
            client
                .publish(subject.to_string(), msg.to_wire())
                .await
                .map_err(|e| Error::newc(503, format!("broker publish: {e}")))?;
            return Ok(());
        }
        Err(Error::no_transport())
    }

    /// Unicast reply, same short-circuit-first logic as [`Transport::request`].
    pub async fn respond(&self, subject: &str, msg: Outbound) -> Result<()> {
        self.request(subject, msg).await
    }

    /// Pervasive subscription (queue = `""`).
    pub async fn subscribe(&self, subject: &str, handler: DeliveryHandler) -> Result<Arc<TransportSub>> {
        self.queue_subscribe(subject, "", handler).await
    }

    /// Subscribe under a queue group: exactly one subscription among all
    /// sharing `(subject, queue)` receives each message.
    pub async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        handler: DeliveryHandler,
    ) -> Result<Arc<TransportSub>> {
        let trie_key = if self.short_circuit {
            Some(local_plane().subscribe(subject, queue, handler.clone())?)
        } else {
            None
        };

        let broker_task = match &self.client {
            None => None,
            Some(client) => {
                let mut broker_sub = if queue.is_empty() {
                    client.subscribe(subject.to_string()).await
                } else {
                    client.queue_subscribe(subject.to_string(), queue.to_string()).await
                }
                .map_err(|e| Error::newc(503, format!("broker subscribe: {e}")))?;
                let handler = handler.clone();
                Some(tokio::spawn(async move {
                    // Dropping the subscriber on task abort unsubscribes
                    // on the client side.
                    while let Some(msg) = broker_sub.next().await {
                        handler(Delivery::Raw(msg.payload));
                    }
                }))
            }
        };

        let sub = Arc::new(TransportSub {
            subject: subject.to_string(),
            queue: queue.to_string(),
            trie_key,
            broker_task: Mutex::new(broker_task),
            closed: AtomicBool::new(false),
        });
        self.subs.lock().expect("transport subs lock").push(sub.clone());
        Ok(sub)
    }

    /// Tear one subscription down. Idempotent.
    pub fn unsubscribe(&self, sub: &Arc<TransportSub>) {
        self.detach(sub);
        self.subs
            .lock()
            .expect("transport subs lock")
            .retain(|s| !Arc::ptr_eq(s, sub));
    }

    fn detach(&self, sub: &Arc<TransportSub>) {
        if sub.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(key) = &sub.trie_key {
            local_plane().unsubscribe(key);
        }
        if let Some(task) = sub.broker_task.lock().expect("broker task lock").take() {
            task.abort();
        }
    }

    /// Unsubscribe anything still attached, then release the broker link.
    pub async fn close(&self) {
        let lingering: Vec<Arc<TransportSub>> =
            self.subs.lock().expect("transport subs lock").drain(..).collect();
        for sub in &lingering {
            self.detach(sub);
        }
        if let Some(client) = &self.client {
            if let Err(e) = client.flush().await {
                tracing::warn!(error = %e, "broker flush on close");
            }
        }
    }
}

/// Hand a message to local matches. A single match receives the object
/// itself (zero serialization); multiple matches each get a distinct
/// wrapper over one shared serialization.
fn deliver_local(mut handlers: Vec<DeliveryHandler>, msg: Outbound) {
    match handlers.len() {
        0 => {}
        1 => handlers.swap_remove(0)(msg.into_delivery()),
        _ => {
            let wire = msg.to_wire();
            for handler in handlers {
                handler(Delivery::Raw(wire.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use weft_core::httpx::Body;

    fn in_process() -> Transport {
        Transport { client: None, short_circuit: true, subs: Mutex::new(Vec::new()) }
    }

    fn counting_handler(hits: Arc<AtomicUsize>) -> DeliveryHandler {
        Arc::new(move |_d| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn request_msg() -> Outbound {
        let mut req = http::Request::new(Body::from("x"));
        *req.uri_mut() = "https://echo.test/x".parse().unwrap();
        Outbound::Request(req)
    }

    #[tokio::test]
    async fn publish_reaches_every_local_match() {
        let t = in_process();
        let hits = Arc::new(AtomicUsize::new(0));
        let s1 = t.subscribe("tp1.443.echo.|.GET.x", counting_handler(hits.clone())).await.unwrap();
        let s2 = t.subscribe("tp1.443.echo.|.GET.x", counting_handler(hits.clone())).await.unwrap();
        t.publish("tp1.443.echo.|.GET.x", request_msg()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        t.unsubscribe(&s1);
        t.unsubscribe(&s2);
    }

    #[tokio::test]
    async fn request_reaches_exactly_one() {
        let t = in_process();
        let hits = Arc::new(AtomicUsize::new(0));
        let _s1 = t
            .queue_subscribe("tp2.443.echo.|.GET.x", "echo", counting_handler(hits.clone()))
            .await
            .unwrap();
        let _s2 = t
            .queue_subscribe("tp2.443.echo.|.GET.x", "echo", counting_handler(hits.clone()))
            .await
            .unwrap();
        for _ in 0..5 {
            t.request("tp2.443.echo.|.GET.x", request_msg()).await.unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        t.close().await;
        assert!(local_plane().handlers("tp2.443.echo.|.GET.x").is_empty());
    }

    #[tokio::test]
    async fn no_match_and_no_broker_is_no_transport() {
        let t = in_process();
        let err = t.request("tp3.443.ghost.|.GET.x", request_msg()).await.unwrap_err();
        assert_eq!(err.status_code, 503);
    }

    #[tokio::test]
    async fn publish_to_nobody_is_fine() {
        let t = in_process();
        assert!(t.publish("tp4.443.ghost.|.GET.x", request_msg()).await.is_ok());
    }

    #[tokio::test]
    async fn close_unsubscribes_stragglers() {
        let t = in_process();
        let hits = Arc::new(AtomicUsize::new(0));
        let _s = t.subscribe("tp5.443.echo.|.GET.x", counting_handler(hits.clone())).await.unwrap();
        t.close().await;
        t.publish("tp5.443.echo.|.GET.x", request_msg()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
