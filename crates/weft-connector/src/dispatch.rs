//! Inbound dispatch — from transport delivery to handler to reply.
//!
//! Arriving chunks defragment per message id. A complete request is
//! checked (call-depth cap, actor predicate), served inside a tracing
//! span with panic recovery and the frame's time budget, and the
//! response — or the traced error with `Op-Code: Err` — travels back
//! fragmented on the reply subject. Responders finish with an
//! empty-body `Op-Code: Ack` so multicast callers can terminate early.

use std::sync::Arc;

use futures::FutureExt;
use http::{Request, Response, StatusCode};
use tracing::Instrument;

use weft_core::frame::{Frame, FrameMut, OpCode};
use weft_core::fragment::fragment;
use weft_core::httpx::{Body, ResponseRecorder};
use weft_core::{subject, Error, Result};

use crate::connector::{Connector, DEFAULT_TIME_BUDGET, MAX_CALL_DEPTH};
use crate::messaging::frag_budget;
use crate::stats::Counters;
use crate::subscribe::Subscription;
use crate::transport::{Delivery, DeliveryHandler, Outbound};

/// Values captured by a route template, e.g. `{id}` in `/obj/{id}`.
/// Stashed in the request extensions before the handler runs.
#[derive(Debug, Clone, Default)]
pub struct PathArgs(Vec<(String, String)>);

impl PathArgs {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// The route-template captures of a request being served.
pub fn path_args(req: &http::Request<Body>) -> PathArgs {
    req.extensions().get::<PathArgs>().cloned().unwrap_or_default()
}

impl Connector {
    /// The transport-facing callback for one subscription. Work is
    /// spawned so the transport never blocks on a handler.
    pub(crate) fn delivery_handler(&self, sub: Arc<Subscription>) -> DeliveryHandler {
        let conn = self.clone();
        Arc::new(move |delivery| {
            let conn = conn.clone();
            let sub = sub.clone();
            tokio::spawn(async move {
                conn.receive_request(delivery, sub).await;
            });
        })
    }

    async fn receive_request(&self, delivery: Delivery, sub: Arc<Subscription>) {
        let req = match delivery.into_request() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request dropped");
                return;
            }
        };
        let frame = Frame::of(req.headers());
        let Some(msg_id) = frame.msg_id().map(str::to_string) else {
            tracing::warn!("request without message id dropped");
            return;
        };
        let from_id = frame.from_id().unwrap_or("").to_string();
        let (index, max) = frame.fragment();
        let reply_subject = subject::for_reply(&self.plane(), &msg_id);

        // First chunk of a large request: ack now so the sender learns
        // which instance to stream the remaining fragments to.
        if max > 1 && index == 1 {
            self.send_ack(&reply_subject, &msg_id).await;
        }

        let defrag_key = format!("{msg_id}|{from_id}");
        let integrated = match self.inner.req_defrag.add(&defrag_key, req) {
            Ok(Some(r)) => r,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, msg_id, "fragment rejected");
                return;
            }
        };
        self.dispatch(integrated, sub, &reply_subject, &msg_id).await;
    }

    /// Call-depth cap: requests nested deeper than 32 hops are treated
    /// as a cycle and broken here.
    async fn dispatch(
        &self,
        req: Request<Body>,
        sub: Arc<Subscription>,
        reply_subject: &str,
        msg_id: &str,
    ) {
        let span = tracing::info_span!(
            "dispatch",
            host = self.hostname(),
            method = %req.method(),
            route = sub.pattern.as_str(),
            msg_id,
        );
        let result = self.serve(req, &sub).instrument(span).await;

        let counters = &self.inner.counters;
        let mut res = match result {
            Ok(res) => {
                Counters::bump(&counters.inbound_served);
                res
            }
            Err(e) => {
                Counters::bump(&counters.inbound_failed);
                error_response(&e)
            }
        };
        self.stamp_response(res.headers_mut(), msg_id, OpCode::Res, &sub.queue);
        self.send_response(reply_subject, res).await;
        self.send_ack(reply_subject, msg_id).await;
    }

    async fn serve(&self, mut req: Request<Body>, sub: &Arc<Subscription>) -> Result<Response<Body>> {
        if let Some(args) = sub.pattern.extract(req.uri().path()) {
            req.extensions_mut().insert(PathArgs(args));
        }
        let frame = Frame::of(req.headers());

        let depth = frame.call_depth();
        if depth > MAX_CALL_DEPTH {
            return Err(Error::cycle(depth));
        }

        if let Some(expr) = &sub.actor_expr {
            let pass = frame.if_actor_expr(expr)?;
            if !pass {
                return Err(Error::forbidden());
            }
        }

        let budget = frame.time_budget();
        let budget = if budget.is_zero() { DEFAULT_TIME_BUDGET } else { budget };

        let handler = sub.handler.clone();
        let outcome =
            std::panic::AssertUnwindSafe(tokio::time::timeout(budget, handler(req)))
                .catch_unwind()
                .await;
        match outcome {
            Err(panic) => {
                let what = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(panic = %what, route = sub.pattern.as_str(), "handler panicked");
                Err(Error::new(format!("handler panicked: {what}")))
            }
            Ok(Err(_elapsed)) => Err(Error::timeout()),
            Ok(Ok(result)) => result,
        }
    }

    fn stamp_response(&self, headers: &mut http::HeaderMap, msg_id: &str, op: OpCode, queue: &str) {
        let host = self.hostname().to_string();
        let id = self.id().to_string();
        let version = self.version();
        let mut f = FrameMut::of(headers);
        f.set_msg_id(msg_id);
        f.set_from_host(&host);
        f.set_from_id(&id);
        f.set_from_version(version);
        if f.read().op_code() != OpCode::Err {
            f.set_op_code(op);
        }
        f.set_queue(queue);
    }

    async fn send_response(&self, reply_subject: &str, res: Response<Body>) {
        let Ok(active) = self.active() else {
            return;
        };
        let budget = frag_budget(active.transport.max_payload());
        let chunks = match fragment(res, budget) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "response fragmentation failed");
                return;
            }
        };
        for chunk in chunks {
            if let Err(e) = active.transport.respond(reply_subject, Outbound::Response(chunk)).await
            {
                tracing::warn!(error = %e, subject = reply_subject, "response send failed");
                return;
            }
        }
    }

    pub(crate) async fn send_ack(&self, reply_subject: &str, msg_id: &str) {
        let Ok(active) = self.active() else {
            return;
        };
        let mut ack = Response::new(Body::empty());
        *ack.status_mut() = StatusCode::OK;
        self.stamp_response(ack.headers_mut(), msg_id, OpCode::Ack, "");
        if let Err(e) = active.transport.respond(reply_subject, Outbound::Response(ack)).await {
            tracing::debug!(error = %e, subject = reply_subject, "ack send failed");
        }
    }
}

/// Shape a traced error as an HTTP response with `Op-Code: Err`.
fn error_response(e: &Error) -> Response<Body> {
    let mut rec = ResponseRecorder::new();
    rec.set_status(
        StatusCode::from_u16(e.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    rec.header("content-type", "application/json");
    rec.write(e.to_json());
    let mut res = rec.into_response();
    FrameMut::of(res.headers_mut()).set_op_code(OpCode::Err);
    res
}
