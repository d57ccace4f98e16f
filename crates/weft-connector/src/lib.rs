//! weft-connector — the service runtime of the weft fabric.
//!
//! A [`Connector`] hosts one microservice instance: it joins the
//! message plane (NATS and/or the in-process short-circuit), serves
//! subscriptions, issues unicast requests and multicast publishes with
//! fragmentation and response fan-in, and cooperates with its replicas
//! through a distributed LRU cache.

pub mod connector;
pub mod context;
pub mod control;
pub mod dispatch;
pub mod dlru;
pub mod messaging;
pub mod stats;
pub mod subscribe;
pub mod transport;

pub use connector::{
    Connector, LifecycleHook, LifecycleState, DEFAULT_TIME_BUDGET, MAX_CALL_DEPTH,
};
pub use context::Context;
pub use control::TickerHandler;
pub use dispatch::{path_args, PathArgs};
pub use dlru::{Cache, LoadOptions, StoreOptions};
pub use messaging::{Req, Responses};
pub use stats::StatsSnapshot;
pub use subscribe::{handler_fn, HttpHandler, SubOptions};
pub use transport::{Delivery, Transport};
