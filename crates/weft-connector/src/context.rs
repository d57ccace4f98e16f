//! Ambient request context.
//!
//! A handler making downstream calls passes the context of the request
//! it is serving; the frame's deadline, call depth, baggage, actor
//! claims, clock shift, and locality flow to the downstream frame.

use std::time::Duration;

use http::HeaderMap;
use tokio::time::Instant;

use weft_core::frame::Frame;
use weft_core::httpx::Carrier;

/// What a call inherits from the request being served.
#[derive(Debug, Clone, Default)]
pub struct Context {
    headers: HeaderMap,
    deadline: Option<Instant>,
}

impl Context {
    /// A context with no parent request and no deadline.
    pub fn background() -> Context {
        Context::default()
    }

    /// Capture the frame of an inbound message. The message's remaining
    /// time budget becomes this context's deadline.
    pub fn of<M: Carrier>(msg: &M) -> Context {
        let budget = Frame::of(msg.headers()).time_budget();
        Context {
            headers: msg.headers().clone(),
            deadline: (budget > Duration::ZERO).then(|| Instant::now() + budget),
        }
    }

    /// Tighten (or set) the deadline to at most `d` from now.
    pub fn with_timeout(mut self, d: Duration) -> Context {
        let candidate = Instant::now() + d;
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(candidate),
            None => candidate,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn frame(&self) -> Frame<'_> {
        Frame::of(&self.headers)
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}
