//! The control frame — a thin view over the header map of an HTTP-shaped
//! message.
//!
//! The `Microbus-*` headers are the sole wire contract between
//! connectors. [`Frame`] reads them, [`FrameMut`] writes them in place;
//! neither owns any state of its own. Every setter treats the empty (or
//! zero) value as "delete the header".

use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::boolexpr::{Expr, ExprError};
use crate::error::{Error, Result};

/// Header names of the frame contract. All lowercase; HTTP header names
/// are case-insensitive and the `http` crate normalizes to lowercase.
pub mod names {
    pub const MSG_ID: &str = "microbus-msg-id";
    pub const FROM_HOST: &str = "microbus-from-host";
    pub const FROM_ID: &str = "microbus-from-id";
    pub const FROM_VERSION: &str = "microbus-from-version";
    pub const TIME_BUDGET: &str = "microbus-time-budget";
    pub const CALL_DEPTH: &str = "microbus-call-depth";
    pub const OP_CODE: &str = "microbus-op-code";
    pub const QUEUE: &str = "microbus-queue";
    pub const FRAGMENT: &str = "microbus-fragment";
    pub const CLOCK_SHIFT: &str = "microbus-clock-shift";
    pub const LOCALITY: &str = "microbus-locality";
    pub const ACTOR: &str = "microbus-actor";
    pub const BAGGAGE_PREFIX: &str = "microbus-baggage-";
}

/// Message operation, carried in `Microbus-Op-Code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpCode {
    /// Plain data, no opcode header.
    #[default]
    None,
    /// Response body carries a serialized error.
    Err,
    /// Empty-body terminator a responder sends after its last response.
    Ack,
    /// A request.
    Req,
    /// A response.
    Res,
}

impl OpCode {
    pub fn as_str(self) -> &'static str {
        match self {
            OpCode::None => "",
            OpCode::Err => "Err",
            OpCode::Ack => "Ack",
            OpCode::Req => "Req",
            OpCode::Res => "Res",
        }
    }

    pub fn parse(s: &str) -> OpCode {
        match s {
            "Err" => OpCode::Err,
            "Ack" => OpCode::Ack,
            "Req" => OpCode::Req,
            "Res" => OpCode::Res,
            _ => OpCode::None,
        }
    }
}

/// Read-only frame view.
#[derive(Clone, Copy)]
pub struct Frame<'a> {
    h: &'a HeaderMap,
}

/// Mutable frame view.
pub struct FrameMut<'a> {
    h: &'a mut HeaderMap,
}

fn get<'a>(h: &'a HeaderMap, name: &str) -> Option<&'a str> {
    h.get(name).and_then(|v| v.to_str().ok()).filter(|s| !s.is_empty())
}

fn set(h: &mut HeaderMap, name: &'static str, value: &str) {
    if value.is_empty() {
        h.remove(name);
    } else if let Ok(v) = HeaderValue::from_str(value) {
        h.insert(HeaderName::from_static(name), v);
    }
}

impl<'a> Frame<'a> {
    pub fn of(h: &'a HeaderMap) -> Frame<'a> {
        Frame { h }
    }

    pub fn msg_id(&self) -> Option<&'a str> {
        get(self.h, names::MSG_ID)
    }

    pub fn from_host(&self) -> Option<&'a str> {
        get(self.h, names::FROM_HOST)
    }

    pub fn from_id(&self) -> Option<&'a str> {
        get(self.h, names::FROM_ID)
    }

    pub fn from_version(&self) -> u32 {
        get(self.h, names::FROM_VERSION).and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    pub fn op_code(&self) -> OpCode {
        get(self.h, names::OP_CODE).map(OpCode::parse).unwrap_or_default()
    }

    pub fn call_depth(&self) -> u32 {
        get(self.h, names::CALL_DEPTH).and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    /// Remaining time budget. Zero means none was set.
    pub fn time_budget(&self) -> Duration {
        let ms: u64 = get(self.h, names::TIME_BUDGET).and_then(|s| s.parse().ok()).unwrap_or(0);
        Duration::from_millis(ms)
    }

    /// Fragment index and count, `1/1` when absent or unparseable.
    pub fn fragment(&self) -> (u32, u32) {
        let Some(raw) = get(self.h, names::FRAGMENT) else {
            return (1, 1);
        };
        let mut it = raw.splitn(2, '/');
        let idx = it.next().and_then(|s| s.parse().ok());
        let max = it.next().and_then(|s| s.parse().ok());
        match (idx, max) {
            (Some(i), Some(n)) if i >= 1 && n >= 1 => (i, n),
            _ => (1, 1),
        }
    }

    /// Clock shift in milliseconds, signed. Test scaffolding only.
    pub fn clock_shift_ms(&self) -> i64 {
        get(self.h, names::CLOCK_SHIFT).and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    pub fn queue(&self) -> Option<&'a str> {
        get(self.h, names::QUEUE)
    }

    pub fn locality(&self) -> Option<&'a str> {
        get(self.h, names::LOCALITY)
    }

    /// One baggage value by name (case-insensitive).
    pub fn baggage(&self, name: &str) -> Option<&'a str> {
        get(self.h, &format!("{}{}", names::BAGGAGE_PREFIX, name.to_lowercase()))
    }

    /// All baggage pairs, names without the prefix.
    pub fn baggage_all(&self) -> Vec<(String, String)> {
        self.h
            .iter()
            .filter_map(|(k, v)| {
                let name = k.as_str().strip_prefix(names::BAGGAGE_PREFIX)?;
                Some((name.to_string(), v.to_str().ok()?.to_string()))
            })
            .collect()
    }

    /// `Accept-Language` tags sorted by quality desc, original order for
    /// equal qualities.
    pub fn languages(&self) -> Vec<String> {
        let Some(raw) = get(self.h, "accept-language") else {
            return Vec::new();
        };
        let mut tags: Vec<(String, f64)> = raw
            .split(',')
            .filter_map(|part| {
                let mut it = part.trim().splitn(2, ';');
                let tag = it.next()?.trim();
                if tag.is_empty() {
                    return None;
                }
                let q = it
                    .next()
                    .and_then(|p| p.trim().strip_prefix("q="))
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .unwrap_or(1.0);
                Some((tag.to_string(), q))
            })
            .collect();
        // Stable sort keeps the original order among equal qualities.
        tags.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        tags.into_iter().map(|(t, _)| t).collect()
    }

    /// The raw actor claims JSON, if any.
    pub fn actor_raw(&self) -> Option<&'a str> {
        get(self.h, names::ACTOR)
    }

    /// Deserialize the actor claims.
    pub fn parse_actor<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.actor_raw() {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        }
    }

    /// Evaluate a claims predicate against the actor. Absent actor
    /// claims resolve every identifier falsy.
    pub fn if_actor(&self, expr: &str) -> Result<bool> {
        let parsed = Expr::parse(expr).map_err(expr_error)?;
        self.if_actor_expr(&parsed)
    }

    /// Same as [`Frame::if_actor`] for a pre-parsed expression.
    pub fn if_actor_expr(&self, expr: &Expr) -> Result<bool> {
        let claims = match self.actor_raw() {
            None => serde_json::Value::Null,
            Some(raw) => serde_json::from_str(raw)?,
        };
        expr.eval(&claims).map_err(expr_error)
    }
}

fn expr_error(e: ExprError) -> Error {
    Error::bad_request(e.to_string())
}

impl<'a> FrameMut<'a> {
    pub fn of(h: &'a mut HeaderMap) -> FrameMut<'a> {
        FrameMut { h }
    }

    pub fn read(&self) -> Frame<'_> {
        Frame { h: self.h }
    }

    pub fn set_msg_id(&mut self, v: &str) {
        set(self.h, names::MSG_ID, v);
    }

    pub fn set_from_host(&mut self, v: &str) {
        set(self.h, names::FROM_HOST, v);
    }

    pub fn set_from_id(&mut self, v: &str) {
        set(self.h, names::FROM_ID, v);
    }

    pub fn set_from_version(&mut self, v: u32) {
        let s = v.to_string();
        set(self.h, names::FROM_VERSION, if v == 0 { "" } else { &s });
    }

    pub fn set_op_code(&mut self, v: OpCode) {
        set(self.h, names::OP_CODE, v.as_str());
    }

    pub fn set_call_depth(&mut self, v: u32) {
        let s = v.to_string();
        set(self.h, names::CALL_DEPTH, if v == 0 { "" } else { &s });
    }

    pub fn set_time_budget(&mut self, v: Duration) {
        let ms = v.as_millis() as u64;
        let s = ms.to_string();
        set(self.h, names::TIME_BUDGET, if ms == 0 { "" } else { &s });
    }

    pub fn set_fragment(&mut self, index: u32, max: u32) {
        if index == 1 && max == 1 {
            set(self.h, names::FRAGMENT, "");
        } else {
            set(self.h, names::FRAGMENT, &format!("{index}/{max}"));
        }
    }

    pub fn set_clock_shift_ms(&mut self, ms: i64) {
        let s = ms.to_string();
        set(self.h, names::CLOCK_SHIFT, if ms == 0 { "" } else { &s });
    }

    /// Add to whatever shift is already present.
    pub fn increment_clock_shift_ms(&mut self, ms: i64) {
        let cur = self.read().clock_shift_ms();
        self.set_clock_shift_ms(cur + ms);
    }

    pub fn set_queue(&mut self, v: &str) {
        set(self.h, names::QUEUE, v);
    }

    pub fn set_locality(&mut self, v: &str) {
        set(self.h, names::LOCALITY, v);
    }

    /// Baggage names are lowercased into the header name; values pass
    /// through unchanged to downstream calls.
    pub fn set_baggage(&mut self, name: &str, value: &str) {
        let full = format!("{}{}", names::BAGGAGE_PREFIX, name.to_lowercase());
        if value.is_empty() {
            self.h.remove(full.as_str());
        } else if let (Ok(n), Ok(v)) =
            (HeaderName::try_from(full), HeaderValue::from_str(value))
        {
            self.h.insert(n, v);
        }
    }

    /// Serialize actor claims into the frame. Trailing whitespace is
    /// trimmed from the JSON text.
    pub fn set_actor<T: Serialize>(&mut self, claims: &T) -> Result<()> {
        let json = serde_json::to_string(claims)?;
        set(self.h, names::ACTOR, json.trim_end());
        Ok(())
    }

    /// Forward already-serialized claims unchanged (downstream
    /// propagation).
    pub fn set_actor_raw(&mut self, json: &str) {
        set(self.h, names::ACTOR, json.trim_end());
    }

    pub fn remove_actor(&mut self) {
        set(self.h, names::ACTOR, "");
    }
}
