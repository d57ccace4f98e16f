//! Fragmentation and reassembly of oversize messages.
//!
//! A message whose body exceeds the broker payload budget is split into
//! numbered chunks carrying `Fragment: i/N`. The receiving side collects
//! chunks by message id and hands back one integrated message when the
//! last chunk lands. Sets that stop receiving chunks are reaped by a
//! caretaker scan.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::header::{HeaderValue, CONTENT_LENGTH};
use http::HeaderMap;
use thiserror::Error as ThisError;

use crate::frame::{names, Frame, FrameMut};
use crate::httpx::{Body, Carrier};

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum FragmentError {
    #[error("fragment budget must be positive")]
    NonPositiveBudget,

    #[error("fragment index {index} outside 1..={max}")]
    BadIndex { index: u32, max: u32 },

    #[error("fragment {0} missing from a completed set")]
    MissingFragment(u32),
}

impl From<FragmentError> for crate::error::Error {
    fn from(e: FragmentError) -> Self {
        crate::error::Error::new(e.to_string())
    }
}

/// Split `msg` into chunks of at most `budget` body bytes.
///
/// Fragment 1 carries every header of the original; later fragments
/// carry only what reassembly and reply routing need. A message that
/// fits the budget comes back as the sole element, untouched.
pub fn fragment<M: Carrier>(msg: M, budget: usize) -> Result<Vec<M>, FragmentError> {
    if budget == 0 {
        return Err(FragmentError::NonPositiveBudget);
    }
    let data = msg.body().to_bytes();
    let total = data.len();
    if total <= budget {
        return Ok(vec![msg]);
    }

    let count = total.div_ceil(budget) as u32;
    let mut out = Vec::with_capacity(count as usize);
    for i in 1..=count {
        let lo = (i as usize - 1) * budget;
        let hi = (i as usize * budget).min(total);
        let body: Body = data.slice(lo..hi).into();

        let mut headers = if i == 1 {
            msg.headers().clone()
        } else {
            minimal_headers(msg.headers())
        };
        headers.insert(CONTENT_LENGTH, HeaderValue::from(hi - lo));
        FrameMut::of(&mut headers).set_fragment(i, count);
        out.push(msg.shell(headers, body));
    }
    Ok(out)
}

/// The headers a non-first fragment keeps: enough to route and to key
/// the defrag set.
fn minimal_headers(full: &HeaderMap) -> HeaderMap {
    let mut h = HeaderMap::new();
    for name in [names::MSG_ID, names::FROM_HOST, names::FROM_ID, names::OP_CODE] {
        if let Some(v) = full.get(name) {
            h.insert(http::header::HeaderName::from_static(name), v.clone());
        }
    }
    h
}

/// Reassembly registry, keyed by caller-chosen strings (message id, or
/// message id + responder id for responses).
pub struct Defrag<M: Carrier> {
    sets: DashMap<String, Arc<Mutex<FragmentSet<M>>>>,
}

struct FragmentSet<M> {
    chunks: HashMap<u32, M>,
    max_index: u32,
    last_activity: Instant,
    done: bool,
}

impl<M: Carrier> Default for Defrag<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Carrier> Defrag<M> {
    pub fn new() -> Self {
        Self { sets: DashMap::new() }
    }

    /// Record one arriving chunk. Returns the integrated message to
    /// exactly one caller, when its chunk completes the set; unfragmented
    /// messages pass straight through.
    pub fn add(&self, key: &str, msg: M) -> Result<Option<M>, FragmentError> {
        let (index, max) = Frame::of(msg.headers()).fragment();
        if max <= 1 {
            return Ok(Some(msg));
        }
        if index < 1 || index > max {
            return Err(FragmentError::BadIndex { index, max });
        }

        let set = self
            .sets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(FragmentSet {
                    chunks: HashMap::new(),
                    max_index: max,
                    last_activity: Instant::now(),
                    done: false,
                }))
            })
            .clone();

        let integrated = {
            let mut set = set.lock().expect("fragment set lock");
            if set.done {
                return Ok(None);
            }
            set.chunks.insert(index, msg);
            set.last_activity = Instant::now();
            if set.chunks.len() as u32 != set.max_index {
                return Ok(None);
            }
            set.done = true;
            integrate(&mut set)?
        };
        self.sets.remove(key);
        Ok(Some(integrated))
    }

    /// Drop sets whose last activity is older than `max_idle`. Returns
    /// the abandoned keys so the owner can report timeouts.
    pub fn purge_idle(&self, max_idle: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        self.sets.retain(|key, set| {
            let idle = set
                .lock()
                .map(|s| s.last_activity.elapsed() > max_idle)
                .unwrap_or(true);
            if idle {
                expired.push(key.clone());
            }
            !idle
        });
        expired
    }

    /// Number of in-progress sets.
    pub fn pending(&self) -> usize {
        self.sets.len()
    }
}

/// Stitch a completed set into one message: fragment 1's headers, bodies
/// concatenated in index order, `Content-Length` summed, `Fragment`
/// cleared.
fn integrate<M: Carrier>(set: &mut FragmentSet<M>) -> Result<M, FragmentError> {
    let first = set.chunks.remove(&1).ok_or(FragmentError::MissingFragment(1))?;
    let mut lengths_known = content_length(first.headers()).is_some();
    let mut body = first.body().clone();
    for i in 2..=set.max_index {
        let chunk = set.chunks.remove(&i).ok_or(FragmentError::MissingFragment(i))?;
        lengths_known = lengths_known && content_length(chunk.headers()).is_some();
        body.extend(chunk.body().clone());
    }

    let mut headers = first.headers().clone();
    FrameMut::of(&mut headers).set_fragment(1, 1);
    if lengths_known {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    } else {
        headers.remove(CONTENT_LENGTH);
    }
    Ok(first.shell(headers, body))
}

fn content_length(h: &HeaderMap) -> Option<usize> {
    h.get(CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
}
