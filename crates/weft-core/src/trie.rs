//! Subject trie — maps dotted subjects to rotating rings of handlers.
//!
//! Each leaf holds one ring per queue name. A named queue contributes
//! exactly one handler per match, rotating round-robin across successive
//! matches. The unnamed queue (`""`) is pervasive: every one of its
//! handlers is emitted on every match.
//!
//! One mutex guards the whole tree; rings rotate under it, so they need
//! no locking of their own.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Prefix tree from subjects (with `*`/`>` wildcards) to handlers.
pub struct SubjectTrie<H: Clone> {
    inner: Mutex<Inner<H>>,
}

struct Inner<H> {
    root: Node<H>,
    next_id: u64,
}

struct Node<H> {
    children: HashMap<String, Node<H>>,
    rings: Vec<Ring<H>>,
}

struct Ring<H> {
    queue: String,
    head: usize,
    members: Vec<Member<H>>,
}

struct Member<H> {
    id: u64,
    handler: H,
}

/// Receipt for one insertion; feed back to [`SubjectTrie::unsubscribe`].
#[derive(Debug, Clone)]
pub struct SubKey {
    segments: Vec<String>,
    queue: String,
    id: u64,
}

impl<H> Node<H> {
    fn new() -> Self {
        Self { children: HashMap::new(), rings: Vec::new() }
    }

    fn is_leafless(&self) -> bool {
        self.children.is_empty() && self.rings.is_empty()
    }
}

impl<H: Clone> Default for SubjectTrie<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone> SubjectTrie<H> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { root: Node::new(), next_id: 1 }),
        }
    }

    /// Insert a handler at `subject` under `queue`. Empty segments are
    /// skipped. `>` must be the terminal segment.
    pub fn subscribe(&self, subject: &str, queue: &str, handler: H) -> Result<SubKey> {
        let segments: Vec<String> = subject
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        for (i, seg) in segments.iter().enumerate() {
            if seg == ">" && i != segments.len() - 1 {
                return Err(Error::bad_request(format!(
                    "'>' must terminate the subject: '{subject}'"
                )));
            }
        }

        let mut inner = self.inner.lock().expect("trie lock");
        let id = inner.next_id;
        inner.next_id += 1;

        let mut node = &mut inner.root;
        for seg in &segments {
            node = node.children.entry(seg.clone()).or_insert_with(Node::new);
        }
        let ring = match node.rings.iter_mut().position(|r| r.queue == queue) {
            Some(i) => &mut node.rings[i],
            None => {
                node.rings.push(Ring { queue: queue.to_string(), head: 0, members: Vec::new() });
                node.rings.last_mut().expect("just pushed")
            }
        };
        ring.members.push(Member { id, handler });

        Ok(SubKey { segments, queue: queue.to_string(), id })
    }

    /// Remove the insertion identified by `key` and trim now-empty nodes
    /// up to the root. Safe to call more than once.
    pub fn unsubscribe(&self, key: &SubKey) {
        let mut inner = self.inner.lock().expect("trie lock");
        remove_in(&mut inner.root, &key.segments, &key.queue, key.id);
    }

    /// All handlers matching `subject`: exact segments, then `*`
    /// branches, with terminal `>` branches collected separately and
    /// appended after the walk. Rotates every touched ring.
    pub fn handlers(&self, subject: &str) -> Vec<H> {
        let segments: Vec<&str> = subject.split('.').filter(|s| !s.is_empty()).collect();
        let mut inner = self.inner.lock().expect("trie lock");
        let mut matched = Vec::new();
        let mut suffix = Vec::new();
        walk(&mut inner.root, &segments, &mut matched, &mut suffix);
        matched.append(&mut suffix);
        matched
    }

    /// True iff nothing remains below the root.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("trie lock").root.is_leafless()
    }
}

/// Returns true when `node` became empty and should be pruned.
fn remove_in<H>(node: &mut Node<H>, segments: &[String], queue: &str, id: u64) -> bool {
    if let Some((first, rest)) = segments.split_first() {
        if let Some(child) = node.children.get_mut(first) {
            if remove_in(child, rest, queue, id) {
                node.children.remove(first);
            }
        }
    } else if let Some(ri) = node.rings.iter().position(|r| r.queue == queue) {
        let ring = &mut node.rings[ri];
        if let Some(mi) = ring.members.iter().position(|m| m.id == id) {
            ring.members.remove(mi);
            if mi < ring.head {
                ring.head -= 1;
            }
            if ring.head >= ring.members.len() {
                ring.head = 0;
            }
        }
        if ring.members.is_empty() {
            node.rings.remove(ri);
        }
    }
    node.is_leafless()
}

fn walk<H: Clone>(node: &mut Node<H>, rest: &[&str], out: &mut Vec<H>, suffix: &mut Vec<H>) {
    // A `>` child swallows any non-empty remainder. Collected apart so
    // suffix matches land after every narrower match.
    if !rest.is_empty() {
        if let Some(tail) = node.children.get_mut(">") {
            collect(tail, suffix);
        }
    }
    let Some((first, narrower)) = rest.split_first() else {
        collect(node, out);
        return;
    };
    if let Some(child) = node.children.get_mut(*first) {
        walk(child, narrower, out, suffix);
    }
    if *first != "*" {
        if let Some(star) = node.children.get_mut("*") {
            walk(star, narrower, out, suffix);
        }
    }
}

fn collect<H: Clone>(node: &mut Node<H>, out: &mut Vec<H>) {
    for ring in &mut node.rings {
        let n = ring.members.len();
        if n == 0 {
            continue;
        }
        if ring.queue.is_empty() {
            for j in 0..n {
                out.push(ring.members[(ring.head + j) % n].handler.clone());
            }
        } else {
            out.push(ring.members[ring.head].handler.clone());
        }
        ring.head = (ring.head + 1) % n;
    }
}
