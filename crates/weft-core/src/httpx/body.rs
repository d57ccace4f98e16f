//! Rope body — the in-memory payload of every carried message.
//!
//! A body is a sequence of `Bytes` parts. Fragmentation slices one part
//! into many and reassembly strings many parts back together, all
//! without copying payload bytes.

use bytes::{Bytes, BytesMut};

/// In-memory message body.
#[derive(Clone, Default)]
pub struct Body {
    parts: Vec<Bytes>,
}

impl Body {
    pub fn empty() -> Self {
        Self { parts: Vec::new() }
    }

    /// Total byte length across all parts.
    pub fn len(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(Bytes::is_empty)
    }

    /// Append a part to the rope.
    pub fn push(&mut self, part: Bytes) {
        if !part.is_empty() {
            self.parts.push(part);
        }
    }

    /// Append another body's parts.
    pub fn extend(&mut self, other: Body) {
        self.parts.extend(other.parts.into_iter().filter(|p| !p.is_empty()));
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Flatten into one contiguous `Bytes`. Free when the rope has at
    /// most one part; one copy otherwise.
    pub fn to_bytes(&self) -> Bytes {
        match self.parts.len() {
            0 => Bytes::new(),
            1 => self.parts[0].clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.len());
                for p in &self.parts {
                    buf.extend_from_slice(p);
                }
                buf.freeze()
            }
        }
    }

    /// Interpret the flattened bytes as UTF-8, lossily.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        let mut body = Body::empty();
        body.push(b);
        body
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Bytes::from(v).into()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Bytes::from(s).into()
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Body({} bytes, {} parts)", self.len(), self.parts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rope_concatenates_in_order() {
        let mut b = Body::empty();
        b.push(Bytes::from_static(b"hello "));
        b.push(Bytes::from_static(b""));
        b.push(Bytes::from_static(b"world"));
        assert_eq!(b.len(), 11);
        assert_eq!(b.to_bytes().as_ref(), b"hello world");
        assert_eq!(b.parts().len(), 2); // empty part dropped
    }

    #[test]
    fn single_part_is_zero_copy() {
        let payload = Bytes::from(vec![7u8; 1024]);
        let b: Body = payload.clone().into();
        let out = b.to_bytes();
        assert_eq!(out, payload);
    }

    #[test]
    fn empty_body() {
        let b = Body::empty();
        assert!(b.is_empty());
        assert_eq!(b.len(), 0);
        assert_eq!(b.to_bytes().len(), 0);
    }
}
