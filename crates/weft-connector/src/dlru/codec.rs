//! JSON and compressed-JSON layers over the byte cache.
//!
//! Compressed entries carry a one-byte encoding tag ahead of the
//! compressed stream. The encoding is negotiated from the ambient
//! request's `Accept-Encoding` (brotli preferred, then gzip, then
//! deflate); gzip is the fallback when nothing is advertised.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use weft_core::{Error, Result};

use crate::context::Context;

use super::{Cache, LoadOptions, StoreOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Encoding {
    Brotli,
    Gzip,
    Deflate,
}

impl Encoding {
    fn tag(self) -> u8 {
        match self {
            Encoding::Brotli => 1,
            Encoding::Gzip => 2,
            Encoding::Deflate => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Encoding> {
        match tag {
            1 => Ok(Encoding::Brotli),
            2 => Ok(Encoding::Gzip),
            3 => Ok(Encoding::Deflate),
            other => Err(Error::new(format!("unknown cache encoding tag {other}"))),
        }
    }
}

/// Pick an encoding from the ambient `Accept-Encoding`.
pub(crate) fn negotiate(ctx: &Context) -> Encoding {
    let raw = ctx
        .headers()
        .get(http::header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if raw.contains("br") {
        Encoding::Brotli
    } else if raw.contains("gzip") || raw.is_empty() {
        Encoding::Gzip
    } else if raw.contains("deflate") {
        Encoding::Deflate
    } else {
        Encoding::Gzip
    }
}

pub(crate) fn compress(enc: Encoding, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![enc.tag()];
    match enc {
        Encoding::Brotli => {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            w.write_all(data)?;
        }
        Encoding::Gzip => {
            let mut w = flate2::write::GzEncoder::new(&mut out, flate2::Compression::default());
            w.write_all(data)?;
            w.finish()?;
        }
        Encoding::Deflate => {
            let mut w = flate2::write::ZlibEncoder::new(&mut out, flate2::Compression::default());
            w.write_all(data)?;
            w.finish()?;
        }
    }
    Ok(out)
}

pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let (tag, stream) = data
        .split_first()
        .ok_or_else(|| Error::new("empty compressed cache entry"))?;
    let mut out = Vec::new();
    match Encoding::from_tag(*tag)? {
        Encoding::Brotli => {
            brotli::Decompressor::new(stream, 4096).read_to_end(&mut out)?;
        }
        Encoding::Gzip => {
            flate2::read::GzDecoder::new(stream).read_to_end(&mut out)?;
        }
        Encoding::Deflate => {
            flate2::read::ZlibDecoder::new(stream).read_to_end(&mut out)?;
        }
    }
    Ok(out)
}

impl Cache<'_> {
    /// Store a value as JSON.
    pub async fn store_json<T: Serialize>(
        &self,
        ctx: &Context,
        key: &str,
        value: &T,
        opts: StoreOptions,
    ) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.store(ctx, key, raw, opts).await
    }

    /// Load a JSON value. `None` when absent.
    pub async fn load_json<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        key: &str,
        opts: LoadOptions,
    ) -> Result<Option<T>> {
        match self.load(ctx, key, opts).await? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        }
    }

    /// Store a value as compressed JSON, encoding negotiated from the
    /// ambient request.
    pub async fn store_compressed_json<T: Serialize>(
        &self,
        ctx: &Context,
        key: &str,
        value: &T,
        opts: StoreOptions,
    ) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        let packed = compress(negotiate(ctx), &raw)?;
        self.store(ctx, key, packed, opts).await
    }

    /// Load a compressed JSON value.
    pub async fn load_compressed_json<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        key: &str,
        opts: LoadOptions,
    ) -> Result<Option<T>> {
        match self.load(ctx, key, opts).await? {
            None => Ok(None),
            Some(packed) => {
                let raw = decompress(&packed)?;
                Ok(Some(serde_json::from_slice(&raw)?))
            }
        }
    }
}
