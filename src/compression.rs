// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Compression Post-Processors
//!
//! Outbound payloads are compressed by a [`CompressingPostProcessor`] which tags the
//! AMQP `content_encoding` with the algorithm token. Inbound payloads always go
//! through a [`DecompressingPostProcessor`] which decodes recognised tokens and
//! leaves everything else untouched, so consumers interoperate with producers that
//! use any (or no) compression setting.
//!
//! Both processors are stateless and safe to share across channels.

use crate::errors::BinderError;
use flate2::{
    read::{DeflateDecoder, GzDecoder},
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use serde::{Deserialize, Serialize};
use std::{
    io::{Read, Write},
    sync::Arc,
};

/// Separator between stacked content encodings, e.g. `gzip:utf-8`.
pub const ENCODING_SEPARATOR: char = ':';

/// Largest body a compressed payload may inflate to, 64 MiB.
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Gzip,
    Deflate,
}

impl CompressionAlgorithm {
    /// Content-encoding token of the algorithm.
    pub fn token(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Deflate => "deflate",
        }
    }

    pub fn from_token(token: &str) -> Option<CompressionAlgorithm> {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" => Some(CompressionAlgorithm::Gzip),
            "deflate" => Some(CompressionAlgorithm::Deflate),
            _ => None,
        }
    }
}

/// Payload bytes with the content encoding that describes them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedPayload {
    pub body: Vec<u8>,
    pub content_encoding: Option<String>,
}

impl EncodedPayload {
    pub fn new(body: Vec<u8>, content_encoding: Option<String>) -> Self {
        EncodedPayload {
            body,
            content_encoding,
        }
    }
}

/// A message transformer applied uniformly to outbound or inbound payloads.
pub trait PostProcessor: Send + Sync {
    fn process(&self, payload: EncodedPayload) -> Result<EncodedPayload, BinderError>;
}

/// Compresses payloads when the level is above zero.
#[derive(Debug, Clone)]
pub struct CompressingPostProcessor {
    algorithm: CompressionAlgorithm,
    level: u32,
}

impl CompressingPostProcessor {
    pub fn new(algorithm: CompressionAlgorithm, level: u32) -> Self {
        CompressingPostProcessor {
            algorithm,
            level: level.min(9),
        }
    }

    pub fn gzip(level: u32) -> Self {
        Self::new(CompressionAlgorithm::Gzip, level)
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

impl PostProcessor for CompressingPostProcessor {
    fn process(&self, payload: EncodedPayload) -> Result<EncodedPayload, BinderError> {
        if self.level == 0 {
            return Ok(payload);
        }

        let body = compress(&payload.body, self.algorithm, self.level)?;
        let token = self.algorithm.token();
        let content_encoding = match payload.content_encoding {
            Some(existing) if !existing.is_empty() => {
                format!("{}{}{}", token, ENCODING_SEPARATOR, existing)
            }
            _ => token.to_owned(),
        };

        Ok(EncodedPayload::new(body, Some(content_encoding)))
    }
}

/// Decompresses payloads whose content encoding starts with a known token.
#[derive(Debug, Clone)]
pub struct DecompressingPostProcessor {
    max_size: usize,
}

impl DecompressingPostProcessor {
    /// Refuses payloads inflating beyond `max_size` bytes.
    pub fn with_max_size(max_size: usize) -> Self {
        DecompressingPostProcessor { max_size }
    }
}

impl Default for DecompressingPostProcessor {
    fn default() -> Self {
        Self::with_max_size(DEFAULT_MAX_DECOMPRESSED_SIZE)
    }
}

impl PostProcessor for DecompressingPostProcessor {
    fn process(&self, payload: EncodedPayload) -> Result<EncodedPayload, BinderError> {
        let Some(encoding) = payload.content_encoding.as_deref() else {
            return Ok(payload);
        };

        let (token, rest) = match encoding.split_once(ENCODING_SEPARATOR) {
            Some((token, rest)) => (token, Some(rest.to_owned())),
            None => (encoding, None),
        };

        let Some(algorithm) = CompressionAlgorithm::from_token(token) else {
            return Ok(payload);
        };

        let body = decompress(&payload.body, algorithm, self.max_size)?;
        let content_encoding = rest.filter(|r| !r.is_empty());

        Ok(EncodedPayload::new(body, content_encoding))
    }
}

/// The compress/decompress capability pair handed to the binder.
#[derive(Clone)]
pub struct CompressionPipeline {
    pub compressor: Arc<dyn PostProcessor>,
    pub decompressor: Arc<dyn PostProcessor>,
}

impl CompressionPipeline {
    pub fn new(compressor: Arc<dyn PostProcessor>, decompressor: Arc<dyn PostProcessor>) -> Self {
        CompressionPipeline {
            compressor,
            decompressor,
        }
    }

    /// Pipeline for the configured algorithm and level.
    pub fn with_level(algorithm: CompressionAlgorithm, level: u32) -> Self {
        Self::new(
            Arc::new(CompressingPostProcessor::new(algorithm, level)),
            Arc::new(DecompressingPostProcessor::default()),
        )
    }

    pub fn compress(&self, payload: EncodedPayload) -> Result<EncodedPayload, BinderError> {
        self.compressor.process(payload)
    }

    pub fn decompress(&self, payload: EncodedPayload) -> Result<EncodedPayload, BinderError> {
        self.decompressor.process(payload)
    }
}

impl Default for CompressionPipeline {
    fn default() -> Self {
        Self::with_level(CompressionAlgorithm::Gzip, 0)
    }
}

fn compress(data: &[u8], algorithm: CompressionAlgorithm, level: u32) -> Result<Vec<u8>, BinderError> {
    let buffer = Vec::with_capacity(data.len() / 2);
    let level = Compression::new(level);

    let result = match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(buffer, level);
            encoder.write_all(data).and_then(|_| encoder.finish())
        }
        CompressionAlgorithm::Deflate => {
            let mut encoder = DeflateEncoder::new(buffer, level);
            encoder.write_all(data).and_then(|_| encoder.finish())
        }
    };

    result.map_err(|err| BinderError::PayloadEncodeError(err.to_string()))
}

fn decompress(data: &[u8], algorithm: CompressionAlgorithm, max_size: usize) -> Result<Vec<u8>, BinderError> {
    let mut buffer = Vec::new();
    // one byte past the cap tells an oversized payload from one that fits exactly
    let limit = max_size.saturating_add(1) as u64;

    let result = match algorithm {
        CompressionAlgorithm::Gzip => GzDecoder::new(data).take(limit).read_to_end(&mut buffer),
        CompressionAlgorithm::Deflate => DeflateDecoder::new(data).take(limit).read_to_end(&mut buffer),
    };

    if let Err(err) = result {
        return Err(BinderError::PayloadDecodeError(format!("{}: {}", algorithm.token(), err)));
    }

    if buffer.len() > max_size {
        return Err(BinderError::PayloadDecodeError(format!(
            "{}: payload inflates beyond {} bytes",
            algorithm.token(),
            max_size
        )));
    }

    Ok(buffer)
}
