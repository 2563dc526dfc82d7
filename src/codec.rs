// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Payload codecs used by typed producers and consumers.

use crate::errors::BinderError;
use serde::{de::DeserializeOwned, Serialize};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for payloads that bypass the codec
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// Converts application values to and from bytes.
pub trait Codec: Send + Sync + 'static {
    /// Content type written on every message this codec encodes.
    fn content_type(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, BinderError>;

    /// Fails with `PayloadDecodeError` when `bytes` do not match `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, BinderError>;
}

/// serde_json codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, BinderError> {
        serde_json::to_vec(value).map_err(|err| BinderError::PayloadEncodeError(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, BinderError> {
        serde_json::from_slice(bytes).map_err(|err| BinderError::PayloadDecodeError(err.to_string()))
    }
}
