// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Collaborator hooks plugged into a [`ResourceLoader`](super::ResourceLoader).

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::task::CancelToken;

/// Everything a caller passed to `load`, handed to the decoder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadRequest {
    pub identifier: String,
    pub aux_key: String,
    pub width: u32,
    pub height: u32,
    pub params: serde_json::Value,
}

impl LoadRequest {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    pub fn aux_key(mut self, aux_key: impl Into<String>) -> Self {
        self.aux_key = aux_key.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Turns caller identifiers into the cache key used by both caches and both
/// queues. Keys must be lowercase `[a-z0-9_-]`, at most 120 characters.
pub trait KeyDeriver: Send + Sync {
    fn derive(&self, identifier: &str, aux_key: &str) -> String;
}

/// Hex SHA-256 of the identifier, with the auxiliary key mixed in when set.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256KeyDeriver;

impl KeyDeriver for Sha256KeyDeriver {
    fn derive(&self, identifier: &str, aux_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(identifier.as_bytes());
        if !aux_key.is_empty() {
            hasher.update([0u8]);
            hasher.update(aux_key.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Decodes cached bytes into a resource. Errors mean corrupt data.
pub trait Decoder<R>: Send + Sync {
    fn decode_file(&self, path: &Path, request: &LoadRequest) -> anyhow::Result<R>;

    fn decode_bytes(&self, bytes: &[u8], request: &LoadRequest) -> anyhow::Result<R>;
}

/// Decoder that keeps the raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDecoder;

impl Decoder<Vec<u8>> for BytesDecoder {
    fn decode_file(&self, path: &Path, _request: &LoadRequest) -> anyhow::Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn decode_bytes(&self, bytes: &[u8], _request: &LoadRequest) -> anyhow::Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Streams the resource named by `identifier` into `sink`.
///
/// Implementations should poll `token` between chunks and return early once
/// it is canceled.
pub trait NetworkLoader: Send + Sync {
    fn fetch(&self, identifier: &str, sink: &mut dyn Write, token: &CancelToken) -> anyhow::Result<()>;
}

/// Receives errors the pipeline recovers from or reports as failures.
pub trait ExceptionHandler: Send + Sync {
    /// The disk cache could not be opened; the loader runs without it.
    fn on_disk_open_error(&self, err: &anyhow::Error) {
        tracing::warn!(target: "resloader::loader", "Disk cache unavailable: {:#}", err);
    }

    /// Writing or committing a cache entry failed.
    fn on_disk_write_error(&self, key: &str, err: &anyhow::Error) {
        tracing::warn!(target: "resloader::loader", key, "Disk cache write failed: {:#}", err);
    }

    /// A cached file could not be decoded; the pipeline refetches it.
    fn on_corrupt_entry(&self, key: &str, err: &anyhow::Error) {
        tracing::warn!(target: "resloader::loader", key, "Discarding undecodable cache entry: {:#}", err);
    }

    /// A load failed.
    fn on_load_error(&self, key: &str, err: &anyhow::Error) {
        tracing::debug!(target: "resloader::loader", key, "Load failed: {:#}", err);
    }
}

/// Default [`ExceptionHandler`]: logs through tracing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingExceptionHandler;

impl ExceptionHandler for TracingExceptionHandler {}

/// Per-load callbacks. Exactly one of them runs for every `load`.
pub trait LoadListener<R>: Send + Sync {
    fn on_succeed(&self, key: &str, resource: Arc<R>);

    fn on_failed(&self, key: &str, err: &anyhow::Error);

    fn on_canceled(&self, key: &str);
}

/// Optional sink for per-load diagnostics.
pub trait LoadLogger: Send + Sync {
    fn log(&self, key: &str, message: &str);
}

/// [`LoadLogger`] that forwards to tracing at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl LoadLogger for TracingLogger {
    fn log(&self, key: &str, message: &str) {
        tracing::debug!(target: "resloader::loader", key, "{}", message);
    }
}
