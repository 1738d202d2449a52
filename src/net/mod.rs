// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP implementation of [`NetworkLoader`].
//!
//! Stage bodies run on blocking workers, so the fetch drives an async
//! reqwest request on the runtime that owns the worker and streams each
//! chunk into the sink, checking the cancel token between chunks.

use std::io::Write;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::StreamExt;
use tokio::runtime::Handle;

use crate::config::LoaderConfig;
use crate::loader::NetworkLoader;
use crate::task::CancelToken;

/// Fetches `http(s)://` identifiers with reqwest.
#[derive(Debug, Clone)]
pub struct HttpNetworkLoader {
    client: reqwest::Client,
    runtime: Option<Handle>,
    /// Largest body accepted, if bounded.
    max_body_bytes: Option<u64>,
}

impl HttpNetworkLoader {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            runtime: Handle::try_current().ok(),
            max_body_bytes: None,
        })
    }

    pub fn from_config(config: &LoaderConfig) -> Result<Self> {
        Self::new(Duration::from_secs(config.http_timeout_secs), &config.user_agent)
    }

    /// Reject bodies larger than `bytes`.
    pub fn with_max_body_bytes(mut self, bytes: u64) -> Self {
        self.max_body_bytes = Some(bytes);
        self
    }

    async fn stream_into(&self, url: &str, sink: &mut dyn Write, token: &CancelToken) -> Result<u64> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow!("Request to {} timed out", url)
            } else if e.is_connect() {
                anyhow!("Cannot connect to {}: {}", url, e)
            } else {
                anyhow!("Request to {} failed: {}", url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} from {}", status, url);
        }
        if let (Some(limit), Some(length)) = (self.max_body_bytes, response.content_length()) {
            if length > limit {
                bail!("Body of {} is {} bytes, limit is {}", url, length, limit);
            }
        }

        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            token.check()?;
            let chunk = chunk.with_context(|| format!("Failed reading body of {}", url))?;
            written += chunk.len() as u64;
            if let Some(limit) = self.max_body_bytes {
                if written > limit {
                    bail!("Body of {} exceeds {} bytes", url, limit);
                }
            }
            sink.write_all(&chunk)?;
        }
        sink.flush()?;

        tracing::debug!(target: "resloader::net", url, bytes = written, "Fetched resource");
        Ok(written)
    }
}

impl NetworkLoader for HttpNetworkLoader {
    fn fetch(&self, identifier: &str, sink: &mut dyn Write, token: &CancelToken) -> Result<()> {
        if !(identifier.starts_with("http://") || identifier.starts_with("https://")) {
            bail!("Unsupported identifier (expected http or https URL): {}", identifier);
        }
        token.check()?;

        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().context("HTTP fetch needs a tokio runtime")?,
        };
        runtime.block_on(self.stream_into(identifier, sink, token))?;
        Ok(())
    }
}
