// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! Parameters of the remote build pipeline.

use std::collections::HashMap;
use std::time::Duration;

use snafu::location;
use vecbuild_core::{Error, Result};
use vecbuild_io::UploadParams;

/// Per-index settings the orchestrator consults.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub index_name: String,
    /// The per-index feature gate.
    pub remote_build_enabled: bool,
}

/// Cluster-wide parameters of the remote build pipeline.
#[derive(Debug, Clone)]
pub struct RemoteBuildParams {
    /// Build service endpoints, walked in order on submission.
    pub endpoints: Vec<String>,
    /// Name of the vector repository; empty means not configured.
    pub repository: String,
    /// Minimum vector payload size for the remote path.
    pub threshold_bytes: u64,
    /// Total await budget for one build.
    pub timeout: Duration,
    /// Sleep between status polls.
    pub poll_interval: Duration,
    /// Sleep before the first status poll.
    pub initial_delay: Duration,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Retries per HTTP request on top of the initial attempt.
    pub max_retries: usize,
    /// Fixed delay between retry attempts.
    pub retry_base_delay: Duration,
    pub upload: UploadParams,
}

impl Default for RemoteBuildParams {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            repository: String::new(),
            threshold_bytes: 50 * 1024 * 1024,
            timeout: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(30),
            initial_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(60),
            max_retries: 1,
            retry_base_delay: Duration::from_millis(100),
            upload: UploadParams::default(),
        }
    }
}

impl RemoteBuildParams {
    pub fn with_endpoints(mut self, endpoints: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_threshold_bytes(mut self, threshold_bytes: u64) -> Self {
        self.threshold_bytes = threshold_bytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Parse from flat string properties, e.g. a settings file. Unknown keys
    /// are ignored so the map can carry settings of other subsystems.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut params = Self::default();
        if let Some(endpoints) = properties.get("remote_build.endpoints") {
            params.endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(repository) = properties.get("remote_build.repository") {
            params.repository = repository.clone();
        }
        if let Some(threshold) = properties.get("remote_build.threshold_bytes") {
            params.threshold_bytes = parse_u64("remote_build.threshold_bytes", threshold)?;
        }
        if let Some(timeout) = properties.get("remote_build.timeout") {
            params.timeout = parse_duration("remote_build.timeout", timeout)?;
        }
        if let Some(poll_interval) = properties.get("remote_build.poll_interval") {
            params.poll_interval = parse_duration("remote_build.poll_interval", poll_interval)?;
        }
        if let Some(initial_delay) = properties.get("remote_build.initial_delay") {
            params.initial_delay = parse_duration("remote_build.initial_delay", initial_delay)?;
        }
        if let Some(request_timeout) = properties.get("remote_build.request_timeout") {
            params.request_timeout =
                parse_duration("remote_build.request_timeout", request_timeout)?;
        }
        if let Some(buffer_bytes) = properties.get("upload.buffer_bytes") {
            params.upload.buffer_bytes = parse_u64("upload.buffer_bytes", buffer_bytes)? as usize;
        }
        if let Some(force) = properties.get("upload.force_single_stream") {
            params.upload.force_single_stream = parse_bool("upload.force_single_stream", force)?;
        }
        Ok(params)
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|e| Error::invalid_input(format!("{key}: {e}"), location!()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    value
        .parse::<bool>()
        .map_err(|e| Error::invalid_input(format!("{key}: {e}"), location!()))
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| Error::invalid_input(format!("{key}: {e}"), location!()))
}
