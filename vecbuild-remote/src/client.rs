// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! HTTP client for the remote vector build service.
//!
//! Submission walks the configured endpoints in order: HTTP 507 means the
//! endpoint is saturated and the next one is tried with the same body. Once
//! a job is accepted, all status queries for it stick to the accepting
//! endpoint until the job reaches a terminal state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use snafu::location;
use url::Url;
use vecbuild_core::{Error, Result};

use crate::model::{BuildStatusResponse, RemoteBuildRequest, RemoteBuildResponse, TaskStatus};
use crate::secret::SecretStore;
use crate::settings::RemoteBuildParams;

pub const BUILD_ENDPOINT: &str = "/_build";
pub const STATUS_ENDPOINT: &str = "/_status";

/// Status codes retried at the request level. 507 is deliberately absent:
/// it is the admission-control signal handled by the submit walk.
const RETRIABLE_STATUS: [u16; 7] = [408, 429, 500, 502, 503, 504, 509];

/// Maps accepted job ids to the endpoint that accepted them. One writer per
/// job id, many readers; entries are cleared when the job reaches a terminal
/// state.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Url>>,
}

impl JobRegistry {
    pub fn insert(&self, job_id: &str, endpoint: Url) {
        self.jobs
            .write()
            .unwrap()
            .insert(job_id.to_string(), endpoint);
    }

    pub fn endpoint_for(&self, job_id: &str) -> Option<Url> {
        self.jobs.read().unwrap().get(job_id).cloned()
    }

    pub fn remove(&self, job_id: &str) {
        self.jobs.write().unwrap().remove(job_id);
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.read().unwrap().contains_key(job_id)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().unwrap().is_empty()
    }
}

/// Transient transport failures worth a retry: timeouts, connect failures,
/// and connections dropped mid-exchange.
fn is_transient(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = inner.source();
    }
    false
}

pub struct RemoteBuildClient {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    secrets: Arc<SecretStore>,
    registry: JobRegistry,
    max_retries: usize,
    retry_base_delay: Duration,
    timeout: Duration,
    poll_interval: Duration,
    initial_delay: Duration,
}

impl RemoteBuildClient {
    pub fn new(params: &RemoteBuildParams, secrets: Arc<SecretStore>) -> Result<Self> {
        let endpoints = params
            .endpoints
            .iter()
            .map(|endpoint| Url::parse(endpoint))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(Error::invalid_input(
                "no remote build service endpoints configured",
                location!(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(params.request_timeout)
            .build()
            .map_err(|e| Error::io(format!("failed to build http client: {e}"), location!()))?;
        Ok(Self {
            client,
            endpoints,
            secrets,
            registry: JobRegistry::default(),
            max_retries: params.max_retries,
            retry_base_delay: params.retry_base_delay,
            timeout: params.timeout,
            poll_interval: params.poll_interval,
            initial_delay: params.initial_delay,
        })
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    fn request_url(endpoint: &Url, path: &str) -> String {
        format!("{}{}", endpoint.as_str().trim_end_matches('/'), path)
    }

    /// Send a request, retrying transient failures and retriable status
    /// codes with a fixed delay between attempts. The final response is
    /// returned as-is; classifying it is up to the caller.
    async fn execute_with_retry(
        &self,
        build_request: impl Fn() -> RequestBuilder,
    ) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let mut request = build_request();
            if let Some(header) = self.secrets.authorization_header() {
                request = request.header(AUTHORIZATION, header);
            }
            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if RETRIABLE_STATUS.contains(&status) && attempt < self.max_retries {
                        attempt += 1;
                        log::debug!(
                            "build service returned {status}, retrying (attempt {attempt})"
                        );
                        tokio::time::sleep(self.retry_base_delay).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) if is_transient(&e) && attempt < self.max_retries => {
                    attempt += 1;
                    log::debug!("transient build service error: {e}, retrying (attempt {attempt})");
                    tokio::time::sleep(self.retry_base_delay).await;
                }
                Err(e) => {
                    return Err(Error::io(
                        format!("build service request failed: {e}"),
                        location!(),
                    ))
                }
            }
        }
    }

    /// Submit a build, walking the endpoint list on admission rejects.
    /// Returns the job id and records which endpoint accepted it.
    pub async fn submit(&self, request: &RemoteBuildRequest) -> Result<String> {
        let body = request.to_json()?;
        for endpoint in &self.endpoints {
            let url = Self::request_url(endpoint, BUILD_ENDPOINT);
            let response = self
                .execute_with_retry(|| {
                    self.client
                        .post(&url)
                        .header(CONTENT_TYPE, "application/json")
                        .body(body.clone())
                })
                .await?;
            let status = response.status();
            if status == StatusCode::INSUFFICIENT_STORAGE {
                log::debug!("build endpoint {endpoint} is saturated, trying next endpoint");
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(Error::Http {
                    status: status.as_u16(),
                    message: format!("build submission failed: {text}"),
                    location: location!(),
                });
            }
            let text = response
                .text()
                .await
                .map_err(|e| Error::io(format!("failed to read build response: {e}"), location!()))?;
            let job_id = RemoteBuildResponse::parse_job_id(&text)?;
            self.registry.insert(&job_id, endpoint.clone());
            log::debug!("submitted remote build job {job_id} to {endpoint}");
            return Ok(job_id);
        }
        Err(Error::AllEndpointsRejected {
            location: location!(),
        })
    }

    /// Fetch the status of a job from the endpoint that accepted it.
    pub async fn status(&self, job_id: &str) -> Result<BuildStatusResponse> {
        let endpoint = self.registry.endpoint_for(job_id).ok_or_else(|| Error::Internal {
            message: format!("no endpoint recorded for job {job_id}"),
            location: location!(),
        })?;
        let url = format!(
            "{}/{}",
            Self::request_url(&endpoint, STATUS_ENDPOINT),
            job_id
        );
        let response = self.execute_with_retry(|| self.client.get(&url)).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                message: format!("status query for job {job_id} failed: {text}"),
                location: location!(),
            });
        }
        let text = response
            .text()
            .await
            .map_err(|e| Error::io(format!("failed to read status response: {e}"), location!()))?;
        BuildStatusResponse::parse(&text)
    }

    /// Poll until the job completes, fails, or the await budget runs out.
    /// Returns the repository path of the finished artifact. The registry
    /// entry is cleared whichever way the wait ends.
    pub async fn await_build(&self, job_id: &str) -> Result<String> {
        let result = self.poll_until_terminal(job_id).await;
        self.registry.remove(job_id);
        result
    }

    async fn poll_until_terminal(&self, job_id: &str) -> Result<String> {
        let started = tokio::time::Instant::now();
        if !self.initial_delay.is_zero() {
            tokio::time::sleep(self.initial_delay).await;
        }
        while started.elapsed() < self.timeout {
            let status = self.status(job_id).await?;
            match status.status() {
                TaskStatus::Completed => {
                    return match status.index_path {
                        Some(index_path) if !index_path.is_empty() => {
                            log::debug!("remote build job {job_id} completed: {index_path}");
                            Ok(index_path)
                        }
                        _ => Err(Error::Protocol {
                            message: "index build reported completed without an index path"
                                .to_string(),
                            location: location!(),
                        }),
                    };
                }
                TaskStatus::Failed => {
                    let message = status
                        .error
                        .filter(|error| !error.is_empty())
                        .unwrap_or_else(|| "index build failed without an error message".to_string());
                    return Err(Error::BuildFailed {
                        message,
                        location: location!(),
                    });
                }
                TaskStatus::Running => tokio::time::sleep(self.poll_interval).await,
                TaskStatus::Unknown => {
                    return Err(Error::Protocol {
                        message: format!("unexpected task status [{}]", status.task_status),
                        location: location!(),
                    })
                }
            }
        }
        Err(Error::BuildTimeout {
            elapsed_ms: started.elapsed().as_millis() as u64,
            location: location!(),
        })
    }
}

impl std::fmt::Debug for RemoteBuildClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteBuildClient({} endpoints)", self.endpoints.len())
    }
}
