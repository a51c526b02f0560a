// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! The remote build orchestrator.
//!
//! Drives one job through upload, submit, await, and download, timing each
//! phase and updating the stats registry. Any failure after the pipeline has
//! started is recovered by rerunning the local strategy against the same
//! job, so the segment always completes unless the local build itself fails.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use snafu::location;
use tracing::instrument;
use uuid::Uuid;
use vecbuild_core::{Error, Result};
use vecbuild_io::{
    VectorRepositoryAccessor, DOC_ID_FILE_EXTENSION, VECTOR_BLOB_FILE_EXTENSION,
};

use crate::client::RemoteBuildClient;
use crate::job::{BuildOrigin, IndexBuildStrategy, SegmentBuildJob};
use crate::model::RemoteBuildRequest;
use crate::settings::{IndexSettings, RemoteBuildParams};
use crate::stats::RemoteBuildStats;

/// The only repository type the build service understands today.
pub const S3_REPOSITORY_TYPE: &str = "s3";

/// Where the job's blobs live, as the build service will see them.
#[derive(Debug, Clone)]
pub struct RepositoryMetadata {
    /// Repository driver type, e.g. `"s3"`.
    pub repository_type: String,
    /// Bucket (or equivalent container) name.
    pub container_name: String,
    /// Prefix inside the container under which blobs are written,
    /// e.g. `<index-uuid>/vectors`.
    pub base_path: String,
}

pub struct RemoteIndexBuildStrategy {
    accessor: VectorRepositoryAccessor,
    client: Arc<RemoteBuildClient>,
    fallback: Box<dyn IndexBuildStrategy>,
    repository: RepositoryMetadata,
    tenant_id: String,
    stats: Arc<RemoteBuildStats>,
}

impl RemoteIndexBuildStrategy {
    pub fn new(
        accessor: VectorRepositoryAccessor,
        client: Arc<RemoteBuildClient>,
        fallback: Box<dyn IndexBuildStrategy>,
        repository: RepositoryMetadata,
        tenant_id: impl Into<String>,
        stats: Arc<RemoteBuildStats>,
    ) -> Self {
        Self {
            accessor,
            client,
            fallback,
            repository,
            tenant_id: tenant_id.into(),
            stats,
        }
    }

    pub fn stats(&self) -> Arc<RemoteBuildStats> {
        self.stats.clone()
    }

    /// True iff the remote path should be attempted for this job: the
    /// per-index gate is on, a vector repository is configured, and the
    /// payload is big enough to be worth shipping.
    pub fn should_build_remotely(
        index_settings: &IndexSettings,
        params: &RemoteBuildParams,
        vector_blob_length: u64,
    ) -> bool {
        if !index_settings.remote_build_enabled {
            log::debug!(
                "remote index build is disabled for index [{}]",
                index_settings.index_name
            );
            return false;
        }
        if params.repository.is_empty() {
            log::debug!(
                "vector repository is not configured, using local build for index [{}]",
                index_settings.index_name
            );
            return false;
        }
        if vector_blob_length < params.threshold_bytes {
            log::debug!(
                "data size [{}] is below the remote build threshold [{}], using local build \
                 for index [{}]",
                vector_blob_length,
                params.threshold_bytes,
                index_settings.index_name
            );
            return false;
        }
        true
    }

    /// Entry point for flush and merge operations: upload the job's data,
    /// trigger the remote build, await it, and stream the artifact into the
    /// segment output. Falls back to the local strategy on any failure.
    pub async fn build_and_write_from(
        &self,
        job: &SegmentBuildJob,
        origin: BuildOrigin,
    ) -> Result<()> {
        if job.total_live_docs == 0 {
            return Err(Error::invalid_input(
                format!("segment build job for [{}] has no live docs", job.field_name),
                location!(),
            ));
        }
        if job.bytes_per_vector() == 0 {
            return Err(Error::invalid_input(
                format!("segment build job for [{}] has zero-width vectors", job.field_name),
                location!(),
            ));
        }
        let size = job.vector_blob_size();
        let started = Instant::now();
        self.stats.start_operation(origin, size);
        match self.try_build_remotely(job, origin).await {
            Ok(()) => {
                self.stats.record_index_build_success();
                self.stats
                    .end_operation(origin, size, started.elapsed().as_millis() as u64);
                Ok(())
            }
            Err(e) if e.is_programming_error() => {
                self.stats
                    .end_operation(origin, size, started.elapsed().as_millis() as u64);
                Err(e)
            }
            Err(e) => {
                self.stats.record_index_build_failure();
                self.stats
                    .end_operation(origin, size, started.elapsed().as_millis() as u64);
                log::warn!(
                    "failed to build index remotely for vector field [{}]: {e}",
                    job.field_name
                );
                self.fallback.build_and_write(job).await
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(field = %job.field_name, segment = %job.segment_id))]
    async fn try_build_remotely(&self, job: &SegmentBuildJob, origin: BuildOrigin) -> Result<()> {
        let blob_name = format!("{}_{}_{}", Uuid::new_v4(), job.field_name, job.segment_id);
        if origin.is_flush() {
            log::info!("starting repository write for flush of [{}]", job.field_name);
        } else {
            log::debug!("starting repository write for merge of [{}]", job.field_name);
        }
        self.write_to_repository(job, &blob_name).await?;
        let job_id = self.submit_build(job, &blob_name).await?;
        let index_path = self.await_build(job, &job_id).await?;
        self.read_from_repository(job, &index_path).await
    }

    async fn write_to_repository(&self, job: &SegmentBuildJob, blob_name: &str) -> Result<()> {
        let started = Instant::now();
        match self
            .accessor
            .write_to_repository(blob_name, job.total_live_docs, &job.cursor_supplier)
            .await
        {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.stats.record_write_success(elapsed_ms);
                log::debug!(
                    "repository write took {elapsed_ms} ms for vector field [{}]",
                    job.field_name
                );
                Ok(())
            }
            Err(e) => {
                self.stats.record_write_failure();
                log::debug!(
                    "repository write failed after {} ms for vector field [{}]: {e}",
                    started.elapsed().as_millis(),
                    job.field_name
                );
                Err(e)
            }
        }
    }

    async fn submit_build(&self, job: &SegmentBuildJob, blob_name: &str) -> Result<String> {
        let started = Instant::now();
        let result = match self.build_request(job, blob_name) {
            Ok(request) => self.client.submit(&request).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(job_id) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.stats.record_build_request_success(elapsed_ms);
                log::debug!(
                    "submit vector build took {elapsed_ms} ms for vector field [{}]",
                    job.field_name
                );
                Ok(job_id)
            }
            Err(e) => {
                self.stats.record_build_request_failure();
                log::error!(
                    "submit vector build failed after {} ms for vector field [{}]: {e}",
                    started.elapsed().as_millis(),
                    job.field_name
                );
                Err(e)
            }
        }
    }

    async fn await_build(&self, job: &SegmentBuildJob, job_id: &str) -> Result<String> {
        let started = Instant::now();
        let result = self.client.await_build(job_id).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        // Wait time is spent whether or not the build succeeds.
        self.stats.add_waiting_time(elapsed_ms);
        match &result {
            Ok(_) => log::debug!(
                "await vector build took {elapsed_ms} ms for vector field [{}]",
                job.field_name
            ),
            Err(e) => log::error!(
                "await vector build failed after {elapsed_ms} ms for vector field [{}]: {e}",
                job.field_name
            ),
        }
        result
    }

    async fn read_from_repository(&self, job: &SegmentBuildJob, index_path: &str) -> Result<()> {
        let started = Instant::now();
        let mut sink = job.sink.lock().await;
        match self
            .accessor
            .read_from_repository(index_path, &mut sink, job.engine)
            .await
        {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.stats.record_read_success(elapsed_ms);
                log::debug!(
                    "repository read took {elapsed_ms} ms for vector field [{}]",
                    job.field_name
                );
                Ok(())
            }
            Err(e) => {
                self.stats.record_read_failure();
                log::debug!(
                    "repository read failed after {} ms for vector field [{}]: {e}",
                    started.elapsed().as_millis(),
                    job.field_name
                );
                Err(e)
            }
        }
    }

    fn build_request(&self, job: &SegmentBuildJob, blob_name: &str) -> Result<RemoteBuildRequest> {
        if self.repository.repository_type != S3_REPOSITORY_TYPE {
            return Err(Error::invalid_input(
                format!(
                    "repository type [{}] is not supported by the remote build service",
                    self.repository.repository_type
                ),
                location!(),
            ));
        }
        if job.dimension == 0 {
            return Err(Error::invalid_input(
                format!("vector field [{}] has zero dimension", job.field_name),
                location!(),
            ));
        }
        let full_path = if self.repository.base_path.is_empty() {
            blob_name.to_string()
        } else {
            format!(
                "{}/{}",
                self.repository.base_path.trim_end_matches('/'),
                blob_name
            )
        };
        Ok(RemoteBuildRequest {
            repository_type: self.repository.repository_type.clone(),
            container_name: self.repository.container_name.clone(),
            vector_path: format!("{full_path}{VECTOR_BLOB_FILE_EXTENSION}"),
            doc_id_path: format!("{full_path}{DOC_ID_FILE_EXTENSION}"),
            tenant_id: self.tenant_id.clone(),
            dimension: job.dimension,
            doc_count: job.total_live_docs,
            data_type: job.data_type.wire_name().to_string(),
            engine: job.engine.wire_name().to_string(),
            index_parameters: job.index_parameters.clone(),
        })
    }
}

#[async_trait]
impl IndexBuildStrategy for RemoteIndexBuildStrategy {
    /// The remote path must know whether a flush or a merge is running so
    /// metrics attribute correctly; calling it without that context is a
    /// bug in the caller, never something to recover from.
    async fn build_and_write(&self, _job: &SegmentBuildJob) -> Result<()> {
        Err(Error::Internal {
            message: "remote index build invoked without a flush/merge origin".to_string(),
            location: location!(),
        })
    }
}

impl std::fmt::Debug for RemoteIndexBuildStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteIndexBuildStrategy")
            .field("repository", &self.repository)
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligibility_truth_table() {
        let params = RemoteBuildParams::default()
            .with_repository("vector-repo")
            .with_threshold_bytes(10 * 1024 * 1024);
        let enabled = IndexSettings {
            index_name: "idx".to_string(),
            remote_build_enabled: true,
        };
        let disabled = IndexSettings {
            index_name: "idx".to_string(),
            remote_build_enabled: false,
        };
        let big = 10 * 1024 * 1024;
        let small = 1024 * 1024;

        assert!(RemoteIndexBuildStrategy::should_build_remotely(
            &enabled, &params, big
        ));
        // Feature gate off.
        assert!(!RemoteIndexBuildStrategy::should_build_remotely(
            &disabled, &params, big
        ));
        // No repository configured.
        let no_repo = params.clone().with_repository("");
        assert!(!RemoteIndexBuildStrategy::should_build_remotely(
            &enabled, &no_repo, big
        ));
        // Below threshold.
        assert!(!RemoteIndexBuildStrategy::should_build_remotely(
            &enabled, &params, small
        ));
        // Threshold is inclusive.
        assert!(RemoteIndexBuildStrategy::should_build_remotely(
            &enabled,
            &params,
            params.threshold_bytes
        ));
        // All three gates down.
        assert!(!RemoteIndexBuildStrategy::should_build_remotely(
            &disabled, &no_repo, small
        ));
    }
}
