// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! The per-field build job and the strategy seam.

use async_trait::async_trait;
use tokio::sync::Mutex;
use vecbuild_core::{CursorSupplier, Engine, Result, VectorDataType};
use vecbuild_io::BufferedSink;

use crate::model::IndexParameters;

/// Which segment-producing operation is driving a build. Metrics are
/// attributed to one or the other, so the remote path refuses to run without
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOrigin {
    Flush,
    Merge,
}

impl BuildOrigin {
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }
}

/// Everything needed to build the vector index of one segment field.
///
/// The job is owned by the segment writer and borrowed by whichever build
/// strategy runs; all attributes are fixed for the lifetime of the job. The
/// cursor supplier hands out a fresh forward-only pass over the field's
/// vectors on every call.
pub struct SegmentBuildJob {
    pub segment_id: String,
    pub field_name: String,
    pub total_live_docs: u64,
    pub dimension: u32,
    pub data_type: VectorDataType,
    pub engine: Engine,
    pub index_parameters: IndexParameters,
    pub cursor_supplier: CursorSupplier,
    /// Segment output; shared with the fallback strategy.
    pub sink: Mutex<BufferedSink>,
}

impl SegmentBuildJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        segment_id: impl Into<String>,
        field_name: impl Into<String>,
        total_live_docs: u64,
        dimension: u32,
        data_type: VectorDataType,
        engine: Engine,
        index_parameters: IndexParameters,
        cursor_supplier: CursorSupplier,
        sink: BufferedSink,
    ) -> Self {
        Self {
            segment_id: segment_id.into(),
            field_name: field_name.into(),
            total_live_docs,
            dimension,
            data_type,
            engine,
            index_parameters,
            cursor_supplier,
            sink: Mutex::new(sink),
        }
    }

    pub fn bytes_per_vector(&self) -> u64 {
        self.data_type.bytes_per_vector(self.dimension) as u64
    }

    /// Size of the raw vector payload, used for eligibility and gauges.
    pub fn vector_blob_size(&self) -> u64 {
        self.total_live_docs * self.bytes_per_vector()
    }
}

impl std::fmt::Debug for SegmentBuildJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentBuildJob")
            .field("segment_id", &self.segment_id)
            .field("field_name", &self.field_name)
            .field("total_live_docs", &self.total_live_docs)
            .field("dimension", &self.dimension)
            .field("data_type", &self.data_type)
            .field("engine", &self.engine)
            .finish()
    }
}

/// A way of building a vector index and writing it to the segment output.
///
/// The remote orchestrator and the local in-process builder both implement
/// this; the orchestrator holds a boxed local strategy and reruns it with
/// the same job whenever the remote path fails.
#[async_trait]
pub trait IndexBuildStrategy: Send + Sync {
    async fn build_and_write(&self, job: &SegmentBuildJob) -> Result<()>;
}
