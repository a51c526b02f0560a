// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! Wire model of the remote build service.
//!
//! The request body and the two response bodies are a strict JSON contract;
//! field names here must not drift.

use serde::{Deserialize, Serialize};
use snafu::location;
use vecbuild_core::{Error, Result};

/// `index_parameters` of the build request: how the remote builder should
/// construct the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexParameters {
    pub space_type: String,
    pub algorithm: String,
    pub algorithm_parameters: serde_json::Map<String, serde_json::Value>,
}

impl IndexParameters {
    /// HNSW parameters as the faiss engine expects them.
    pub fn hnsw(space_type: &str, ef_construction: u32, ef_search: u32, m: u32) -> Self {
        let mut algorithm_parameters = serde_json::Map::new();
        algorithm_parameters.insert("ef_construction".to_string(), ef_construction.into());
        algorithm_parameters.insert("ef_search".to_string(), ef_search.into());
        algorithm_parameters.insert("m".to_string(), m.into());
        Self {
            space_type: space_type.to_string(),
            algorithm: "hnsw".to_string(),
            algorithm_parameters,
        }
    }
}

/// Body of `POST <endpoint>/_build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBuildRequest {
    pub repository_type: String,
    pub container_name: String,
    pub vector_path: String,
    pub doc_id_path: String,
    pub tenant_id: String,
    pub dimension: u32,
    pub doc_count: u64,
    pub data_type: String,
    pub engine: String,
    pub index_parameters: IndexParameters,
}

impl RemoteBuildRequest {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Body of a successful `POST /_build` response.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteBuildResponse {
    #[serde(default)]
    pub job_id: Option<String>,
}

impl RemoteBuildResponse {
    /// Parse the response body and extract a non-empty job id.
    pub fn parse_job_id(body: &str) -> Result<String> {
        let response: Self = serde_json::from_str(body)?;
        match response.job_id {
            Some(job_id) if !job_id.is_empty() => Ok(job_id),
            _ => Err(Error::Protocol {
                message: "build response is missing job_id".to_string(),
                location: location!(),
            }),
        }
    }
}

/// `task_status` values of the status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Unknown,
}

impl TaskStatus {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "RUNNING_INDEX_BUILD" => Self::Running,
            "COMPLETED_INDEX_BUILD" => Self::Completed,
            "FAILED_INDEX_BUILD" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Body of `GET <endpoint>/_status/<job_id>`. JSON `null` values parse to
/// `None`.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildStatusResponse {
    pub task_status: String,
    #[serde(default)]
    pub index_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BuildStatusResponse {
    pub fn parse(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_wire(&self.task_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RemoteBuildRequest {
        RemoteBuildRequest {
            repository_type: "s3".to_string(),
            container_name: "test-bucket".to_string(),
            vector_path: "blob.knnvec".to_string(),
            doc_id_path: "blob.knndid".to_string(),
            tenant_id: "test-cluster".to_string(),
            dimension: 2,
            doc_count: 2,
            data_type: "float".to_string(),
            engine: "faiss".to_string(),
            index_parameters: IndexParameters::hnsw("l2", 94, 89, 14),
        }
    }

    #[test]
    fn test_request_json_shape() {
        let expected: serde_json::Value = serde_json::json!({
            "repository_type": "s3",
            "container_name": "test-bucket",
            "vector_path": "blob.knnvec",
            "doc_id_path": "blob.knndid",
            "tenant_id": "test-cluster",
            "dimension": 2,
            "doc_count": 2,
            "data_type": "float",
            "engine": "faiss",
            "index_parameters": {
                "space_type": "l2",
                "algorithm": "hnsw",
                "algorithm_parameters": {
                    "ef_construction": 94,
                    "ef_search": 89,
                    "m": 14
                }
            }
        });
        let generated: serde_json::Value =
            serde_json::from_str(&sample_request().to_json().unwrap()).unwrap();
        assert_eq!(generated, expected);
    }

    #[test]
    fn test_request_round_trips() {
        let request = sample_request();
        let parsed: RemoteBuildRequest =
            serde_json::from_str(&request.to_json().unwrap()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_build_response_parsing() {
        assert_eq!(
            RemoteBuildResponse::parse_job_id("{\"job_id\":\"test-job-123\"}").unwrap(),
            "test-job-123"
        );
    }

    #[test]
    fn test_build_response_missing_job_id() {
        for body in [
            "{\"error\":\"test-error\"}",
            "{\"job_id\":null}",
            "{\"job_id\":\"\"}",
        ] {
            let err = RemoteBuildResponse::parse_job_id(body).unwrap_err();
            assert!(matches!(err, Error::Protocol { .. }), "body {body}: {err}");
        }
    }

    #[test]
    fn test_build_response_malformed_json() {
        let err = RemoteBuildResponse::parse_job_id("{oops").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_status_parsing_with_nulls() {
        let status = BuildStatusResponse::parse(
            "{\"task_status\":\"RUNNING_INDEX_BUILD\",\"index_path\":null,\"error\":null}",
        )
        .unwrap();
        assert_eq!(status.status(), TaskStatus::Running);
        assert!(status.index_path.is_none());
        assert!(status.error.is_none());
    }

    #[test]
    fn test_status_parsing_terminal_states() {
        let status = BuildStatusResponse::parse(
            "{\"task_status\":\"COMPLETED_INDEX_BUILD\",\"index_path\":\"out.faiss\"}",
        )
        .unwrap();
        assert_eq!(status.status(), TaskStatus::Completed);
        assert_eq!(status.index_path.as_deref(), Some("out.faiss"));

        let status = BuildStatusResponse::parse(
            "{\"task_status\":\"FAILED_INDEX_BUILD\",\"error\":\"oom\"}",
        )
        .unwrap();
        assert_eq!(status.status(), TaskStatus::Failed);
        assert_eq!(status.error.as_deref(), Some("oom"));
    }

    #[test]
    fn test_status_unknown_and_missing() {
        let status =
            BuildStatusResponse::parse("{\"task_status\":\"SOMETHING_ELSE\"}").unwrap();
        assert_eq!(status.status(), TaskStatus::Unknown);

        let err = BuildStatusResponse::parse("{\"index_path\":\"x\"}").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }
}
