// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! End-to-end scenarios: a mock build service, an in-memory repository, and
//! a recording local strategy standing in for the native builder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use wiremock::matchers::{method, path as url_path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vecbuild_core::testing::TestVectors;
use vecbuild_core::{Engine, Error, Result, VectorDataType};
use vecbuild_io::{
    BlobContainer, BufferedSink, ObjectStoreBlobContainer, VectorRepositoryAccessor,
};
use vecbuild_io::testing::SharedBuffer;
use vecbuild_remote::{
    BuildOrigin, IndexBuildStrategy, IndexParameters, IndexSettings, RemoteBuildClient,
    RemoteBuildParams, RemoteBuildStats, RemoteIndexBuildStrategy, RepositoryMetadata,
    SecretStore, SegmentBuildJob,
};

const BASE_PATH: &str = "idx-uuid/vectors";
const LOCAL_ARTIFACT: &[u8] = b"local-artifact";

/// Local strategy double: counts invocations, remembers the job it was
/// handed, and writes a marker artifact through the job's sink.
struct RecordingStrategy {
    calls: Arc<AtomicUsize>,
    last_job: Arc<Mutex<Option<(String, String)>>>,
}

impl RecordingStrategy {
    fn new() -> (Box<dyn IndexBuildStrategy>, Arc<AtomicUsize>, Arc<Mutex<Option<(String, String)>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let last_job = Arc::new(Mutex::new(None));
        let strategy = Box::new(Self {
            calls: calls.clone(),
            last_job: last_job.clone(),
        });
        (strategy, calls, last_job)
    }
}

#[async_trait]
impl IndexBuildStrategy for RecordingStrategy {
    async fn build_and_write(&self, job: &SegmentBuildJob) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_job.lock().unwrap() =
            Some((job.field_name.clone(), job.segment_id.clone()));
        let mut sink = job.sink.lock().await;
        sink.write_all(LOCAL_ARTIFACT).await?;
        sink.flush().await
    }
}

/// A container whose writes and reads always fail, to force the upload and
/// download phases to error.
struct FailingContainer;

#[async_trait]
impl BlobContainer for FailingContainer {
    fn part_size(&self) -> u64 {
        1024
    }

    async fn write_blob(
        &self,
        _name: &str,
        _reader: Box<dyn std::io::Read + Send>,
        _len: u64,
        _buffer_bytes: usize,
    ) -> Result<()> {
        Err(Error::Upload {
            message: "injected upload failure".to_string(),
            location: snafu::location!(),
        })
    }

    async fn read_blob(&self, _name: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        Err(Error::Download {
            message: "injected download failure".to_string(),
            location: snafu::location!(),
        })
    }
}

fn sample_vectors() -> Arc<TestVectors> {
    let vectors: Vec<Vec<f32>> = (0..25)
        .map(|i| vec![i as f32, (i * 2) as f32, (i * 3) as f32])
        .collect();
    TestVectors::from_floats(&vectors)
}

fn make_job(vectors: &Arc<TestVectors>, target: &SharedBuffer) -> SegmentBuildJob {
    SegmentBuildJob::new(
        "_0",
        "embedding",
        vectors.total_live_docs(),
        3,
        VectorDataType::Float,
        Engine::Faiss,
        IndexParameters::hnsw("l2", 100, 100, 16),
        vectors.supplier(),
        BufferedSink::new(target.writer(), 64),
    )
}

fn fast_params(endpoints: Vec<String>) -> RemoteBuildParams {
    let mut params = RemoteBuildParams::default()
        .with_endpoints(endpoints)
        .with_repository("vector-repo")
        .with_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(50));
    params.retry_base_delay = Duration::from_millis(1);
    params.upload.buffer_bytes = 32;
    params
}

fn memory_container(store: Arc<InMemory>) -> Arc<dyn BlobContainer> {
    Arc::new(ObjectStoreBlobContainer::new(store, Path::from(BASE_PATH)).with_part_size(64))
}

fn make_strategy(
    container: Arc<dyn BlobContainer>,
    params: &RemoteBuildParams,
    local: Box<dyn IndexBuildStrategy>,
) -> RemoteIndexBuildStrategy {
    let client =
        Arc::new(RemoteBuildClient::new(params, Arc::new(SecretStore::new())).unwrap());
    RemoteIndexBuildStrategy::new(
        VectorRepositoryAccessor::new(container, params.upload.clone()),
        client,
        local,
        RepositoryMetadata {
            repository_type: "s3".to_string(),
            container_name: "test-bucket".to_string(),
            base_path: BASE_PATH.to_string(),
        },
        "test-cluster",
        Arc::new(RemoteBuildStats::new()),
    )
}

async fn put_artifact(store: &InMemory, name: &str, payload: &[u8]) {
    store
        .put(
            &Path::from(format!("{BASE_PATH}/{name}")),
            PutPayload::from(Bytes::from(payload.to_vec())),
        )
        .await
        .unwrap();
}

async fn mount_submit(server: &MockServer, job_id: &str) {
    Mock::given(method("POST"))
        .and(url_path("/_build"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "job_id": job_id })),
        )
        .mount(server)
        .await;
}

async fn mount_completed_status(server: &MockServer, job_id: &str, index_path: &str) {
    Mock::given(method("GET"))
        .and(url_path(format!("/_status/{job_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "task_status": "COMPLETED_INDEX_BUILD",
            "index_path": index_path,
            "error": null
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_happy_remote_build() {
    let server = MockServer::start().await;
    mount_submit(&server, "job-1").await;
    Mock::given(method("GET"))
        .and(url_path("/_status/job-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "task_status": "RUNNING_INDEX_BUILD",
            "index_path": null,
            "error": null
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_completed_status(&server, "job-1", "out.faiss").await;

    let store = Arc::new(InMemory::new());
    let artifact: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    put_artifact(&store, "out.faiss", &artifact).await;

    let vectors = sample_vectors();
    let target = SharedBuffer::new();
    let job = make_job(&vectors, &target);
    let (local, local_calls, _) = RecordingStrategy::new();
    let params = fast_params(vec![server.uri()]);
    let strategy = make_strategy(memory_container(store.clone()), &params, local);

    strategy
        .build_and_write_from(&job, BuildOrigin::Flush)
        .await
        .unwrap();

    // The segment sink received the downloaded artifact, not the local one.
    assert_eq!(target.contents(), artifact);
    assert_eq!(local_calls.load(Ordering::SeqCst), 0);

    // Both blobs were published with the exact payload sizes.
    let mut uploaded = store
        .list(Some(&Path::from(BASE_PATH)))
        .collect::<Vec<_>>()
        .await;
    uploaded.sort_by_key(|meta| meta.as_ref().unwrap().location.to_string());
    let sizes: Vec<(String, u64)> = uploaded
        .into_iter()
        .map(|meta| {
            let meta = meta.unwrap();
            (meta.location.filename().unwrap().to_string(), meta.size as u64)
        })
        .collect();
    let vector_blob = sizes
        .iter()
        .find(|(name, _)| name.ends_with(".knnvec"))
        .unwrap();
    let doc_id_blob = sizes
        .iter()
        .find(|(name, _)| name.ends_with(".knndid"))
        .unwrap();
    assert_eq!(vector_blob.1, 25 * 12);
    assert_eq!(doc_id_blob.1, 25 * 4);

    // The submitted request matched the wire contract.
    let requests = server.received_requests().await.unwrap();
    let submit = requests
        .iter()
        .find(|request| request.url.path() == "/_build")
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&submit.body).unwrap();
    assert_eq!(body["repository_type"], "s3");
    assert_eq!(body["container_name"], "test-bucket");
    assert_eq!(body["tenant_id"], "test-cluster");
    assert_eq!(body["dimension"], 3);
    assert_eq!(body["doc_count"], 25);
    assert_eq!(body["data_type"], "float");
    assert_eq!(body["engine"], "faiss");
    let vector_path = body["vector_path"].as_str().unwrap();
    let doc_id_path = body["doc_id_path"].as_str().unwrap();
    assert!(vector_path.starts_with("idx-uuid/vectors/") && vector_path.ends_with(".knnvec"));
    assert!(doc_id_path.starts_with("idx-uuid/vectors/") && doc_id_path.ends_with(".knndid"));
    assert_eq!(body["index_parameters"]["algorithm"], "hnsw");
    assert_eq!(
        body["index_parameters"]["algorithm_parameters"]["ef_construction"],
        100
    );

    let stats = strategy.stats().snapshot();
    assert_eq!(stats.index_build_success_count, 1);
    assert_eq!(stats.index_build_failure_count, 0);
    assert_eq!(stats.write_success_count, 1);
    assert_eq!(stats.build_request_success_count, 1);
    assert_eq!(stats.read_success_count, 1);
    // Two RUNNING polls at 50ms each before completion.
    assert!(stats.waiting_time_ms >= 100, "{}", stats.waiting_time_ms);
    assert_eq!(stats.current_flush_operations, 0);
    assert_eq!(stats.current_flush_size_bytes, 0);
    assert_eq!(stats.current_merge_operations, 0);
}

#[tokio::test]
async fn test_admission_walk_lands_on_third_endpoint() {
    let saturated_a = MockServer::start().await;
    let saturated_b = MockServer::start().await;
    let accepting = MockServer::start().await;
    for server in [&saturated_a, &saturated_b] {
        Mock::given(method("POST"))
            .and(url_path("/_build"))
            .respond_with(ResponseTemplate::new(507))
            .expect(1)
            .mount(server)
            .await;
    }
    mount_submit(&accepting, "job-2").await;
    mount_completed_status(&accepting, "job-2", "out.faiss").await;

    let store = Arc::new(InMemory::new());
    put_artifact(&store, "out.faiss", b"graph-bytes").await;

    let vectors = sample_vectors();
    let target = SharedBuffer::new();
    let job = make_job(&vectors, &target);
    let (local, local_calls, _) = RecordingStrategy::new();
    let params = fast_params(vec![saturated_a.uri(), saturated_b.uri(), accepting.uri()]);
    let strategy = make_strategy(memory_container(store), &params, local);

    strategy
        .build_and_write_from(&job, BuildOrigin::Merge)
        .await
        .unwrap();

    assert_eq!(target.contents(), b"graph-bytes");
    assert_eq!(local_calls.load(Ordering::SeqCst), 0);
    // Only the accepting endpoint saw status queries.
    assert!(saturated_a
        .received_requests()
        .await
        .unwrap()
        .iter()
        .all(|request| request.url.path() == "/_build"));
    let stats = strategy.stats().snapshot();
    assert_eq!(stats.index_build_success_count, 1);
    assert_eq!(stats.current_merge_operations, 0);
    assert_eq!(stats.current_merge_size_bytes, 0);
}

#[tokio::test]
async fn test_submit_hard_failure_falls_back_to_local() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(url_path("/_build"))
        .respond_with(ResponseTemplate::new(500))
        // initial attempt + one retry
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(InMemory::new());
    let vectors = sample_vectors();
    let target = SharedBuffer::new();
    let job = make_job(&vectors, &target);
    let (local, local_calls, last_job) = RecordingStrategy::new();
    let params = fast_params(vec![server.uri()]);
    let strategy = make_strategy(memory_container(store), &params, local);

    strategy
        .build_and_write_from(&job, BuildOrigin::Flush)
        .await
        .unwrap();

    assert_eq!(local_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        last_job.lock().unwrap().clone().unwrap(),
        ("embedding".to_string(), "_0".to_string())
    );
    assert_eq!(target.contents(), LOCAL_ARTIFACT);
    let stats = strategy.stats().snapshot();
    assert_eq!(stats.write_success_count, 1);
    assert_eq!(stats.build_request_failure_count, 1);
    assert_eq!(stats.build_request_success_count, 0);
    assert_eq!(stats.index_build_failure_count, 1);
    assert_eq!(stats.index_build_success_count, 0);
    assert_eq!(stats.current_flush_operations, 0);
}

#[tokio::test]
async fn test_await_timeout_falls_back_to_local() {
    let server = MockServer::start().await;
    mount_submit(&server, "job-4").await;
    Mock::given(method("GET"))
        .and(url_path("/_status/job-4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "task_status": "RUNNING_INDEX_BUILD",
            "index_path": null,
            "error": null
        })))
        .mount(&server)
        .await;

    let store = Arc::new(InMemory::new());
    let vectors = sample_vectors();
    let target = SharedBuffer::new();
    let job = make_job(&vectors, &target);
    let (local, local_calls, _) = RecordingStrategy::new();
    let mut params = fast_params(vec![server.uri()]);
    params.timeout = Duration::from_millis(600);
    params.poll_interval = Duration::from_millis(50);
    let strategy = make_strategy(memory_container(store), &params, local);

    strategy
        .build_and_write_from(&job, BuildOrigin::Flush)
        .await
        .unwrap();

    assert_eq!(local_calls.load(Ordering::SeqCst), 1);
    assert_eq!(target.contents(), LOCAL_ARTIFACT);
    let stats = strategy.stats().snapshot();
    assert!(stats.waiting_time_ms >= 600, "{}", stats.waiting_time_ms);
    assert_eq!(stats.index_build_failure_count, 1);
    assert_eq!(stats.read_success_count, 0);
}

#[tokio::test]
async fn test_upload_failure_falls_back_to_local() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(url_path("/_build"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let vectors = sample_vectors();
    let target = SharedBuffer::new();
    let job = make_job(&vectors, &target);
    let (local, local_calls, _) = RecordingStrategy::new();
    let params = fast_params(vec![server.uri()]);
    let strategy = make_strategy(Arc::new(FailingContainer), &params, local);

    strategy
        .build_and_write_from(&job, BuildOrigin::Flush)
        .await
        .unwrap();

    assert_eq!(local_calls.load(Ordering::SeqCst), 1);
    assert_eq!(target.contents(), LOCAL_ARTIFACT);
    let stats = strategy.stats().snapshot();
    assert_eq!(stats.write_failure_count, 1);
    assert_eq!(stats.write_success_count, 0);
    assert_eq!(stats.build_request_failure_count, 0);
    assert_eq!(stats.index_build_failure_count, 1);
}

#[tokio::test]
async fn test_reported_build_failure_falls_back_to_local() {
    let server = MockServer::start().await;
    mount_submit(&server, "job-5").await;
    Mock::given(method("GET"))
        .and(url_path("/_status/job-5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "task_status": "FAILED_INDEX_BUILD",
            "index_path": null,
            "error": "builder crashed"
        })))
        .mount(&server)
        .await;

    let store = Arc::new(InMemory::new());
    let vectors = sample_vectors();
    let target = SharedBuffer::new();
    let job = make_job(&vectors, &target);
    let (local, local_calls, _) = RecordingStrategy::new();
    let params = fast_params(vec![server.uri()]);
    let strategy = make_strategy(memory_container(store), &params, local);

    strategy
        .build_and_write_from(&job, BuildOrigin::Flush)
        .await
        .unwrap();

    assert_eq!(local_calls.load(Ordering::SeqCst), 1);
    assert_eq!(target.contents(), LOCAL_ARTIFACT);
    let stats = strategy.stats().snapshot();
    assert_eq!(stats.build_request_success_count, 1);
    assert_eq!(stats.index_build_failure_count, 1);
    assert_eq!(stats.read_success_count, 0);
    assert_eq!(stats.read_failure_count, 0);
}

#[tokio::test]
async fn test_download_failure_falls_back_to_local() {
    let server = MockServer::start().await;
    mount_submit(&server, "job-6").await;
    mount_completed_status(&server, "job-6", "out.faiss").await;

    // No artifact in the store, so the download phase fails.
    let store = Arc::new(InMemory::new());
    let vectors = sample_vectors();
    let target = SharedBuffer::new();
    let job = make_job(&vectors, &target);
    let (local, local_calls, _) = RecordingStrategy::new();
    let params = fast_params(vec![server.uri()]);
    let strategy = make_strategy(memory_container(store), &params, local);

    strategy
        .build_and_write_from(&job, BuildOrigin::Flush)
        .await
        .unwrap();

    assert_eq!(local_calls.load(Ordering::SeqCst), 1);
    assert_eq!(target.contents(), LOCAL_ARTIFACT);
    let stats = strategy.stats().snapshot();
    assert_eq!(stats.read_failure_count, 1);
    assert_eq!(stats.read_success_count, 0);
    assert_eq!(stats.index_build_failure_count, 1);
}

#[tokio::test]
async fn test_unflagged_entry_fails_fast_without_fallback() {
    let server = MockServer::start().await;
    let store = Arc::new(InMemory::new());
    let vectors = sample_vectors();
    let target = SharedBuffer::new();
    let job = make_job(&vectors, &target);
    let (local, local_calls, _) = RecordingStrategy::new();
    let params = fast_params(vec![server.uri()]);
    let strategy = make_strategy(memory_container(store), &params, local);

    let err = strategy.build_and_write(&job).await.unwrap_err();
    assert!(err.is_programming_error(), "got {err}");
    assert_eq!(local_calls.load(Ordering::SeqCst), 0);
    assert!(target.contents().is_empty());
    assert_eq!(strategy.stats().snapshot(), Default::default());
}

#[tokio::test]
async fn test_two_jobs_run_concurrently() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(url_path("/_build"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"job_id": "job-a"})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/_build"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"job_id": "job-b"})),
        )
        .mount(&server)
        .await;
    mount_completed_status(&server, "job-a", "a.faiss").await;
    mount_completed_status(&server, "job-b", "b.faiss").await;

    let store = Arc::new(InMemory::new());
    put_artifact(&store, "a.faiss", b"artifact-a").await;
    put_artifact(&store, "b.faiss", b"artifact-b").await;

    let vectors = sample_vectors();
    let target_a = SharedBuffer::new();
    let target_b = SharedBuffer::new();
    let job_a = make_job(&vectors, &target_a);
    let job_b = make_job(&vectors, &target_b);
    let (local, local_calls, _) = RecordingStrategy::new();
    let params = fast_params(vec![server.uri()]);
    let strategy = make_strategy(memory_container(store), &params, local);

    let (first, second) = tokio::join!(
        strategy.build_and_write_from(&job_a, BuildOrigin::Flush),
        strategy.build_and_write_from(&job_b, BuildOrigin::Merge),
    );
    first.unwrap();
    second.unwrap();

    // Both artifacts landed, though either job may have gotten either id.
    let mut artifacts = vec![target_a.contents(), target_b.contents()];
    artifacts.sort();
    assert_eq!(artifacts, vec![b"artifact-a".to_vec(), b"artifact-b".to_vec()]);
    assert_eq!(local_calls.load(Ordering::SeqCst), 0);
    let stats = strategy.stats().snapshot();
    assert_eq!(stats.index_build_success_count, 2);
    assert_eq!(stats.current_flush_operations, 0);
    assert_eq!(stats.current_merge_operations, 0);
}

#[test]
fn test_eligibility_gate_below_threshold() {
    let params = RemoteBuildParams::default()
        .with_repository("r")
        .with_threshold_bytes(10 * 1024 * 1024);
    let settings = IndexSettings {
        index_name: "products".to_string(),
        remote_build_enabled: true,
    };
    assert!(!RemoteIndexBuildStrategy::should_build_remotely(
        &settings,
        &params,
        1024 * 1024
    ));
}
