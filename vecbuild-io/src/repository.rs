// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! Blob repository access for the remote build pipeline.
//!
//! [`BlobContainer`] is the seam to the storage driver. The provided
//! [`ObjectStoreBlobContainer`] maps it onto [`object_store::ObjectStore`]:
//! parallel uploads use a multipart upload with a bounded number of part
//! futures in flight, the sequential path streams through a fixed buffer.

use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use snafu::location;
use tokio::task::JoinSet;
use vecbuild_core::{CursorSupplier, Engine, Error, Result, DOC_ID_WIDTH};

use crate::sink::BufferedSink;
use crate::stream::{DocIdByteStream, VectorByteStream};

/// Extension of the raw vector payload blob.
pub const VECTOR_BLOB_FILE_EXTENSION: &str = ".knnvec";
/// Extension of the raw doc-id payload blob.
pub const DOC_ID_FILE_EXTENSION: &str = ".knndid";

const DEFAULT_PART_SIZE: u64 = 16 * 1024 * 1024;
const DEFAULT_BUFFER_BYTES: usize = 1024 * 1024;
const DEFAULT_UPLOAD_PARALLELISM: usize = 10;

/// Upload tuning shared by the accessor and the orchestrator settings.
#[derive(Debug, Clone)]
pub struct UploadParams {
    /// Buffer size for single-stream uploads and downloads.
    pub buffer_bytes: usize,
    /// Disables the parallel path even when the container supports it.
    pub force_single_stream: bool,
}

impl Default for UploadParams {
    fn default() -> Self {
        Self {
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            force_single_stream: false,
        }
    }
}

/// Creates one part stream given `(part_no, len, position)`. Every call must
/// return a fresh stream positioned at `position` and bounded to `len` bytes.
pub type PartStreamSupplier<'a> =
    dyn Fn(u32, u64, u64) -> Result<Box<dyn Read + Send>> + Send + Sync + 'a;

/// A named bucket/prefix inside a repository.
#[async_trait]
pub trait BlobContainer: Send + Sync {
    /// True when the container can upload a blob as parallel parts.
    fn supports_parallel_write(&self) -> bool {
        false
    }

    /// Part size the container will request from a part supplier.
    fn part_size(&self) -> u64;

    /// Sequential upload of `len` bytes from `reader`, copying through a
    /// buffer of `buffer_bytes`.
    async fn write_blob(
        &self,
        name: &str,
        reader: Box<dyn Read + Send>,
        len: u64,
        buffer_bytes: usize,
    ) -> Result<()>;

    /// Parallel multipart upload of `len` bytes. Part `i` covers bytes
    /// `[i * part_size, min((i + 1) * part_size, len))`. A part stream that
    /// yields fewer bytes than requested fails the whole upload.
    async fn write_blob_parts(
        &self,
        name: &str,
        len: u64,
        parts: &PartStreamSupplier<'_>,
    ) -> Result<()> {
        let _ = (name, len, parts);
        Err(Error::Internal {
            message: "container does not support parallel blob upload".to_string(),
            location: location!(),
        })
    }

    /// Sequential streaming read of a finished blob.
    async fn read_blob(&self, name: &str) -> Result<BoxStream<'static, Result<Bytes>>>;
}

/// [`BlobContainer`] backed by any [`object_store::ObjectStore`].
pub struct ObjectStoreBlobContainer {
    store: Arc<dyn ObjectStore>,
    base_path: Path,
    part_size: u64,
    upload_parallelism: usize,
    parallel: bool,
}

impl ObjectStoreBlobContainer {
    pub fn new(store: Arc<dyn ObjectStore>, base_path: Path) -> Self {
        Self {
            store,
            base_path,
            part_size: DEFAULT_PART_SIZE,
            upload_parallelism: DEFAULT_UPLOAD_PARALLELISM,
            parallel: true,
        }
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn with_upload_parallelism(mut self, upload_parallelism: usize) -> Self {
        self.upload_parallelism = upload_parallelism.max(1);
        self
    }

    /// Marks the container as incapable of parallel uploads, forcing the
    /// sequential path.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn blob_path(&self, name: &str) -> Path {
        self.base_path.child(name)
    }
}

impl std::fmt::Debug for ObjectStoreBlobContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ObjectStoreBlobContainer({}, part_size: {})",
            self.base_path, self.part_size
        )
    }
}

/// Fill `buf` from `reader`, short only at end of stream.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[async_trait]
impl BlobContainer for ObjectStoreBlobContainer {
    fn supports_parallel_write(&self) -> bool {
        self.parallel
    }

    fn part_size(&self) -> u64 {
        self.part_size
    }

    async fn write_blob(
        &self,
        name: &str,
        mut reader: Box<dyn Read + Send>,
        len: u64,
        buffer_bytes: usize,
    ) -> Result<()> {
        let path = self.blob_path(name);
        let mut upload = self.store.put_multipart(&path).await?;
        let mut buf = vec![0u8; buffer_bytes.max(1)];
        let mut written = 0u64;
        loop {
            let n = read_full(&mut *reader, &mut buf)?;
            if n == 0 {
                break;
            }
            upload
                .put_part(PutPayload::from(Bytes::copy_from_slice(&buf[..n])))
                .await?;
            written += n as u64;
        }
        if written != len {
            upload.abort().await.ok();
            return Err(Error::Upload {
                message: format!("wrote {written} bytes to {path}, expected {len}"),
                location: location!(),
            });
        }
        upload.complete().await?;
        Ok(())
    }

    async fn write_blob_parts(
        &self,
        name: &str,
        len: u64,
        parts: &PartStreamSupplier<'_>,
    ) -> Result<()> {
        let path = self.blob_path(name);
        let part_size = self.part_size;
        let num_parts = len.div_ceil(part_size);
        log::debug!("parallel upload of {path}: {num_parts} parts of up to {part_size} bytes");

        let mut upload = self.store.put_multipart(&path).await?;
        let mut in_flight: JoinSet<object_store::Result<()>> = JoinSet::new();
        let result: Result<()> = async {
            for part_no in 0..num_parts {
                let position = part_no * part_size;
                let size = part_size.min(len - position);
                while in_flight.len() >= self.upload_parallelism {
                    match in_flight.join_next().await {
                        Some(joined) => joined??,
                        None => break,
                    }
                }
                let mut reader = parts(part_no as u32, size, position)?;
                let mut data = Vec::with_capacity(size as usize);
                let read = reader.by_ref().take(size).read_to_end(&mut data)?;
                if (read as u64) < size {
                    return Err(Error::Upload {
                        message: format!(
                            "part {part_no} of {path} produced {read} bytes, expected {size}"
                        ),
                        location: location!(),
                    });
                }
                in_flight.spawn(upload.put_part(PutPayload::from(Bytes::from(data))));
            }
            while let Some(joined) = in_flight.join_next().await {
                joined??;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                upload.complete().await?;
                Ok(())
            }
            Err(e) => {
                in_flight.abort_all();
                upload.abort().await.ok();
                Err(e)
            }
        }
    }

    async fn read_blob(&self, name: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let path = self.blob_path(name);
        let result = self.store.get(&path).await?;
        Ok(result.into_stream().map_err(Error::from).boxed())
    }
}

/// Publishes the vector and doc-id payloads of one build job and later
/// downloads the finished artifact.
pub struct VectorRepositoryAccessor {
    container: Arc<dyn BlobContainer>,
    params: UploadParams,
}

impl VectorRepositoryAccessor {
    pub fn new(container: Arc<dyn BlobContainer>, params: UploadParams) -> Self {
        Self { container, params }
    }

    /// Write `<blob_name>.knnvec` and `<blob_name>.knndid`.
    ///
    /// With a parallel-capable container the vector blob goes out as
    /// multipart parts, each backed by its own freshly positioned cursor,
    /// while the doc-id blob uploads sequentially alongside it. Both blobs
    /// are complete when this returns.
    pub async fn write_to_repository(
        &self,
        blob_name: &str,
        total_live_docs: u64,
        supplier: &CursorSupplier,
    ) -> Result<()> {
        let bytes_per_vector = supplier().bytes_per_vector() as u64;
        if bytes_per_vector == 0 {
            return Err(Error::invalid_input("vector width is zero", location!()));
        }
        let vector_blob = format!("{blob_name}{VECTOR_BLOB_FILE_EXTENSION}");
        let doc_id_blob = format!("{blob_name}{DOC_ID_FILE_EXTENSION}");
        let vector_blob_len = total_live_docs * bytes_per_vector;
        let doc_id_len = total_live_docs * DOC_ID_WIDTH;

        if self.container.supports_parallel_write() && !self.params.force_single_stream {
            log::debug!("container supports parallel upload for {vector_blob}");
            let part_supplier = |part_no: u32, size: u64, position: u64| -> Result<Box<dyn Read + Send>> {
                log::debug!(
                    "creating vector stream for part {part_no}, size {size}, position {position}"
                );
                let stream = VectorByteStream::for_range(supplier(), position, size)?;
                Ok(Box::new(stream))
            };
            let vectors =
                self.container
                    .write_blob_parts(&vector_blob, vector_blob_len, &part_supplier);
            let doc_ids = self.write_doc_ids(&doc_id_blob, doc_id_len, supplier);
            futures::try_join!(vectors, doc_ids)?;
        } else {
            if self.params.force_single_stream {
                log::debug!("single stream upload forced for {vector_blob}");
            } else {
                log::debug!("container does not support parallel upload for {vector_blob}");
            }
            let started = Instant::now();
            let stream = VectorByteStream::with_limit(supplier(), vector_blob_len);
            self.container
                .write_blob(
                    &vector_blob,
                    Box::new(stream),
                    vector_blob_len,
                    self.params.buffer_bytes,
                )
                .await?;
            log::debug!(
                "wrote {vector_blob_len} bytes for {total_live_docs} docs to {vector_blob} \
                 with buffer size {} in {} ms",
                self.params.buffer_bytes,
                started.elapsed().as_millis()
            );
            self.write_doc_ids(&doc_id_blob, doc_id_len, supplier).await?;
        }
        Ok(())
    }

    async fn write_doc_ids(
        &self,
        doc_id_blob: &str,
        doc_id_len: u64,
        supplier: &CursorSupplier,
    ) -> Result<()> {
        let started = Instant::now();
        let stream = DocIdByteStream::new(supplier());
        self.container
            .write_blob(
                doc_id_blob,
                Box::new(stream),
                doc_id_len,
                self.params.buffer_bytes,
            )
            .await?;
        log::debug!(
            "wrote {doc_id_len} bytes of doc ids to {doc_id_blob} in {} ms",
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Stream the finished index artifact into the segment sink.
    pub async fn read_from_repository(
        &self,
        file_name: &str,
        sink: &mut BufferedSink,
        engine: Engine,
    ) -> Result<()> {
        if file_name.trim().is_empty() {
            return Err(Error::invalid_input("download path is empty", location!()));
        }
        if !file_name.ends_with(engine.artifact_extension()) {
            return Err(Error::invalid_input(
                format!(
                    "download path [{file_name}] does not end with extension [{}]",
                    engine.artifact_extension()
                ),
                location!(),
            ));
        }
        // Sequential download only; the artifact is written once and read once.
        let started = Instant::now();
        let mut stream = self.container.read_blob(file_name).await?;
        let mut buffer = vec![0u8; self.params.buffer_bytes.max(1)];
        let total = sink
            .write_from_stream_with_buffer(&mut stream, &mut buffer)
            .await?;
        log::debug!(
            "repository read of {file_name} copied {total} bytes with buffer size {} in {} ms",
            buffer.len(),
            started.elapsed().as_millis()
        );
        Ok(())
    }
}
