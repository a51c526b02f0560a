// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! Cursor byte streams, the buffered segment sink, and blob repository
//! access for the vecbuild workspace.

pub mod repository;
pub mod sink;
pub mod stream;
pub mod testing;

pub use repository::{
    BlobContainer, ObjectStoreBlobContainer, UploadParams, VectorRepositoryAccessor,
    DOC_ID_FILE_EXTENSION, VECTOR_BLOB_FILE_EXTENSION,
};
pub use sink::BufferedSink;
pub use stream::{DocIdByteStream, VectorByteStream};
