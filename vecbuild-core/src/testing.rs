// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! In-memory cursors for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::vector::{CursorSupplier, VectorCursor, DOC_ID_WIDTH};
use crate::Result;

/// A fixed set of vectors backing any number of fresh cursors.
///
/// The number of cursors handed out is tracked so tests can assert the
/// fresh-cursor-per-pass contract of [`CursorSupplier`].
pub struct TestVectors {
    dimension: u32,
    bytes_per_vector: u32,
    entries: Vec<(u32, Vec<u8>)>,
    cursors_created: AtomicUsize,
}

impl TestVectors {
    /// Float vectors with doc ids `0..n`.
    pub fn from_floats(vectors: &[Vec<f32>]) -> Arc<Self> {
        let ids: Vec<u32> = (0..vectors.len() as u32).collect();
        Self::from_floats_with_ids(vectors, &ids)
    }

    pub fn from_floats_with_ids(vectors: &[Vec<f32>], doc_ids: &[u32]) -> Arc<Self> {
        assert_eq!(vectors.len(), doc_ids.len());
        let dimension = vectors.first().map(|v| v.len() as u32).unwrap_or(0);
        let entries = doc_ids
            .iter()
            .zip(vectors)
            .map(|(doc_id, vector)| {
                assert_eq!(vector.len() as u32, dimension);
                let mut bytes = vec![0u8; vector.len() * 4];
                LittleEndian::write_f32_into(vector, &mut bytes);
                (*doc_id, bytes)
            })
            .collect();
        Arc::new(Self {
            dimension,
            bytes_per_vector: dimension * 4,
            entries,
            cursors_created: AtomicUsize::new(0),
        })
    }

    /// Arbitrary pre-encoded vectors, for byte and binary data types.
    pub fn from_encoded(dimension: u32, bytes_per_vector: u32, entries: Vec<(u32, Vec<u8>)>) -> Arc<Self> {
        for (_, bytes) in &entries {
            assert_eq!(bytes.len() as u32, bytes_per_vector);
        }
        Arc::new(Self {
            dimension,
            bytes_per_vector,
            entries,
            cursors_created: AtomicUsize::new(0),
        })
    }

    pub fn supplier(self: &Arc<Self>) -> CursorSupplier {
        let this = self.clone();
        Arc::new(move || {
            this.cursors_created.fetch_add(1, Ordering::SeqCst);
            Box::new(TestCursor {
                owner: this.clone(),
                position: None,
            })
        })
    }

    pub fn cursors_created(&self) -> usize {
        self.cursors_created.load(Ordering::SeqCst)
    }

    pub fn total_live_docs(&self) -> u64 {
        self.entries.len() as u64
    }

    /// The full vector payload as it should appear in the repository.
    pub fn vector_bytes(&self) -> Vec<u8> {
        self.entries
            .iter()
            .flat_map(|(_, bytes)| bytes.iter().copied())
            .collect()
    }

    /// The full doc-id payload as it should appear in the repository.
    pub fn doc_id_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.entries.len() * DOC_ID_WIDTH as usize];
        for (i, (doc_id, _)) in self.entries.iter().enumerate() {
            LittleEndian::write_u32(&mut out[i * 4..i * 4 + 4], *doc_id);
        }
        out
    }
}

struct TestCursor {
    owner: Arc<TestVectors>,
    position: Option<usize>,
}

impl VectorCursor for TestCursor {
    fn next_doc(&mut self) -> Result<Option<u32>> {
        let next = self.position.map(|p| p + 1).unwrap_or(0);
        if next >= self.owner.entries.len() {
            self.position = Some(self.owner.entries.len());
            return Ok(None);
        }
        self.position = Some(next);
        Ok(Some(self.owner.entries[next].0))
    }

    fn current_vector(&self) -> &[u8] {
        let position = self
            .position
            .filter(|p| *p < self.owner.entries.len())
            .expect("cursor is not positioned on a document");
        &self.owner.entries[position].1
    }

    fn dimension(&self) -> u32 {
        self.owner.dimension
    }

    fn bytes_per_vector(&self) -> u32 {
        self.owner.bytes_per_vector
    }

    fn total_live_docs(&self) -> u64 {
        self.owner.total_live_docs()
    }
}
