// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! Core error and vector value types for the vecbuild workspace.

pub mod error;
pub mod testing;
pub mod vector;

pub use error::{box_error, Error, Result};
pub use vector::{CursorSupplier, Engine, VectorCursor, VectorDataType, DOC_ID_WIDTH};
