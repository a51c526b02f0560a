// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

use snafu::{Location, Snafu};

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub fn box_error(e: impl std::error::Error + Send + Sync + 'static) -> BoxedError {
    Box::new(e)
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid input: {source}, {location}"))]
    InvalidInput {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("VecbuildError(IO): {message}, {location}"))]
    IO { message: String, location: Location },
    #[snafu(display("Repository upload failed: {message}, {location}"))]
    Upload { message: String, location: Location },
    #[snafu(display("Repository download failed: {message}, {location}"))]
    Download { message: String, location: Location },
    #[snafu(display("All remote build endpoints rejected the submission, {location}"))]
    AllEndpointsRejected { location: Location },
    #[snafu(display("Remote build service returned HTTP {status}: {message}, {location}"))]
    Http {
        status: u16,
        message: String,
        location: Location,
    },
    #[snafu(display("Remote build failed: {message}, {location}"))]
    BuildFailed { message: String, location: Location },
    #[snafu(display("Remote build timed out after {elapsed_ms} ms, {location}"))]
    BuildTimeout { elapsed_ms: u64, location: Location },
    #[snafu(display("Protocol violation: {message}, {location}"))]
    Protocol { message: String, location: Location },
    #[snafu(display("Encountered internal error. Please file a bug report at https://github.com/vecbuild/vecbuild/issues. {message}, {location}"))]
    Internal { message: String, location: Location },
}

impl Error {
    pub fn io(message: impl Into<String>, location: Location) -> Self {
        Self::IO {
            message: message.into(),
            location,
        }
    }

    pub fn invalid_input(message: impl Into<String>, location: Location) -> Self {
        let message: String = message.into();
        Self::InvalidInput {
            source: message.into(),
            location,
        }
    }

    /// Programming errors are always fatal and must never trigger the local
    /// fallback path.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

trait ToSnafuLocation {
    fn to_snafu_location(&'static self) -> snafu::Location;
}

impl ToSnafuLocation for std::panic::Location<'static> {
    fn to_snafu_location(&'static self) -> snafu::Location {
        snafu::Location::new(self.file(), self.line(), self.column())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        Self::IO {
            message: e.to_string(),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

impl From<object_store::Error> for Error {
    #[track_caller]
    fn from(e: object_store::Error) -> Self {
        Self::IO {
            message: e.to_string(),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

impl From<object_store::path::Error> for Error {
    #[track_caller]
    fn from(e: object_store::path::Error) -> Self {
        Self::IO {
            message: e.to_string(),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

impl From<serde_json::Error> for Error {
    #[track_caller]
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol {
            message: e.to_string(),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    #[track_caller]
    fn from(e: tokio::task::JoinError) -> Self {
        Self::IO {
            message: e.to_string(),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

impl From<url::ParseError> for Error {
    #[track_caller]
    fn from(e: url::ParseError) -> Self {
        Self::invalid_input(
            e.to_string(),
            std::panic::Location::caller().to_snafu_location(),
        )
    }
}

// Some object_store entry points only accept their own error type, so we
// need the reverse conversion to call them.
impl From<Error> for object_store::Error {
    fn from(err: Error) -> Self {
        Self::Generic {
            store: "N/A",
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_question_mark_captures_location() {
        let f: Box<dyn Fn() -> Result<()>> = Box::new(|| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
            Ok(())
        });
        match f().unwrap_err() {
            Error::IO { message, .. } => assert!(message.contains("boom")),
            e => panic!("expected IO error, got {e}"),
        }
    }

    #[test]
    fn test_programming_error_classification() {
        let err = Error::Internal {
            message: "bad call".to_string(),
            location: snafu::location!(),
        };
        assert!(err.is_programming_error());
        let err = Error::BuildTimeout {
            elapsed_ms: 10,
            location: snafu::location!(),
        };
        assert!(!err.is_programming_error());
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let parse: Result<serde_json::Value> =
            serde_json::from_str("{not json").map_err(Error::from);
        assert!(matches!(parse.unwrap_err(), Error::Protocol { .. }));
    }
}
