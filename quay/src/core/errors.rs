use std::fmt;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::core::checksum::Checksum;

/// A malformed pubspec or lock file. Carries the offending file and a
/// dotted path to the field that failed to parse.
#[derive(Debug, Error)]
#[error("failed to parse {file}: {message}, at `{field}`")]
pub struct ManifestFormatError {
    pub file: String,
    pub field: String,
    pub message: String,
}

impl ManifestFormatError {
    pub fn new(
        file: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The lock file's recorded content hash disagrees with the system cache.
#[derive(Debug, Error)]
#[error(
    "the lock file's content hash for {package} does not match the cached archive\n\
     locked: {locked}\n\
     cached: {cached}\n\
     help: delete the cached package or the lock file entry, then run a fresh resolution"
)]
pub struct HashMismatchError {
    pub package: String,
    pub locked: Checksum,
    pub cached: Checksum,
}

/// A transient fetch problem: connection error, stall, 5xx, checksum
/// mismatch, or a short 429. These are the only errors the fetch pipeline
/// retries.
#[derive(Debug)]
pub struct FetchError {
    pub url: Url,
    pub kind: FetchErrorKind,
    pub retryable: bool,
    /// Server-requested retry delay, when a `Retry-After` header was given.
    pub retry_after: Option<Duration>,
    pub cause: Option<anyhow::Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Connection,
    Timeout,
    Stall,
    Status(u16),
    ChecksumMismatch,
    InvalidBody,
    TooLarge,
    Cancelled,
}

impl FetchError {
    pub fn new(url: Url, kind: FetchErrorKind) -> Self {
        let retryable = !matches!(kind, FetchErrorKind::TooLarge);
        Self {
            url,
            kind,
            retryable,
            retry_after: None,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to fetch {}: {}", self.url, self.kind)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FetchError {}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Connection => f.write_str("connection error"),
            FetchErrorKind::Timeout => f.write_str("response headers did not arrive in time"),
            FetchErrorKind::Stall => f.write_str("transfer stalled"),
            FetchErrorKind::Status(status) => write!(f, "server returned HTTP {status}"),
            FetchErrorKind::ChecksumMismatch => f.write_str("response checksum mismatch"),
            FetchErrorKind::InvalidBody => f.write_str("invalid response body"),
            FetchErrorKind::TooLarge => f.write_str("response exceeds the allowed size"),
            FetchErrorKind::Cancelled => f.write_str("operation cancelled"),
        }
    }
}

/// A definitive (non-retryable) HTTP failure carrying the decoded response.
#[derive(Debug)]
pub struct FetchErrorWithResponse {
    pub url: Url,
    pub status: u16,
    /// Message extracted from an `{"error": {"message": ...}}` body, if any.
    pub message: Option<String>,
}

impl fmt::Display for FetchErrorWithResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{message}"),
            None => write!(f, "{} responded with HTTP {}", self.url, self.status),
        }
    }
}

impl std::error::Error for FetchErrorWithResponse {}

/// The server rejected our API version (HTTP 406 against the pub API).
#[derive(Debug, Error)]
#[error(
    "the package repository at {url} requires a newer client\n\
     help: upgrade quay and try again"
)]
pub struct VersionMismatchError {
    pub url: Url,
}

/// A high-level, user-facing problem with the input data.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DataError(pub String);

/// The solver could not satisfy the constraints; carries the rendered
/// explanation chain.
#[derive(Debug, Error)]
#[error("version solving failed.\n\n{explanation}")]
pub struct ResolutionFailure {
    pub explanation: String,
}

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const GENERIC: i32 = 1;
    /// Input data was incorrect in some way.
    pub const DATA: i32 = 65;
    /// A service is unavailable; typically the network.
    pub const UNAVAILABLE: i32 = 69;
}

/// Maps an error to the process exit code the top-level command handler
/// should use.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    if error.is::<DataError>()
        || error.is::<ManifestFormatError>()
        || error.is::<HashMismatchError>()
    {
        exit_codes::DATA
    } else if error.is::<FetchError>() || error.is::<FetchErrorWithResponse>() {
        exit_codes::UNAVAILABLE
    } else {
        exit_codes::GENERIC
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn exit_code_mapping() {
        assert_eq!(exit_code(&anyhow!(DataError("no pubspec".into()))), 65);
        assert_eq!(
            exit_code(&anyhow!(ManifestFormatError::new(
                "pubspec.yaml",
                "dependencies.foo",
                "expected a map"
            ))),
            65
        );
        assert_eq!(
            exit_code(&anyhow!(FetchError::new(
                "https://pub.dev/api/packages/foo".parse().unwrap(),
                FetchErrorKind::Connection,
            ))),
            69
        );
        assert_eq!(exit_code(&anyhow!("boom")), 1);
    }
}
