//! Error types for the object manager
//!
//! Every failure a request handler can hit before its commit point is one
//! of these variants. Handlers never let them escape; they are turned into
//! an error response carrying only the [`ResultCode`].

use crate::types::NameError;
use thiserror::Error;

/// Result type for object manager operations
pub type OmResult<T> = std::result::Result<T, OmError>;

/// Object manager error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OmError {
    // Authorization errors
    #[error("permission denied: user {user} cannot {action} {resource}")]
    PermissionDenied {
        user: String,
        action: String,
        resource: String,
    },

    // Volume errors
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("volume already exists: {0}")]
    VolumeAlreadyExists(String),

    #[error("volume is not empty: {0}")]
    VolumeNotEmpty(String),

    #[error("invalid volume name: {0}")]
    InvalidVolumeName(NameError),

    // Bucket errors
    #[error("bucket not found: {volume}/{bucket}")]
    BucketNotFound { volume: String, bucket: String },

    #[error("bucket already exists: {volume}/{bucket}")]
    BucketAlreadyExists { volume: String, bucket: String },

    #[error("bucket is not empty: {volume}/{bucket}")]
    BucketNotEmpty { volume: String, bucket: String },

    #[error("invalid bucket name: {0}")]
    InvalidBucketName(NameError),

    // Key errors
    #[error("key not found: {volume}/{bucket}/{key}")]
    KeyNotFound {
        volume: String,
        bucket: String,
        key: String,
    },

    #[error("invalid key name: {0}")]
    InvalidKeyName(String),

    #[error("quota exceeded in volume {volume}: quota {quota} bytes, required {required} bytes")]
    QuotaExceeded {
        volume: String,
        quota: u64,
        required: u64,
    },

    // Request errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl OmError {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn bucket_not_found(volume: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self::BucketNotFound {
            volume: volume.into(),
            bucket: bucket.into(),
        }
    }

    pub fn key_not_found(
        volume: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::KeyNotFound {
            volume: volume.into(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Result code reported to the client
    #[must_use]
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::PermissionDenied { .. } => ResultCode::PermissionDenied,
            Self::VolumeNotFound(_) => ResultCode::VolumeNotFound,
            Self::VolumeAlreadyExists(_) => ResultCode::VolumeAlreadyExists,
            Self::VolumeNotEmpty(_) => ResultCode::VolumeNotEmpty,
            Self::InvalidVolumeName(_) => ResultCode::InvalidVolumeName,
            Self::BucketNotFound { .. } => ResultCode::BucketNotFound,
            Self::BucketAlreadyExists { .. } => ResultCode::BucketAlreadyExists,
            Self::BucketNotEmpty { .. } => ResultCode::BucketNotEmpty,
            Self::InvalidBucketName(_) => ResultCode::InvalidBucketName,
            Self::KeyNotFound { .. } => ResultCode::KeyNotFound,
            Self::InvalidKeyName(_) => ResultCode::InvalidKeyName,
            Self::QuotaExceeded { .. } => ResultCode::QuotaExceeded,
            Self::InvalidRequest(_) => ResultCode::InvalidRequest,
            Self::Internal(_) => ResultCode::InternalError,
        }
    }

    /// Coarse classification of the error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.result_code().kind()
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Coarse error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authorization,
    NotFound,
    Precondition,
    Internal,
}

/// Status codes carried by responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Ok,
    PermissionDenied,
    VolumeNotFound,
    VolumeAlreadyExists,
    VolumeNotEmpty,
    InvalidVolumeName,
    BucketNotFound,
    BucketAlreadyExists,
    BucketNotEmpty,
    InvalidBucketName,
    KeyNotFound,
    InvalidKeyName,
    QuotaExceeded,
    InvalidRequest,
    InternalError,
}

impl ResultCode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::VolumeNotFound => "VOLUME_NOT_FOUND",
            Self::VolumeAlreadyExists => "VOLUME_ALREADY_EXISTS",
            Self::VolumeNotEmpty => "VOLUME_NOT_EMPTY",
            Self::InvalidVolumeName => "INVALID_VOLUME_NAME",
            Self::BucketNotFound => "BUCKET_NOT_FOUND",
            Self::BucketAlreadyExists => "BUCKET_ALREADY_EXISTS",
            Self::BucketNotEmpty => "BUCKET_NOT_EMPTY",
            Self::InvalidBucketName => "INVALID_BUCKET_NAME",
            Self::KeyNotFound => "KEY_NOT_FOUND",
            Self::InvalidKeyName => "INVALID_KEY_NAME",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied => ErrorKind::Authorization,
            Self::VolumeNotFound | Self::BucketNotFound | Self::KeyNotFound => ErrorKind::NotFound,
            Self::Ok | Self::InternalError => ErrorKind::Internal,
            _ => ErrorKind::Precondition,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
