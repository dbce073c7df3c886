use libc::{EEXIST, EINVAL, EIO, ENOENT};
use thiserror::Error;
use valtown_lib::ApiError;

use crate::package::PackageError;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("already exists: {0}")]
    Exists(String),
    #[error("I/O error: {0}")]
    Io(String),
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => ENOENT,
            FsError::Invalid(_) => EINVAL,
            FsError::Exists(_) => EEXIST,
            FsError::Io(_) => EIO,
        }
    }
}

impl From<ApiError> for FsError {
    fn from(err: ApiError) -> Self {
        FsError::Io(err.to_string())
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(err.to_string())
    }
}

impl From<PackageError> for FsError {
    fn from(err: PackageError) -> Self {
        FsError::Invalid(err.to_string())
    }
}
