//! Backend's own error enum (spec.md §7), mapped 1:1 onto `RpcError` at the
//! capability boundary in `capability.rs`.

use shared_types::RpcError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("grain not found: {0}")]
    GrainNotFound(String),
    #[error("package not found: {0}")]
    PackageNotFound(String),
    #[error("invalid input: {0}")]
    InputInvalid(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("package verification failed: {0}")]
    PackageInvalid(#[from] shared_types::spk::SpkError),
    #[error("manifest error: {0}")]
    Manifest(#[from] shared_types::ManifestError),
    #[error("filename contains embedded newline")]
    UnsafeFilename,
}

impl From<Error> for RpcError {
    fn from(e: Error) -> Self {
        let text = e.to_string();
        match e {
            Error::GrainNotFound(_) | Error::PackageNotFound(_) => RpcError::NotFound,
            Error::InputInvalid(msg) => RpcError::InputInvalid(msg),
            Error::UnsafeFilename => RpcError::InputInvalid(text),
            Error::PackageInvalid(_) | Error::Manifest(_) => RpcError::InputInvalid(text),
            Error::Io(_) | Error::Spawn(_) => RpcError::IoFatal(text),
        }
    }
}
