//! Upload protocols for edited documents.
//!
//! Self-hosted sites take a single multipart POST ([`DirectUploader`]).
//! Cloud sites use a four-step token/chunk negotiation ([`CloudUploader`]).
//! Both share one HTTP client. A failed upload is never retried here; the
//! caller reports it and keeps watching for the next edit.

mod cloud;
mod direct;

pub use cloud::{client_id_from_token, CloudStep, CloudUploadContext, CloudUploader};
pub use direct::DirectUploader;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload: network error - {0}")]
    Network(#[from] reqwest::Error),

    #[error("upload: {step} returned {status}")]
    Status {
        step: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("upload: invalid upload url {0}")]
    InvalidUrl(String),

    #[error("upload: invalid token - {0}")]
    InvalidToken(String),

    #[error("upload: unexpected response - {0}")]
    InvalidResponse(String),

    #[error("upload: io error - {0}")]
    Io(#[from] std::io::Error),
}
