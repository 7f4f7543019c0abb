//! Shared HTTP client and download helpers.

use crate::config::HttpConfig;
use crate::digest::{ContentDigest, DigestWriter};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer: network error - {0}")]
    Network(#[from] reqwest::Error),

    #[error("transfer: {url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("transfer: io error - {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the client shared by downloads and both upload protocols.
pub fn build_client(config: &HttpConfig) -> Result<reqwest::Client, TransferError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(config.user_agent.clone())
        .build()?)
}

/// Streams `url` into `dest`, overwriting any existing file, and returns
/// the digest of the bytes written.
pub async fn download_to(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<ContentDigest, TransferError> {
    let mut response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(TransferError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut digest = DigestWriter::new();
    let mut written = 0usize;

    while let Some(chunk) = response.chunk().await? {
        digest.update(&chunk);
        file.write_all(&chunk).await?;
        written += chunk.len();
    }
    file.flush().await?;
    file.sync_all().await?;

    log::debug!("downloaded {written} bytes to {}", dest.display());
    Ok(digest.finish())
}

pub async fn fetch_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> Result<T, TransferError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(TransferError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }
    Ok(response.json::<T>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn client() -> reqwest::Client {
        build_client(&HttpConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_download_digest_matches_source() {
        let mut server = mockito::Server::new_async().await;
        let body = b"PK\x03\x04 docx bytes".to_vec();
        let _m = server
            .mock("GET", "/doc.docx")
            .with_status(200)
            .with_body(body.clone())
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("doc.docx");
        fs::write(&dest, b"stale content that is longer than the new one").unwrap();

        let url = format!("{}/doc.docx", server.url());
        let digest = download_to(&client(), &url, &dest).await.unwrap();

        assert_eq!(digest, ContentDigest::of_bytes(&body));
        assert_eq!(fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn test_download_rejects_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let url = format!("{}/missing", server.url());
        let err = download_to(&client(), &url, &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Status { status, .. } if status.as_u16() == 404));
    }
}
