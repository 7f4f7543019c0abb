use super::UploadError;
use crate::config::HttpConfig;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, HOST, ORIGIN};
use reqwest::multipart::{Form, Part};
use reqwest::Url;

const CSRF_HEADER: &str = "X-Atlassian-Token";

/// Single multipart POST to a self-hosted site's attachment URL.
#[derive(Clone)]
pub struct DirectUploader {
    client: reqwest::Client,
    accept_language: String,
    comment: String,
}

impl DirectUploader {
    pub fn new(client: reqwest::Client, config: &HttpConfig) -> Self {
        Self {
            client,
            accept_language: config.accept_language.clone(),
            comment: config.upload_comment.clone(),
        }
    }

    pub async fn upload(
        &self,
        upload_url: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<(), UploadError> {
        let headers = self.headers_for(upload_url)?;
        let size = content.len();
        let form = Form::new()
            .text("comment", self.comment.clone())
            .part("file", Part::bytes(content).file_name(file_name.to_string()));

        log::info!("uploading {file_name} ({size} bytes) to {upload_url}");
        let response = self
            .client
            .post(upload_url)
            .headers(headers)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("direct upload of {file_name} failed with {status}: {body}");
            return Err(UploadError::Status {
                step: "direct upload",
                status,
            });
        }
        Ok(())
    }

    fn headers_for(&self, upload_url: &str) -> Result<HeaderMap, UploadError> {
        let url = Url::parse(upload_url).map_err(|_| UploadError::InvalidUrl(upload_url.into()))?;
        let host = url
            .host_str()
            .ok_or_else(|| UploadError::InvalidUrl(upload_url.into()))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let origin = format!("{}://{authority}", url.scheme());

        let value =
            |v: &str| HeaderValue::from_str(v).map_err(|_| UploadError::InvalidUrl(upload_url.into()));

        let mut headers = HeaderMap::new();
        headers.insert(HOST, value(&authority)?);
        headers.insert(ORIGIN, value(&origin)?);
        headers.insert(ACCEPT_LANGUAGE, value(&self.accept_language)?);
        headers.insert(CSRF_HEADER, HeaderValue::from_static("nocheck"));
        Ok(headers)
    }
}
