use super::UploadError;
use crate::digest::chunk_id;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Steps of a cloud upload, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudStep {
    CreateUpload,
    TransferChunk,
    AssociateChunks,
    Finalize,
}

impl CloudStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudStep::CreateUpload => "create upload",
            CloudStep::TransferChunk => "transfer chunk",
            CloudStep::AssociateChunks => "associate chunks",
            CloudStep::Finalize => "finalize",
        }
    }
}

impl fmt::Display for CloudStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one upload cycle. Built fresh per change and dropped afterwards;
/// tokens are never reused.
#[derive(Debug, Clone)]
pub struct CloudUploadContext {
    pub client_id: String,
    pub upload_token: String,
    pub upload_id: Option<String>,
    pub chunk_id: String,
}

impl CloudUploadContext {
    pub fn new(token: &str, content: &[u8]) -> Result<Self, UploadError> {
        Ok(Self {
            client_id: client_id_from_token(token)?,
            upload_token: token.to_string(),
            upload_id: None,
            chunk_id: chunk_id(content),
        })
    }
}

/// Reads the `iss` claim of a bearer token without verifying it; the
/// platform verifies the token, the client id only routes the request.
pub fn client_id_from_token(token: &str) -> Result<String, UploadError> {
    let claims = token
        .split('.')
        .nth(1)
        .ok_or_else(|| UploadError::InvalidToken("not a JWT".into()))?;
    let raw = URL_SAFE_NO_PAD
        .decode(claims.trim_end_matches('='))
        .map_err(|e| UploadError::InvalidToken(e.to_string()))?;
    let value: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|e| UploadError::InvalidToken(e.to_string()))?;

    value
        .get("iss")
        .and_then(|v| v.as_str())
        .filter(|iss| !iss.is_empty())
        .map(str::to_string)
        .ok_or_else(|| UploadError::InvalidToken("missing iss claim".into()))
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Serialize)]
struct ChunkList<'a> {
    chunks: [&'a str; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeRequest<'a> {
    upload_id: &'a str,
    file_name: &'a str,
}

/// Four-step upload against the cloud media API.
#[derive(Clone)]
pub struct CloudUploader {
    client: reqwest::Client,
    base_url: String,
}

impl CloudUploader {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// Runs create, transfer, associate and finalize strictly in order and
    /// returns the attachment id. The first failing step aborts the cycle.
    pub async fn upload(
        &self,
        token: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<String, UploadError> {
        let mut ctx = CloudUploadContext::new(token, &content)?;
        log::info!(
            "cloud upload of {file_name} ({} bytes) for client {}",
            content.len(),
            ctx.client_id
        );

        let upload_id = self.create_upload(&ctx).await?;
        ctx.upload_id = Some(upload_id.clone());

        self.transfer_chunk(&ctx, content).await?;
        self.associate_chunks(&ctx, &upload_id).await?;
        let attachment_id = self.finalize(&ctx, &upload_id, file_name).await?;

        log::info!("cloud upload of {file_name} finished as {attachment_id}");
        Ok(attachment_id)
    }

    async fn create_upload(&self, ctx: &CloudUploadContext) -> Result<String, UploadError> {
        let step = CloudStep::CreateUpload;
        let response = self
            .send(step, self.request(Method::POST, "/upload?createUpTo=1", ctx))
            .await?;
        let envelope: Envelope<Vec<IdRef>> = response.json().await?;
        envelope
            .data
            .into_iter()
            .next()
            .map(|r| r.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| UploadError::InvalidResponse(format!("{step}: no upload id")))
    }

    async fn transfer_chunk(
        &self,
        ctx: &CloudUploadContext,
        content: Vec<u8>,
    ) -> Result<(), UploadError> {
        let path = format!("/chunk/{}", ctx.chunk_id);
        let request = self.request(Method::PUT, &path, ctx).body(content);
        self.send(CloudStep::TransferChunk, request).await?;
        Ok(())
    }

    async fn associate_chunks(
        &self,
        ctx: &CloudUploadContext,
        upload_id: &str,
    ) -> Result<(), UploadError> {
        let path = format!("/upload/{upload_id}/chunks");
        let body = ChunkList {
            chunks: [ctx.chunk_id.as_str()],
        };
        let request = self.request(Method::PUT, &path, ctx).json(&body);
        self.send(CloudStep::AssociateChunks, request).await?;
        Ok(())
    }

    async fn finalize(
        &self,
        ctx: &CloudUploadContext,
        upload_id: &str,
        file_name: &str,
    ) -> Result<String, UploadError> {
        let step = CloudStep::Finalize;
        let body = FinalizeRequest {
            upload_id,
            file_name,
        };
        let request = self.request(Method::POST, "/file/upload", ctx).json(&body);
        let response = self.send(step, request).await?;
        let envelope: Envelope<IdRef> = response.json().await?;
        if envelope.data.id.is_empty() {
            return Err(UploadError::InvalidResponse(format!(
                "{step}: empty attachment id"
            )));
        }
        Ok(envelope.data.id)
    }

    fn request(&self, method: Method, path: &str, ctx: &CloudUploadContext) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&ctx.upload_token)
            .header("X-Client-Id", &ctx.client_id)
    }

    async fn send(&self, step: CloudStep, request: RequestBuilder) -> Result<Response, UploadError> {
        log::debug!("cloud upload step: {step}");
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            log::warn!("cloud upload step {step} failed with {status}");
            return Err(UploadError::Status {
                step: step.as_str(),
                status,
            });
        }
        Ok(response)
    }
}
