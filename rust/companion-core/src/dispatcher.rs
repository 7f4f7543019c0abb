//! Protocol state machine for one companion process.
//!
//! The dispatcher is the single owner of the transaction registry, the trust
//! store and the file watcher registrations. It is driven strictly
//! sequentially: one inbound message or one change signal at a time.
//! Downloads and uploads are awaited inline, so no other message is
//! processed while they run; a transaction's upload therefore always
//! completes before the next one for it can start.

use crate::config::CompanionConfig;
use crate::desktop::DesktopShell;
use crate::digest::ContentDigest;
use crate::http::{self, TransferError};
use crate::protocol::{
    AuthPayload, AuthProvider, AuthStatus, EventName, InboundMessage, LaunchPayload,
    OutboundMessage, UploadPayload,
};
use crate::transaction::{TransactionRegistry, TransactionState, UploadTarget};
use crate::trust::{TrustError, TrustStore};
use crate::upload::{CloudUploader, DirectUploader, UploadError};
use crate::watcher::{ChangeSignal, FileChangeWatcher, WatchError};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifier of the single "open with default application" entry.
pub const DEFAULT_APP_ID: &str = "2a2fe73b2ed43010dba316046ce79923";
pub const DEFAULT_APP_NAME: &str = "Default application";

/// Where outbound messages of the current session go.
pub type Outbox = mpsc::UnboundedSender<OutboundMessage>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch: transfer failed - {0}")]
    Transfer(#[from] TransferError),

    #[error("dispatch: watcher error - {0}")]
    Watch(#[from] WatchError),

    #[error("dispatch: trust store error - {0}")]
    Trust(#[from] TrustError),

    #[error("dispatch: invalid request - {0}")]
    InvalidRequest(String),
}

/// Kind of site the current session authenticated as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    SelfHosted,
    Cloud,
}

pub struct Dispatcher {
    config: Arc<CompanionConfig>,
    registry: TransactionRegistry,
    trust: TrustStore,
    watcher: FileChangeWatcher,
    client: reqwest::Client,
    direct: DirectUploader,
    cloud: CloudUploader,
    shell: Arc<dyn DesktopShell>,
    site_kind: SiteKind,
    next_direct_upload_id: u64,
}

impl Dispatcher {
    /// Builds the dispatcher and starts the file watcher. Change signals
    /// must be fed back through [`Dispatcher::on_change`].
    pub fn new(
        config: Arc<CompanionConfig>,
        trust: TrustStore,
        shell: Arc<dyn DesktopShell>,
    ) -> Result<(Self, mpsc::Receiver<ChangeSignal>), DispatchError> {
        let client = http::build_client(&config.http)?;
        let (watcher, changes) = FileChangeWatcher::start(config.watcher.channel_capacity)?;

        let dispatcher = Self {
            direct: DirectUploader::new(client.clone(), &config.http),
            cloud: CloudUploader::new(client.clone(), config.cloud.base_url.clone()),
            config,
            registry: TransactionRegistry::new(),
            trust,
            watcher,
            client,
            shell,
            site_kind: SiteKind::SelfHosted,
            next_direct_upload_id: 1,
        };
        Ok((dispatcher, changes))
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    pub fn site_kind(&self) -> SiteKind {
        self.site_kind
    }

    pub async fn handle(
        &mut self,
        message: InboundMessage,
        out: &Outbox,
    ) -> Result<(), DispatchError> {
        match message {
            InboundMessage::Authentication {
                request_id,
                payload,
            } => {
                self.authenticate(&request_id, &payload, out);
                Ok(())
            }
            InboundMessage::NewTransaction {
                request_id,
                payload,
            } => {
                if payload.transaction_type != "file" {
                    log::warn!(
                        "ignoring new-transaction of type {:?}",
                        payload.transaction_type
                    );
                    return Ok(());
                }
                let id = self.registry.create();
                log::info!("new transaction {id}");
                emit(out, OutboundMessage::response(request_id, json!(id)));
                Ok(())
            }
            InboundMessage::ListApps { request_id } => {
                let apps = json!([{
                    "displayName": DEFAULT_APP_NAME,
                    "imageURI": "",
                    "id": DEFAULT_APP_ID,
                    "windowsStore": false,
                }]);
                emit(out, OutboundMessage::response(request_id, apps));
                Ok(())
            }
            InboundMessage::LaunchFileInApp {
                transaction_id,
                payload,
            } => self.launch(&transaction_id, payload, out).await,
            InboundMessage::UploadFileInApp {
                transaction_id,
                payload,
            } => {
                self.upload_requested(&transaction_id, payload, out).await;
                Ok(())
            }
            InboundMessage::RequestUploadToken {
                transaction_id,
                payload,
            } => {
                self.cloud_upload(&transaction_id, &payload.token, out).await;
                Ok(())
            }
            InboundMessage::Unsupported => {
                log::debug!("ignoring unsupported message type");
                Ok(())
            }
        }
    }

    /// Reacts to a real content change reported by the watcher.
    pub async fn on_change(
        &mut self,
        signal: ChangeSignal,
        out: &Outbox,
    ) -> Result<(), DispatchError> {
        let id = signal.transaction_id.as_str();
        let Some(tx) = self.registry.get_mut(id) else {
            log::debug!("change for unknown transaction {id}");
            return Ok(());
        };
        if tx.state == TransactionState::Closed
            || tx.file_path.as_deref() != Some(signal.path.as_path())
        {
            log::debug!("stale change for transaction {id} ignored");
            return Ok(());
        }

        tx.content_hash = Some(signal.digest);
        tx.state = TransactionState::ChangeDetected;
        let target = tx.upload_target.clone();
        let application_id = tx.application_id.clone().unwrap_or_default();
        let file_name = tx.file_name.clone().unwrap_or_default();
        let file_id = tx.remote_file_id.clone().unwrap_or(Value::Null);

        match target {
            UploadTarget::Direct(Some(url)) => {
                self.direct_upload(id, &url, file_id, out).await;
            }
            UploadTarget::Direct(None) => {
                emit(
                    out,
                    OutboundMessage::event(EventName::FileChangeDetected, id, json!(application_id)),
                );
            }
            UploadTarget::Cloud => {
                emit(
                    out,
                    OutboundMessage::event(
                        EventName::RequestUploadToken,
                        id,
                        json!({ "fileName": file_name }),
                    ),
                );
            }
        }
        Ok(())
    }

    /// Closes every transaction of the ending session and drops its watches.
    pub fn end_session(&mut self) {
        let closed = self.registry.close_all();
        self.watcher.untrack_all();
        if !closed.is_empty() {
            log::info!("session ended, closed {} transaction(s)", closed.len());
        }
        self.site_kind = SiteKind::SelfHosted;
    }

    fn authenticate(&mut self, request_id: &str, payload: &AuthPayload, out: &Outbox) {
        let site = payload.payload.site_title.as_str();
        let status = match payload.provider {
            AuthProvider::Server => {
                if self.trust.contains(site) {
                    AuthStatus::Accepted
                } else if !site.is_empty() && self.shell.ask_trust(site) {
                    if let Err(e) = self.trust.append(site) {
                        log::warn!("could not persist trust for {site:?}: {e}");
                    }
                    AuthStatus::Accepted
                } else {
                    AuthStatus::Rejected
                }
            }
            AuthProvider::Jwt => AuthStatus::Accepted,
            AuthProvider::Unknown => AuthStatus::Rejected,
        };

        if status == AuthStatus::Accepted {
            self.site_kind = match payload.provider {
                AuthProvider::Jwt => SiteKind::Cloud,
                _ => SiteKind::SelfHosted,
            };
        }
        log::info!("authentication of {site:?} ({:?}): {status:?}", payload.provider);
        emit(out, OutboundMessage::auth_status(request_id, status));
    }

    async fn launch(
        &mut self,
        id: &str,
        payload: LaunchPayload,
        out: &Outbox,
    ) -> Result<(), DispatchError> {
        let path = self
            .config
            .cache_path_for(&payload.file_name)
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;

        // A previous transaction on the same name must not see the download,
        // nor upload the new content later.
        self.watcher.untrack(&path);
        for previous in self.registry.release_path(&path, id) {
            log::info!("transaction {previous} closed, {} relaunched by {id}", path.display());
        }

        let upload_target = match self.site_kind {
            SiteKind::Cloud => UploadTarget::Cloud,
            SiteKind::SelfHosted => UploadTarget::Direct(payload.upload_url.clone()),
        };
        {
            let tx = self.registry.get_or_insert(id);
            tx.application_id = Some(payload.application_id.clone());
            tx.file_name = Some(payload.file_name.clone());
            tx.file_path = Some(path.clone());
            tx.source_url = Some(payload.file_url.clone());
            tx.upload_target = upload_target;
            tx.state = TransactionState::Downloading;
        }

        emit(
            out,
            OutboundMessage::event(EventName::FileDownloadStart, id, json!(payload.application_id)),
        );

        log::info!("downloading {} to {}", payload.file_url, path.display());
        let digest = http::download_to(&self.client, &payload.file_url, &path).await?;

        emit(
            out,
            OutboundMessage::event(EventName::FileDownloaded, id, Value::Null),
        );

        if let Some(tx) = self.registry.get_mut(id) {
            tx.content_hash = Some(digest);
            tx.state = TransactionState::Watching;
        }
        self.watcher.track(id, &path, digest)?;

        if let Err(e) = self.shell.open(&path) {
            log::warn!("could not open {}: {e}", path.display());
            self.shell
                .notify(&format!("Could not open {}: {e}", payload.file_name));
        }
        Ok(())
    }

    async fn upload_requested(&mut self, id: &str, payload: UploadPayload, out: &Outbox) {
        let Some(tx) = self.registry.get_mut(id) else {
            log::warn!("upload requested for unknown transaction {id}");
            return;
        };
        if tx.state == TransactionState::Closed {
            log::warn!("upload requested for closed transaction {id}");
            return;
        }

        let known = match &tx.upload_target {
            UploadTarget::Direct(url) => url.clone(),
            UploadTarget::Cloud => None,
        };
        let Some(url) = payload.upload_url.or(known) else {
            log::warn!("upload requested for {id} without an upload url");
            return;
        };

        tx.upload_target = UploadTarget::Direct(Some(url.clone()));
        tx.remote_file_id = Some(payload.file_id.clone());
        self.direct_upload(id, &url, payload.file_id, out).await;
    }

    async fn direct_upload(&mut self, id: &str, url: &str, file_id: Value, out: &Outbox) {
        let Some((file_name, path)) = self.cached_file(id) else {
            log::warn!("transaction {id} has no downloaded file");
            return;
        };
        let upload_id = self.next_direct_upload_id;
        self.next_direct_upload_id += 1;

        self.registry.set_state(id, TransactionState::Uploading);
        emit(
            out,
            OutboundMessage::event(
                EventName::FileDirectUploadStart,
                id,
                json!({ "fileID": file_id, "directUploadId": upload_id }),
            ),
        );

        let result = match tokio::fs::read(&path).await {
            Ok(content) => self.direct.upload(url, &file_name, content).await,
            Err(e) => Err(UploadError::Io(e)),
        };

        match result {
            Ok(()) => {
                emit(
                    out,
                    OutboundMessage::event(
                        EventName::FileDirectUploadProgress,
                        id,
                        json!({ "progress": { "percentage": 100 }, "directUploadId": upload_id }),
                    ),
                );
                emit(
                    out,
                    OutboundMessage::event(
                        EventName::FileDirectUploadEnd,
                        id,
                        json!({ "fileID": file_id, "directUploadId": upload_id }),
                    ),
                );
            }
            Err(e) => {
                log::warn!("upload of {file_name} failed: {e}");
                self.shell
                    .notify(&format!("Upload of {file_name} failed: {e}"));
                emit(
                    out,
                    OutboundMessage::event(
                        EventName::FileDirectUploadError,
                        id,
                        json!({
                            "fileID": file_id,
                            "directUploadId": upload_id,
                            "reason": e.to_string(),
                        }),
                    ),
                );
            }
        }
        self.registry.set_state(id, TransactionState::Watching);
    }

    async fn cloud_upload(&mut self, id: &str, token: &str, out: &Outbox) {
        let Some((file_name, path)) = self.cached_file(id) else {
            log::warn!("upload token for unknown or empty transaction {id}");
            return;
        };

        self.registry.set_state(id, TransactionState::Uploading);
        emit(
            out,
            OutboundMessage::event(
                EventName::FileUploadStart,
                id,
                json!({ "fileName": file_name }),
            ),
        );

        let result = match tokio::fs::read(&path).await {
            Ok(content) => self.cloud.upload(token, &file_name, content).await,
            Err(e) => Err(UploadError::Io(e)),
        };

        match result {
            Ok(attachment_id) => {
                emit(
                    out,
                    OutboundMessage::event(
                        EventName::FileUploadProgress,
                        id,
                        json!({ "percentage": 100 }),
                    ),
                );
                emit(
                    out,
                    OutboundMessage::event(
                        EventName::FileUploaded,
                        id,
                        json!({ "id": attachment_id, "fileName": file_name }),
                    ),
                );
            }
            Err(e) => {
                log::warn!("cloud upload of {file_name} failed: {e}");
                self.shell
                    .notify(&format!("Upload of {file_name} failed: {e}"));
                emit(
                    out,
                    OutboundMessage::event(
                        EventName::FileUploadError,
                        id,
                        json!({ "reason": e.to_string() }),
                    ),
                );
            }
        }
        self.registry.set_state(id, TransactionState::Watching);
    }

    fn cached_file(&self, id: &str) -> Option<(String, PathBuf)> {
        let tx = self
            .registry
            .get(id)
            .filter(|tx| tx.state != TransactionState::Closed)?;
        Some((tx.file_name.clone()?, tx.file_path.clone()?))
    }

    /// Digest currently recorded for a transaction.
    pub fn content_hash(&self, id: &str) -> Option<ContentDigest> {
        self.registry.get(id)?.content_hash
    }
}

fn emit(out: &Outbox, message: OutboundMessage) {
    log::debug!("> {message:?}");
    if out.send(message).is_err() {
        log::debug!("session closed, outbound message dropped");
    }
}
