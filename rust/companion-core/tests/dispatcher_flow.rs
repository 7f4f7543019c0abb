mod common;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use common::{replace_content, test_config, RecordingShell};
use companion_core::dispatcher::DEFAULT_APP_ID;
use companion_core::{
    ChangeSignal, CompanionConfig, ContentDigest, DispatchError, Dispatcher, InboundMessage,
    OutboundMessage, TransactionState, TrustStore, UploadTarget,
};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Harness {
    _dir: TempDir,
    config: Arc<CompanionConfig>,
    dispatcher: Dispatcher,
    changes: mpsc::Receiver<ChangeSignal>,
    shell: Arc<RecordingShell>,
    out: mpsc::UnboundedSender<OutboundMessage>,
    sent: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Harness {
    fn new(shell: RecordingShell, cloud_url: Option<String>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        if let Some(url) = cloud_url {
            config.cloud.base_url = url;
        }
        let config = Arc::new(config);
        let trust = TrustStore::open(config.trust_store_path()).unwrap();
        let shell = Arc::new(shell);
        let (dispatcher, changes) =
            Dispatcher::new(Arc::clone(&config), trust, shell.clone()).unwrap();
        let (out, sent) = mpsc::unbounded_channel();
        Self {
            _dir: dir,
            config,
            dispatcher,
            changes,
            shell,
            out,
            sent,
        }
    }

    async fn try_send(&mut self, message: Value) -> Result<(), DispatchError> {
        let message = InboundMessage::parse(&message.to_string()).unwrap();
        self.dispatcher.handle(message, &self.out).await
    }

    async fn send(&mut self, message: Value) {
        self.try_send(message).await.unwrap();
    }

    async fn change(&mut self, id: &str, content: &[u8]) {
        let path = self.cache_path("doc.docx");
        fs::write(&path, content).unwrap();
        let signal = ChangeSignal {
            transaction_id: id.to_string(),
            path,
            digest: ContentDigest::of_bytes(content),
        };
        self.dispatcher.on_change(signal, &self.out).await.unwrap();
    }

    fn drain(&mut self) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Ok(message) = self.sent.try_recv() {
            messages.push(serde_json::to_value(&message).unwrap());
        }
        messages
    }

    fn cache_path(&self, name: &str) -> PathBuf {
        self.config.cache_dir.join(name)
    }

    async fn authenticate(&mut self, provider: &str, site: &str) -> Value {
        self.send(json!({
            "type": "authentication",
            "requestID": "auth-1",
            "payload": {"type": provider, "payload": {"siteTitle": site}}
        }))
        .await;
        self.drain().pop().unwrap()
    }

    async fn launch(&mut self, server: &mut mockito::ServerGuard, upload_url: Option<String>) {
        self.launch_as(server, "t1", "original", upload_url).await;
    }

    /// Launches `doc.docx` under `id`, served from a per-transaction URL.
    async fn launch_as(
        &mut self,
        server: &mut mockito::ServerGuard,
        id: &str,
        body: &str,
        upload_url: Option<String>,
    ) {
        let route = format!("/download/{id}/doc.docx");
        server
            .mock("GET", route.as_str())
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;
        let mut payload = json!({
            "applicationID": DEFAULT_APP_ID,
            "fileURL": format!("{}{route}", server.url()),
            "fileName": "doc.docx",
        });
        if let Some(url) = upload_url {
            payload["uploadUrl"] = json!(url);
        }
        self.send(json!({
            "type": "launch-file-in-app",
            "transactionID": id,
            "payload": payload,
        }))
        .await;
    }
}

fn event_names(messages: &[Value]) -> Vec<&str> {
    messages
        .iter()
        .filter_map(|m| m["eventName"].as_str())
        .collect()
}

fn token(issuer: &str) -> String {
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256"}"#),
        URL_SAFE_NO_PAD.encode(json!({ "iss": issuer }).to_string())
    )
}

#[tokio::test]
async fn test_approved_site_is_accepted_and_persisted() {
    let mut h = Harness::new(RecordingShell::approving(), None);

    let response = h.authenticate("server", "TeamWiki").await;
    assert_eq!(
        response,
        json!({"requestID": "auth-1", "type": "authentication-status", "payload": "ACCEPTED"})
    );
    assert!(h.dispatcher.trust().contains("TeamWiki"));
    assert_eq!(h.shell.asked(), ["TeamWiki"]);

    // Persisted, and not asked again.
    let reopened = TrustStore::open(h.config.trust_store_path()).unwrap();
    assert!(reopened.contains("TeamWiki"));
    h.authenticate("server", "TeamWiki").await;
    assert_eq!(h.shell.asked().len(), 1);
}

#[tokio::test]
async fn test_rejected_site_is_not_stored() {
    let mut h = Harness::new(RecordingShell::rejecting(), None);

    let response = h.authenticate("server", "Unknown Wiki").await;
    assert_eq!(response["payload"], "REJECTED");
    assert!(h.dispatcher.trust().sites().is_empty());
}

#[tokio::test]
async fn test_cloud_authentication_skips_prompt() {
    let mut h = Harness::new(RecordingShell::rejecting(), None);

    let response = h.authenticate("jwt", "").await;
    assert_eq!(response["payload"], "ACCEPTED");
    assert!(h.shell.asked().is_empty());

    let response = h.authenticate("kerberos", "x").await;
    assert_eq!(response["payload"], "REJECTED");
}

#[tokio::test]
async fn test_new_transaction_ids_are_distinct() {
    let mut h = Harness::new(RecordingShell::rejecting(), None);
    let request = json!({"type": "new-transaction", "requestID": "r1", "payload": {"transactionType": "file"}});

    h.send(request.clone()).await;
    h.send(request).await;
    let responses = h.drain();

    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["requestID"], "r1");
    let a = responses[0]["payload"].as_str().unwrap();
    let b = responses[1]["payload"].as_str().unwrap();
    assert_ne!(a, b);
    assert!(uuid::Uuid::parse_str(a).is_ok());
    assert_eq!(h.dispatcher.registry().len(), 2);
}

#[tokio::test]
async fn test_list_apps_offers_default_application() {
    let mut h = Harness::new(RecordingShell::rejecting(), None);
    h.send(json!({"type": "list-apps", "requestID": "r7"})).await;

    let response = h.drain().pop().unwrap();
    assert_eq!(response["requestID"], "r7");
    assert_eq!(response["payload"][0]["id"], DEFAULT_APP_ID);
    assert_eq!(response["payload"][0]["windowsStore"], false);
}

#[tokio::test]
async fn test_launch_downloads_opens_and_watches() {
    let mut server = mockito::Server::new_async().await;
    let mut h = Harness::new(RecordingShell::approving(), None);

    h.launch(&mut server, None).await;
    let messages = h.drain();

    assert_eq!(event_names(&messages), ["file-download-start", "file-downloaded"]);
    assert_eq!(messages[0]["payload"], DEFAULT_APP_ID);
    assert_eq!(messages[0]["transactionID"], "t1");
    assert_eq!(messages[1]["payload"], Value::Null);

    let path = h.cache_path("doc.docx");
    assert_eq!(fs::read(&path).unwrap(), b"original");
    assert_eq!(h.shell.opened(), [path.clone()]);

    let tx = h.dispatcher.registry().get("t1").unwrap();
    assert_eq!(tx.state, TransactionState::Watching);
    assert_eq!(tx.content_hash, Some(ContentDigest::of_bytes(b"original")));
    assert_eq!(tx.file_path.as_deref(), Some(path.as_path()));
}

#[tokio::test]
async fn test_failed_download_is_an_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/gone.docx")
        .with_status(404)
        .create_async()
        .await;
    let mut h = Harness::new(RecordingShell::approving(), None);

    let err = h
        .try_send(json!({
            "type": "launch-file-in-app",
            "transactionID": "t1",
            "payload": {"fileURL": format!("{}/gone.docx", server.url()), "fileName": "gone.docx"}
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Transfer(_)));
    assert_eq!(event_names(&h.drain()), ["file-download-start"]);
}

#[tokio::test]
async fn test_identical_save_emits_nothing() {
    let mut server = mockito::Server::new_async().await;
    let mut h = Harness::new(RecordingShell::approving(), None);
    h.launch(&mut server, None).await;
    h.drain();

    // Rewrite the same bytes in place.
    let path = h.cache_path("doc.docx");
    {
        use std::io::Write;
        let mut file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(b"original").unwrap();
        file.sync_all().unwrap();
    }

    let signal = tokio::time::timeout(Duration::from_millis(750), h.changes.recv()).await;
    assert!(signal.is_err(), "unexpected change signal");
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_edit_uploads_directly() {
    let mut server = mockito::Server::new_async().await;
    let upload = server
        .mock("POST", "/attachments/42")
        .match_header("x-atlassian-token", "nocheck")
        .match_body(mockito::Matcher::Regex("edited".into()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let mut h = Harness::new(RecordingShell::approving(), None);
    let upload_url = format!("{}/attachments/42", server.url());
    h.launch(&mut server, Some(upload_url)).await;
    h.drain();

    replace_content(&h.cache_path("doc.docx"), b"edited");
    let expected = ContentDigest::of_bytes(b"edited");
    let signal = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let signal = h.changes.recv().await.unwrap();
            if signal.digest == expected {
                return signal;
            }
        }
    })
    .await
    .expect("no change signal");
    h.dispatcher.on_change(signal, &h.out).await.unwrap();

    let messages = h.drain();
    assert_eq!(
        event_names(&messages),
        [
            "file-direct-upload-start",
            "file-direct-upload-progress",
            "file-direct-upload-end"
        ]
    );
    assert_eq!(messages[1]["payload"]["progress"]["percentage"], 100);
    assert_eq!(
        messages[0]["payload"]["directUploadId"],
        messages[2]["payload"]["directUploadId"]
    );
    upload.assert_async().await;

    let tx = h.dispatcher.registry().get("t1").unwrap();
    assert_eq!(tx.state, TransactionState::Watching);
    assert_eq!(tx.content_hash, Some(expected));
}

#[tokio::test]
async fn test_failed_direct_upload_keeps_watching() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/attachments/42")
        .with_status(500)
        .create_async()
        .await;
    let mut h = Harness::new(RecordingShell::approving(), None);
    let upload_url = format!("{}/attachments/42", server.url());
    h.launch(&mut server, Some(upload_url)).await;
    h.drain();

    h.change("t1", b"edited").await;
    let messages = h.drain();

    assert_eq!(
        event_names(&messages),
        ["file-direct-upload-start", "file-direct-upload-error"]
    );
    assert!(messages[1]["payload"]["reason"]
        .as_str()
        .unwrap()
        .contains("500"));
    assert_eq!(h.shell.notes().len(), 1);
    assert_eq!(
        h.dispatcher.registry().get("t1").unwrap().state,
        TransactionState::Watching
    );
}

#[tokio::test]
async fn test_unknown_upload_url_waits_for_browser() {
    let mut server = mockito::Server::new_async().await;
    let upload = server
        .mock("POST", "/attachments/9")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;
    let mut h = Harness::new(RecordingShell::approving(), None);
    h.launch(&mut server, None).await;
    h.drain();

    h.change("t1", b"edit one").await;
    let messages = h.drain();
    assert_eq!(event_names(&messages), ["file-change-detected"]);
    assert_eq!(messages[0]["payload"], DEFAULT_APP_ID);

    h.send(json!({
        "type": "upload-file-in-app",
        "transactionID": "t1",
        "payload": {"fileID": 9, "uploadUrl": format!("{}/attachments/9", server.url())}
    }))
    .await;
    let messages = h.drain();
    assert_eq!(event_names(&messages).last(), Some(&"file-direct-upload-end"));
    assert_eq!(messages[0]["payload"]["fileID"], 9);

    // The URL is remembered: the next edit goes straight up.
    h.change("t1", b"edit two").await;
    let messages = h.drain();
    assert_eq!(event_names(&messages)[0], "file-direct-upload-start");
    assert_eq!(messages[0]["payload"]["fileID"], 9);
    upload.assert_async().await;
}

#[tokio::test]
async fn test_upload_for_unknown_transaction_is_ignored() {
    let mut h = Harness::new(RecordingShell::approving(), None);
    h.send(json!({
        "type": "upload-file-in-app",
        "transactionID": "nope",
        "payload": {"fileID": 1, "uploadUrl": "http://127.0.0.1:9/x"}
    }))
    .await;
    h.send(json!({"type": "get-version", "requestID": "r1"})).await;
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_cloud_edit_negotiates_token_and_uploads() {
    let mut server = mockito::Server::new_async().await;
    let content = b"cloud edit";
    let chunk = companion_core::digest::chunk_id(content);
    server
        .mock("POST", "/upload?createUpTo=1")
        .match_header("x-client-id", "client-9")
        .with_status(201)
        .with_body(r#"{"data":[{"id":"up-7"}]}"#)
        .create_async()
        .await;
    server
        .mock("PUT", format!("/chunk/{chunk}").as_str())
        .with_status(201)
        .create_async()
        .await;
    server
        .mock("PUT", "/upload/up-7/chunks")
        .with_status(200)
        .create_async()
        .await;
    server
        .mock("POST", "/file/upload")
        .with_status(201)
        .with_body(r#"{"data":{"id":"att-99"}}"#)
        .create_async()
        .await;

    let mut h = Harness::new(RecordingShell::rejecting(), Some(server.url()));
    h.authenticate("jwt", "").await;
    h.launch(&mut server, None).await;
    h.drain();
    assert_eq!(
        h.dispatcher.registry().get("t1").unwrap().upload_target,
        UploadTarget::Cloud
    );

    h.change("t1", content).await;
    let messages = h.drain();
    assert_eq!(event_names(&messages), ["request-upload-token"]);
    assert_eq!(messages[0]["payload"]["fileName"], "doc.docx");

    h.send(json!({
        "type": "request-upload-token",
        "transactionID": "t1",
        "payload": {"token": token("client-9")}
    }))
    .await;
    let messages = h.drain();
    assert_eq!(
        event_names(&messages),
        ["file-upload-start", "file-upload-progress", "file-uploaded"]
    );
    assert_eq!(messages[2]["payload"]["id"], "att-99");
    assert_eq!(messages[2]["payload"]["fileName"], "doc.docx");
}

#[tokio::test]
async fn test_cloud_upload_with_bad_token_reports_error() {
    let mut server = mockito::Server::new_async().await;
    let mut h = Harness::new(RecordingShell::rejecting(), Some(server.url()));
    h.authenticate("jwt", "").await;
    h.launch(&mut server, None).await;
    h.change("t1", b"x").await;
    h.drain();

    h.send(json!({
        "type": "request-upload-token",
        "transactionID": "t1",
        "payload": {"token": "opaque"}
    }))
    .await;
    let messages = h.drain();
    assert_eq!(
        event_names(&messages),
        ["file-upload-start", "file-upload-error"]
    );
    assert_eq!(h.shell.notes().len(), 1);
}

#[tokio::test]
async fn test_end_session_closes_everything() {
    let mut server = mockito::Server::new_async().await;
    let mut h = Harness::new(RecordingShell::approving(), None);
    h.launch(&mut server, None).await;
    h.send(json!({"type": "new-transaction", "requestID": "r1", "payload": {"transactionType": "file"}}))
        .await;
    assert_eq!(h.dispatcher.registry().len(), 2);

    h.dispatcher.end_session();
    assert!(h.dispatcher.registry().is_empty());

    // Edits after the session ended are not reported.
    replace_content(&h.cache_path("doc.docx"), b"late edit");
    let signal = tokio::time::timeout(Duration::from_millis(750), h.changes.recv()).await;
    assert!(signal.is_err(), "watch survived the session");
}

#[tokio::test]
async fn test_relaunch_of_cached_name_retires_previous_transaction() {
    let mut server = mockito::Server::new_async().await;
    let stale_upload = server
        .mock("POST", "/upload-A")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;
    let mut h = Harness::new(RecordingShell::approving(), None);

    let url_a = format!("{}/upload-A", server.url());
    h.launch_as(&mut server, "tA", "version A", Some(url_a.clone()))
        .await;
    let url_b = format!("{}/upload-B", server.url());
    h.launch_as(&mut server, "tB", "version B", Some(url_b)).await;
    h.drain();

    let path = h.cache_path("doc.docx");
    assert_eq!(fs::read(&path).unwrap(), b"version B");
    let retired = h.dispatcher.registry().get("tA").unwrap();
    assert_eq!(retired.state, TransactionState::Closed);
    assert_eq!(retired.file_path, None);
    let current = h.dispatcher.registry().get("tB").unwrap();
    assert_eq!(current.file_path.as_deref(), Some(path.as_path()));

    // A signal for the old transaction queued before the relaunch.
    let signal = ChangeSignal {
        transaction_id: "tA".to_string(),
        path: path.clone(),
        digest: ContentDigest::of_bytes(b"version B"),
    };
    h.dispatcher.on_change(signal, &h.out).await.unwrap();

    h.send(json!({
        "type": "upload-file-in-app",
        "transactionID": "tA",
        "payload": {"fileID": 1, "uploadUrl": url_a}
    }))
    .await;

    assert!(h.drain().is_empty());
    stale_upload.assert_async().await;
}
