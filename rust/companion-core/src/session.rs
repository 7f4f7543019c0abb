//! WebSocket transport between the browser and the dispatcher.
//!
//! One session is served at a time. Each text frame carries one JSON
//! message. Outbound messages go through an unbounded outbox drained by a
//! writer task, so events emitted in the middle of a long operation reach
//! the browser before the operation finishes.
//!
//! With a certificate and key configured, every accepted connection goes
//! through a rustls handshake before the WebSocket upgrade.

use crate::config::TlsConfig;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::watcher::ChangeSignal;
use futures_util::{SinkExt, StreamExt};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::{self, Message};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session: io error - {0}")]
    Io(#[from] std::io::Error),

    #[error("session: websocket error - {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("session: malformed message - {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("session: tls setup failed - {0}")]
    Tls(String),

    #[error("session: binary frame is not utf-8")]
    Encoding,

    #[error("session: {0}")]
    Dispatch(#[from] DispatchError),
}

enum SessionEnd {
    Closed,
    Shutdown,
}

/// Builds a TLS acceptor from the configured PEM files, or `None` when
/// neither path is set.
pub fn load_tls_acceptor(tls: &TlsConfig) -> Result<Option<TlsAcceptor>, SessionError> {
    let (cert_path, key_path) = match (&tls.cert_path, &tls.key_path) {
        (None, None) => return Ok(None),
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            return Err(SessionError::Tls(
                "tls.cert_path and tls.key_path must be set together".into(),
            ))
        }
    };

    let cert_buf = fs::read(cert_path)?;
    let key_buf = fs::read(key_path)?;
    let chain: Vec<rustls::Certificate> = certs(&mut &cert_buf[..])?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if chain.is_empty() {
        return Err(SessionError::Tls(format!(
            "no certificate in {}",
            cert_path.display()
        )));
    }
    let mut keys = pkcs8_private_keys(&mut &key_buf[..])?;
    if keys.is_empty() {
        return Err(SessionError::Tls(format!(
            "no PKCS#8 private key in {}",
            key_path.display()
        )));
    }
    let key = rustls::PrivateKey(keys.remove(0));

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| SessionError::Tls(e.to_string()))?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

pub struct SessionServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl SessionServer {
    /// Binds a plain `ws://` listener.
    pub async fn bind(addr: &str) -> Result<Self, SessionError> {
        Self::bind_with_tls(addr, &TlsConfig::default()).await
    }

    /// Binds a listener that serves `wss://` when `tls` names a certificate.
    pub async fn bind_with_tls(addr: &str, tls: &TlsConfig) -> Result<Self, SessionError> {
        let tls = load_tls_acceptor(tls)?;
        let listener = TcpListener::bind(addr).await?;
        let server = Self { listener, tls };
        log::info!(
            "companion listening on {}://{}",
            server.scheme(),
            server.local_addr()?
        );
        Ok(server)
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "wss"
        } else {
            "ws"
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves sessions one after another until `shutdown` completes.
    ///
    /// A session that fails (transport error, malformed message, failed
    /// download) is torn down with all of its transactions; the listener
    /// then accepts the next connection.
    pub async fn run<F>(
        &self,
        dispatcher: &mut Dispatcher,
        changes: &mut mpsc::Receiver<ChangeSignal>,
        shutdown: F,
    ) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let stream = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::info!("session opened from {peer}");
                        stream
                    }
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        continue;
                    }
                },
                _ = shutdown.as_mut() => {
                    log::info!("shutdown requested");
                    return Ok(());
                }
            };

            // Signals queued after the previous session ended refer to nothing.
            while changes.try_recv().is_ok() {}

            let result = match &self.tls {
                None => run_session(stream, dispatcher, changes, shutdown.as_mut()).await,
                Some(acceptor) => {
                    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await
                    {
                        Ok(Ok(stream)) => {
                            run_session(stream, dispatcher, changes, shutdown.as_mut()).await
                        }
                        Ok(Err(e)) => {
                            log::warn!("tls handshake failed: {e}");
                            continue;
                        }
                        Err(_) => {
                            log::warn!("tls handshake timed out");
                            continue;
                        }
                    }
                }
            };
            dispatcher.end_session();

            match result {
                Ok(SessionEnd::Closed) => log::info!("session closed"),
                Ok(SessionEnd::Shutdown) => {
                    log::info!("shutdown requested");
                    return Ok(());
                }
                Err(e) => log::error!("session terminated: {e}"),
            }
        }
    }
}

async fn run_session<S, F>(
    stream: S,
    dispatcher: &mut Dispatcher,
    changes: &mut mpsc::Receiver<ChangeSignal>,
    mut shutdown: Pin<&mut F>,
) -> Result<SessionEnd, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    log::error!("cannot encode outbound message: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let result = loop {
        tokio::select! {
            frame = source.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => break Err(SessionError::Encoding),
                    },
                    Some(Ok(Message::Close(_))) | None => break Ok(SessionEnd::Closed),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Err(e.into()),
                };

                log::debug!("< {text}");
                let message = match InboundMessage::parse(&text) {
                    Ok(message) => message,
                    Err(e) => break Err(e.into()),
                };
                if let Err(e) = dispatcher.handle(message, &out_tx).await {
                    break Err(e.into());
                }
            }
            Some(signal) = changes.recv() => {
                if let Err(e) = dispatcher.on_change(signal, &out_tx).await {
                    break Err(e.into());
                }
            }
            _ = shutdown.as_mut() => break Ok(SessionEnd::Shutdown),
        }
    };

    drop(out_tx);
    if let Err(e) = writer.await {
        log::debug!("writer task ended abnormally: {e}");
    }
    result
}
