//! Desktop companion engine.
//!
//! A browser-based collaboration platform connects over a local WebSocket
//! and asks this process to download a document, open it in a native
//! editor, watch it, and send every real edit back to the site. Self-hosted
//! sites receive a multipart POST; cloud sites a four-step chunked upload.

pub mod config;
pub mod desktop;
pub mod digest;
pub mod dispatcher;
pub mod http;
pub mod oneshot;
pub mod protocol;
pub mod session;
pub mod transaction;
pub mod trust;
pub mod upload;
pub mod watcher;

pub use config::{CompanionConfig, TlsConfig};
pub use desktop::{ConsoleShell, DesktopShell};
pub use digest::ContentDigest;
pub use dispatcher::{DispatchError, Dispatcher, Outbox};
pub use oneshot::{OneShot, OneShotError, OneShotSummary};
pub use protocol::{EventName, InboundMessage, OutboundMessage};
pub use session::{SessionError, SessionServer};
pub use transaction::{TransactionRegistry, TransactionState, UploadTarget};
pub use trust::{TrustError, TrustStore};
pub use watcher::{ChangeSignal, FileChangeWatcher, WatchError};
