//! Per-file edit transactions and the registry that owns them.

use crate::digest::ContentDigest;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Lifecycle of one download-edit-upload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    New,
    Downloading,
    Watching,
    ChangeDetected,
    Uploading,
    Closed,
}

/// Where edits of a transaction are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    /// Self-hosted site. The URL may only become known with the first
    /// `upload-file-in-app` request.
    Direct(Option<String>),
    /// Cloud site; a token is negotiated for every upload cycle.
    Cloud,
}

#[derive(Debug, Clone)]
pub struct TransactionDescriptor {
    pub id: String,
    pub application_id: Option<String>,
    pub file_name: Option<String>,
    pub file_path: Option<PathBuf>,
    pub source_url: Option<String>,
    pub upload_target: UploadTarget,
    /// Site-side file id echoed in direct upload events.
    pub remote_file_id: Option<serde_json::Value>,
    pub content_hash: Option<ContentDigest>,
    pub state: TransactionState,
}

impl TransactionDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            application_id: None,
            file_name: None,
            file_path: None,
            source_url: None,
            upload_target: UploadTarget::Direct(None),
            remote_file_id: None,
            content_hash: None,
            state: TransactionState::New,
        }
    }
}

/// In-memory map of transaction id to descriptor. At most one descriptor per id.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    transactions: HashMap<String, TransactionDescriptor>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh id and registers an empty descriptor under it.
    pub fn create(&mut self) -> String {
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if !self.transactions.contains_key(&id) {
                self.transactions
                    .insert(id.clone(), TransactionDescriptor::new(id.clone()));
                return id;
            }
        }
    }

    /// Returns the descriptor for `id`, registering an empty one if unknown.
    pub fn get_or_insert(&mut self, id: &str) -> &mut TransactionDescriptor {
        self.transactions
            .entry(id.to_string())
            .or_insert_with(|| TransactionDescriptor::new(id))
    }

    pub fn get(&self, id: &str) -> Option<&TransactionDescriptor> {
        self.transactions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TransactionDescriptor> {
        self.transactions.get_mut(id)
    }

    pub fn set_state(&mut self, id: &str, state: TransactionState) {
        if let Some(tx) = self.transactions.get_mut(id) {
            log::debug!("transaction {id}: {:?} -> {:?}", tx.state, state);
            tx.state = state;
        }
    }

    /// Closes every transaction other than `owner` that holds `path`, so a
    /// relaunch of the same cached name leaves a single live owner.
    pub fn release_path(&mut self, path: &Path, owner: &str) -> Vec<String> {
        let mut released = Vec::new();
        for tx in self.transactions.values_mut() {
            if tx.id != owner && tx.file_path.as_deref() == Some(path) {
                tx.file_path = None;
                tx.state = TransactionState::Closed;
                released.push(tx.id.clone());
            }
        }
        released
    }

    /// Removes every transaction, returning them marked `Closed`.
    pub fn close_all(&mut self) -> Vec<TransactionDescriptor> {
        self.transactions
            .drain()
            .map(|(_, mut tx)| {
                tx.state = TransactionState::Closed;
                tx
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
