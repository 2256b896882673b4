//! Small capability traits for the subsystems this crate treats as external
//! collaborators (§6): the block store, the directory-manifest codec, and
//! filename encryption. None of these are implemented here — the crate only
//! depends on their contracts, mirroring how the rest of this codebase wraps
//! out-of-process concerns (its own HTTP API client, its control-plane
//! state) behind a narrow struct/trait boundary instead of a wide base type.

use std::io::Read;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// Content-addressed blob storage. CIDs are opaque strings ≤256 bytes.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn put(&self, reader: &mut (dyn Read + Send)) -> EngineResult<String>;
    async fn get(&self, cid: &str) -> EngineResult<Box<dyn Read + Send>>;
    async fn has(&self, cid: &str) -> EngineResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub encrypted_name: Vec<u8>,
    pub cid: String,
    pub entry_type: EntryType,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryManifest {
    pub entries: Vec<DirectoryEntry>,
    pub modified: Option<DateTime<Utc>>,
}

impl DirectoryManifest {
    pub fn add_entry(&mut self, entry: DirectoryEntry) {
        self.entries.push(entry);
        self.modified = Some(Utc::now());
    }

    /// Replace the entry matching `encrypted_name` exactly. Fails (returns
    /// `false`) if no such entry exists, matching §4.I's "fails if the
    /// expected entry is missing during update" rule.
    pub fn update_entry(&mut self, encrypted_name: &[u8], new: DirectoryEntry) -> bool {
        if let Some(slot) = self.entries.iter_mut().find(|e| e.encrypted_name == encrypted_name) {
            *slot = new;
            self.modified = Some(Utc::now());
            true
        } else {
            false
        }
    }

    pub fn remove_entry(&mut self, encrypted_name: &[u8]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.encrypted_name != encrypted_name);
        let removed = self.entries.len() != before;
        if removed {
            self.modified = Some(Utc::now());
        }
        removed
    }
}

/// Opaque request context threaded through to the directory-manager
/// collaborator (timeouts, cancellation, tracing correlation — left to the
/// embedder).
#[derive(Debug, Clone, Default)]
pub struct RequestContext;

#[async_trait]
pub trait DirectoryManager: Send + Sync {
    async fn retrieve_manifest(
        &self,
        ctx: &RequestContext,
        path: &str,
        cid: &str,
    ) -> EngineResult<DirectoryManifest>;

    async fn store_manifest(
        &self,
        ctx: &RequestContext,
        path: &str,
        manifest: &DirectoryManifest,
    ) -> EngineResult<String>;
}

#[derive(Debug, Clone)]
pub struct DirKey(pub Vec<u8>);

pub trait Crypto: Send + Sync {
    fn derive_directory_key(&self, master_key: &[u8], directory_path: &str) -> DirKey;
    fn encrypt_filename(&self, name: &str, key: &DirKey) -> Vec<u8>;
    fn decrypt_filename(&self, bytes: &[u8], key: &DirKey) -> EngineResult<String>;
}
