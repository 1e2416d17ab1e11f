// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::ids::{BundleId, PayloadHash};
use crate::manifest::BundleManifest;

/// The bundle database as seen by the fetch engine: two read-only queries
/// plus the import handoff for completed fetches.
///
/// Calls run on the engine's critical path and must be cheap; both provided
/// implementations are synchronous (short indexed lookups).
pub trait BundleStore: Send + Sync {
    /// Highest stored version for a bundle id, if any.
    fn stored_version(&self, bid: &BundleId) -> anyhow::Result<Option<u64>>;

    /// Whether a valid payload blob with this content address is already
    /// in the store.
    fn payload_present(&self, hash: &PayloadHash) -> anyhow::Result<bool>;

    /// Take ownership of a fetched bundle.  `payload` points at the scratch
    /// file for non-nil payloads; the store owns the file from here on.
    fn import(&self, manifest: BundleManifest, payload: Option<&Path>) -> anyhow::Result<()>;
}

/// SQLite-backed bundle index.
pub struct SqliteBundleStore {
    path: PathBuf,
}

impl SqliteBundleStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(Self {
            path: path.as_ref().to_path_buf(),
        });
        store.ensure_schema()?;
        Ok(store)
    }

    fn open_connection(&self) -> anyhow::Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        let conn = self.open_connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS manifests (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                manifest BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                length INTEGER NOT NULL,
                datavalid INTEGER NOT NULL DEFAULT 0,
                data BLOB
            );",
        )?;
        Ok(())
    }
}

impl BundleStore for SqliteBundleStore {
    fn stored_version(&self, bid: &BundleId) -> anyhow::Result<Option<u64>> {
        let conn = self.open_connection()?;
        let version = conn
            .query_row(
                "SELECT version FROM manifests WHERE id = ?1",
                params![bid.to_hex()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    fn payload_present(&self, hash: &PayloadHash) -> anyhow::Result<bool> {
        let conn = self.open_connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE id = ?1 AND datavalid = 1",
            params![hash.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn import(&self, manifest: BundleManifest, payload: Option<&Path>) -> anyhow::Result<()> {
        let conn = self.open_connection()?;
        if let (Some(hash), Some(path)) = (manifest.payload_hash, payload) {
            let data = std::fs::read(path)?;
            conn.execute(
                "INSERT INTO files(id, length, datavalid, data) VALUES(?1, ?2, 1, ?3)
                 ON CONFLICT(id) DO UPDATE SET datavalid = 1, data = excluded.data,
                 length = excluded.length",
                params![hash.to_hex(), data.len() as i64, data],
            )?;
        }
        let encoded = manifest.to_bytes()?;
        conn.execute(
            "INSERT INTO manifests(id, version, manifest) VALUES(?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version,
             manifest = excluded.manifest",
            params![manifest.bid.to_hex(), manifest.version as i64, encoded],
        )?;
        Ok(())
    }
}

/// A bundle fetched to completion and handed to a [`MemoryBundleStore`].
#[derive(Debug, Clone)]
pub struct ImportedBundle {
    pub manifest: BundleManifest,
    pub payload: Option<Vec<u8>>,
}

/// In-memory store; backs the unit and scenario tests and records every
/// import for assertions.
#[derive(Default)]
pub struct MemoryBundleStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    versions: HashMap<BundleId, u64>,
    payloads: HashSet<PayloadHash>,
    imports: Vec<ImportedBundle>,
}

impl MemoryBundleStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed_version(&self, bid: BundleId, version: u64) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.versions.insert(bid, version);
    }

    pub fn seed_payload(&self, hash: PayloadHash) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.payloads.insert(hash);
    }

    pub fn imports(&self) -> Vec<ImportedBundle> {
        self.inner.lock().expect("store lock poisoned").imports.clone()
    }
}

impl BundleStore for MemoryBundleStore {
    fn stored_version(&self, bid: &BundleId) -> anyhow::Result<Option<u64>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.versions.get(bid).copied())
    }

    fn payload_present(&self, hash: &PayloadHash) -> anyhow::Result<bool> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.payloads.contains(hash))
    }

    fn import(&self, manifest: BundleManifest, payload: Option<&Path>) -> anyhow::Result<()> {
        let payload = payload.map(std::fs::read).transpose()?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let stored = inner.versions.entry(manifest.bid).or_insert(0);
        *stored = (*stored).max(manifest.version);
        if let Some(hash) = manifest.payload_hash {
            inner.payloads.insert(hash);
        }
        inner.imports.push(ImportedBundle { manifest, payload });
        Ok(())
    }
}
