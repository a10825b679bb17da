//! Archival memory: a category-partitioned vector store with deduplication
//! and cross-category search, plus the cognitive-map index over categories.
//!
//! # Storage
//! A single SQLite database under `<state>/memory/` holds every record;
//! embeddings are stored as little-endian `f32` BLOBs.  A
//! [`rusqlite::Connection`] wrapped in `Arc<Mutex<…>>` keeps the store
//! `Send + Sync` while satisfying SQLite's single-writer requirement — the
//! exclusive lock also serialises category writes.
//!
//! # Dedup
//! Within a category, an identical `content_hash` makes `memorize` a silent
//! no-op reported as `{stored: false, duplicate: true}`.

use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::embeddings::{EmbeddingProvider, cosine_distance};

/// Records closer than this cosine distance are "the same content" for
/// deletion purposes.
pub const FORGET_DISTANCE: f32 = 0.15;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY NOT NULL,
    category TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    embedding BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_category ON memories (category);
CREATE INDEX IF NOT EXISTS idx_memories_hash ON memories (category, content_hash);
"#;

// ─── Public types ─────────────────────────────────────────────────────────────

/// Result of a semantic search, ascending by distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub category: String,
    pub content: String,
    pub distance: f32,
}

/// Outcome of a `memorize` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorizeOutcome {
    pub stored: bool,
    pub duplicate: bool,
}

/// One row of the cognitive map: metadata about a live category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CognitiveMapEntry {
    pub category: String,
    pub description: String,
    pub memory_count: usize,
    pub last_updated: String,
}

/// Normalise a raw category name: lowercase, non-alphanumerics become `_`,
/// empty input becomes `general`.  Idempotent.
pub fn normalise_category(raw: &str) -> String {
    let normalised: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    if normalised.is_empty() {
        "general".to_owned()
    } else {
        normalised
    }
}

fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ─── ArchivalMemory ───────────────────────────────────────────────────────────

/// Category-partitioned vector store with a persisted cognitive map.
pub struct ArchivalMemory {
    conn: Arc<Mutex<Connection>>,
    embedder: Arc<dyn EmbeddingProvider>,
    map_path: Option<PathBuf>,
    map: Mutex<BTreeMap<String, CognitiveMapEntry>>,
}

impl ArchivalMemory {
    /// Open (or create) the store at `db_path`, loading the cognitive map
    /// from `map_path` when it exists.
    pub fn open(
        db_path: impl Into<PathBuf>,
        map_path: impl Into<PathBuf>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, String> {
        let db_path = db_path.into();
        let conn =
            Connection::open(&db_path).map_err(|e| format!("sqlite open {db_path:?}: {e}"))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(|e| format!("sqlite pragma: {e}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("sqlite schema: {e}"))?;

        let map_path = map_path.into();
        let map = match fs::read_to_string(&map_path) {
            Ok(json) => serde_json::from_str::<Vec<CognitiveMapEntry>>(&json)
                .map_err(|e| format!("cognitive map parse: {e}"))?
                .into_iter()
                .map(|e| (e.category.clone(), e))
                .collect(),
            Err(_) => BTreeMap::new(),
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
            map_path: Some(map_path),
            map: Mutex::new(map),
        })
    }

    /// In-process store with no cognitive-map file — used by tests.
    pub fn in_memory(embedder: Arc<dyn EmbeddingProvider>) -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("sqlite schema: {e}"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
            map_path: None,
            map: Mutex::new(BTreeMap::new()),
        })
    }

    // ── memorize ─────────────────────────────────────────────────────────

    /// Store `content` under `raw_category`.  A record with the same content
    /// hash already present in the category makes this a no-op.
    pub async fn memorize(
        &self,
        raw_category: &str,
        content: &str,
    ) -> Result<MemorizeOutcome, String> {
        let category = normalise_category(raw_category);
        let hash = content_hash(content);
        let vector = self.embedder.embed(content).await?;

        {
            let conn = self.lock_conn();
            let existing: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM memories WHERE category = ?1 AND content_hash = ?2",
                    params![category, hash],
                    |row| row.get(0),
                )
                .map_err(|e| format!("dedup query: {e}"))?;
            if existing > 0 {
                return Ok(MemorizeOutcome {
                    stored: false,
                    duplicate: true,
                });
            }

            conn.execute(
                "INSERT INTO memories (id, category, content, content_hash, created_at, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    category,
                    content,
                    hash,
                    Utc::now().to_rfc3339(),
                    encode_embedding(&vector),
                ],
            )
            .map_err(|e| format!("insert: {e}"))?;
        }

        self.bump_map_entry(&category, content)?;
        Ok(MemorizeOutcome {
            stored: true,
            duplicate: false,
        })
    }

    // ── search ───────────────────────────────────────────────────────────

    /// Up to `k` nearest records in one category; `[]` when the category has
    /// no records.
    pub async fn search_memory(
        &self,
        raw_category: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryHit>, String> {
        let category = normalise_category(raw_category);
        let query_vec = self.embedder.embed(query).await?;
        let mut hits = self.scan_category(Some(&category), &query_vec)?;
        hits.truncate(k);
        Ok(hits)
    }

    /// Fan out across every category, merge by ascending distance, return
    /// the global top-`k` with category labels.
    pub async fn search_all_categories(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryHit>, String> {
        let query_vec = self.embedder.embed(query).await?;
        let mut hits = self.scan_category(None, &query_vec)?;
        hits.truncate(k);
        Ok(hits)
    }

    // ── forget ───────────────────────────────────────────────────────────

    /// Remove every record in `raw_category` within [`FORGET_DISTANCE`] of
    /// `content_match`.  Returns the number removed; an emptied category is
    /// dropped from the cognitive map.
    pub async fn forget_memory(
        &self,
        raw_category: &str,
        content_match: &str,
    ) -> Result<usize, String> {
        let category = normalise_category(raw_category);
        let match_vec = self.embedder.embed(content_match).await?;

        let (removed, remaining) = {
            let conn = self.lock_conn();
            let mut stmt = conn
                .prepare("SELECT id, embedding FROM memories WHERE category = ?1")
                .map_err(|e| format!("select: {e}"))?;
            let rows = stmt
                .query_map(params![category], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })
                .map_err(|e| format!("query: {e}"))?;

            let mut doomed = Vec::new();
            for row in rows {
                let (id, blob) = row.map_err(|e| format!("row: {e}"))?;
                if cosine_distance(&match_vec, &decode_embedding(&blob)) < FORGET_DISTANCE {
                    doomed.push(id);
                }
            }
            drop(stmt);

            for id in &doomed {
                conn.execute("DELETE FROM memories WHERE id = ?1", params![id])
                    .map_err(|e| format!("delete: {e}"))?;
            }

            let remaining: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM memories WHERE category = ?1",
                    params![category],
                    |row| row.get(0),
                )
                .map_err(|e| format!("count: {e}"))?;
            (doomed.len(), remaining)
        };

        if removed > 0 {
            if remaining == 0 {
                self.drop_map_entry(&category)?;
            } else {
                self.set_map_count(&category, remaining as usize)?;
            }
        }
        Ok(removed)
    }

    // ── cognitive map ────────────────────────────────────────────────────

    /// Snapshot of the cognitive map, sorted by category.
    pub fn cognitive_map(&self) -> Vec<CognitiveMapEntry> {
        self.map
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of records currently held in `raw_category`.
    pub fn category_count(&self, raw_category: &str) -> usize {
        let category = normalise_category(raw_category);
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE category = ?1",
            params![category],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .unwrap_or(0)
    }

    // ── internal ─────────────────────────────────────────────────────────

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Load rows (optionally restricted to a category) and sort by distance.
    fn scan_category(
        &self,
        category: Option<&str>,
        query_vec: &[f32],
    ) -> Result<Vec<MemoryHit>, String> {
        let conn = self.lock_conn();
        let mut hits: Vec<MemoryHit> = Vec::new();

        let mut collect = |stmt: &mut rusqlite::Statement<'_>,
                           bind: &[&dyn rusqlite::ToSql]|
         -> Result<(), String> {
            let rows = stmt
                .query_map(bind, |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })
                .map_err(|e| format!("query: {e}"))?;
            for row in rows {
                let (cat, content, blob) = row.map_err(|e| format!("row: {e}"))?;
                hits.push(MemoryHit {
                    category: cat,
                    content,
                    distance: cosine_distance(query_vec, &decode_embedding(&blob)),
                });
            }
            Ok(())
        };

        match category {
            Some(cat) => {
                let mut stmt = conn
                    .prepare("SELECT category, content, embedding FROM memories WHERE category = ?1")
                    .map_err(|e| format!("prepare: {e}"))?;
                collect(&mut stmt, &[&cat])?;
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT category, content, embedding FROM memories")
                    .map_err(|e| format!("prepare: {e}"))?;
                collect(&mut stmt, &[])?;
            }
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(hits)
    }

    fn bump_map_entry(&self, category: &str, latest_content: &str) -> Result<(), String> {
        {
            let mut map = match self.map.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = map
                .entry(category.to_owned())
                .or_insert_with(|| CognitiveMapEntry {
                    category: category.to_owned(),
                    description: snippet(latest_content),
                    memory_count: 0,
                    last_updated: String::new(),
                });
            entry.memory_count += 1;
            entry.last_updated = Utc::now().to_rfc3339();
        }
        self.persist_map()
    }

    fn set_map_count(&self, category: &str, count: usize) -> Result<(), String> {
        {
            let mut map = match self.map.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(entry) = map.get_mut(category) {
                entry.memory_count = count;
                entry.last_updated = Utc::now().to_rfc3339();
            }
        }
        self.persist_map()
    }

    fn drop_map_entry(&self, category: &str) -> Result<(), String> {
        {
            let mut map = match self.map.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.remove(category);
        }
        self.persist_map()
    }

    fn persist_map(&self) -> Result<(), String> {
        let Some(path) = &self.map_path else {
            return Ok(());
        };
        let entries = self.cognitive_map();
        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| format!("cognitive map serialise: {e}"))?;
        fs::write(path, json).map_err(|e| format!("cognitive map write: {e}"))
    }
}

/// First line of `content`, capped at 80 chars, for cognitive-map descriptions.
fn snippet(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or("");
    first_line.chars().take(80).collect()
}
