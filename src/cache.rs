//! SQLite-backed embedding cache.
//!
//! Entries live under a namespace (backend fingerprint, task, batching
//! parameters) and a key (document id or sanitized query id plus unit slot).
//! Every entry carries the hash of the text it was computed from and its
//! vector length; a changed text or a different vector length reads as a
//! miss. A miss only ever costs a recomputation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, info};

use crate::backend::{Embedder, decode_embedding_blob, embed_checked, encode_embedding_blob};
use crate::util::{now_utc_string, sanitize_cache_key, sha256_text};

pub struct EmbeddingCache {
    connection: Mutex<Connection>,
    reads_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub text_hash: String,
    pub embedding: Vec<f32>,
}

impl EmbeddingCache {
    pub fn open(db_path: &Path, reads_enabled: bool) -> Result<Self> {
        let connection = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open embedding cache: {}", db_path.display()))?;

        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to set journal_mode=WAL for embedding cache")?;
        connection
            .pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous=NORMAL for embedding cache")?;

        Self::with_connection(connection, reads_enabled)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory embedding cache")?;
        Self::with_connection(connection, true)
    }

    fn with_connection(connection: Connection, reads_enabled: bool) -> Result<Self> {
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS embedding_cache (
                  namespace TEXT NOT NULL,
                  entry_key TEXT NOT NULL,
                  embedding BLOB NOT NULL,
                  embedding_dim INTEGER NOT NULL,
                  text_hash TEXT NOT NULL,
                  generated_at TEXT NOT NULL,
                  PRIMARY KEY (namespace, entry_key)
                );
                ",
            )
            .context("failed to create embedding cache schema")?;

        Ok(Self {
            connection: Mutex::new(connection),
            reads_enabled,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| anyhow!("embedding cache connection lock poisoned"))
    }

    /// Returns the cached vector only when it was computed from the same text
    /// and has `expected_dim` components.
    pub fn load(
        &self,
        namespace: &str,
        key: &str,
        text_hash: &str,
        expected_dim: usize,
    ) -> Result<Option<Vec<f32>>> {
        if !self.reads_enabled {
            return Ok(None);
        }

        let connection = self.lock()?;
        let row = connection
            .query_row(
                "
                SELECT embedding, embedding_dim, text_hash
                FROM embedding_cache
                WHERE namespace = ?1 AND entry_key = ?2
                LIMIT 1
                ",
                params![namespace, key],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to read embedding cache entry {namespace}/{key}"))?;

        let Some((blob, embedding_dim, stored_hash)) = row else {
            return Ok(None);
        };
        if stored_hash != text_hash {
            debug!(namespace, key, "stale embedding cache entry");
            return Ok(None);
        }
        if usize::try_from(embedding_dim).ok() != Some(expected_dim) {
            debug!(
                namespace,
                key,
                embedding_dim,
                expected_dim,
                "embedding cache entry from another vector space"
            );
            return Ok(None);
        }
        Ok(decode_embedding_blob(&blob, expected_dim))
    }

    pub fn store_batch(&self, namespace: &str, pending: &mut Vec<CacheEntry>) -> Result<usize> {
        if pending.is_empty() {
            return Ok(0);
        }

        let mut connection = self.lock()?;
        let tx = connection
            .transaction()
            .context("failed to begin embedding cache transaction")?;
        let generated_at = now_utc_string();
        let mut stored = 0usize;
        for entry in pending.drain(..) {
            tx.execute(
                "
                INSERT INTO embedding_cache(
                  namespace, entry_key, embedding, embedding_dim, text_hash, generated_at
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(namespace, entry_key) DO UPDATE SET
                  embedding=excluded.embedding,
                  embedding_dim=excluded.embedding_dim,
                  text_hash=excluded.text_hash,
                  generated_at=excluded.generated_at
                ",
                params![
                    namespace,
                    entry.key,
                    encode_embedding_blob(&entry.embedding),
                    entry.embedding.len() as i64,
                    entry.text_hash,
                    generated_at,
                ],
            )
            .with_context(|| {
                format!("failed to write embedding cache entry {namespace}/{}", entry.key)
            })?;
            stored += 1;
        }
        tx.commit()
            .context("failed to commit embedding cache transaction")?;

        Ok(stored)
    }
}

/// `fingerprint` comes from [`Embedder::fingerprint`] so vectors of different
/// dimensions never share a namespace.
pub fn document_namespace(
    fingerprint: &str,
    task: &str,
    long_context: bool,
    batch_size: usize,
) -> String {
    format!("doc_emb/{fingerprint}/{task}/long_{long_context}_{batch_size}")
}

pub fn unit_namespace(
    fingerprint: &str,
    task: &str,
    long_context: bool,
    batch_size: usize,
) -> String {
    format!("unit_emb/{fingerprint}/{task}/long_{long_context}_{batch_size}")
}

/// Buffers freshly computed embeddings and writes them every `flush_every`
/// items; `finish` writes whatever is left.
pub struct EmbeddingAccumulator<'a> {
    cache: &'a EmbeddingCache,
    namespace: String,
    flush_every: usize,
    pending: Vec<CacheEntry>,
    flushed: usize,
}

impl<'a> EmbeddingAccumulator<'a> {
    pub fn new(
        cache: &'a EmbeddingCache,
        namespace: impl Into<String>,
        flush_every: usize,
    ) -> Self {
        Self {
            cache,
            namespace: namespace.into(),
            flush_every: flush_every.max(1),
            pending: Vec::new(),
            flushed: 0,
        }
    }

    pub fn push(&mut self, entry: CacheEntry) -> Result<()> {
        self.pending.push(entry);
        if self.pending.len() >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<usize> {
        let stored = self.cache.store_batch(&self.namespace, &mut self.pending)?;
        if stored > 0 {
            self.flushed += stored;
            info!(
                namespace = %self.namespace,
                stored,
                flushed_total = self.flushed,
                "embedding cache batch committed"
            );
        }
        Ok(stored)
    }

    pub fn finish(mut self) -> Result<usize> {
        self.flush()?;
        Ok(self.flushed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DocumentEmbeddingPlan<'a> {
    pub namespace: &'a str,
    pub batch_size: usize,
    pub flush_every: usize,
}

/// Document embeddings in document order, reusing cached vectors and
/// embedding only the missing ones in `batch_size` slices.
pub fn load_or_embed_documents(
    embedder: &dyn Embedder,
    documents: &[String],
    doc_ids: &[String],
    cache: &EmbeddingCache,
    plan: DocumentEmbeddingPlan<'_>,
) -> Result<Vec<Vec<f32>>> {
    let hashes = documents
        .iter()
        .map(|document| sha256_text(document))
        .collect::<Vec<String>>();

    let mut embeddings = vec![Vec::<f32>::new(); documents.len()];
    let mut missing = Vec::<usize>::new();
    for (index, (doc_id, text_hash)) in doc_ids.iter().zip(hashes.iter()).enumerate() {
        match cache.load(plan.namespace, doc_id, text_hash, embedder.dimensions())? {
            Some(vector) => embeddings[index] = vector,
            None => missing.push(index),
        }
    }

    info!(
        namespace = plan.namespace,
        documents = documents.len(),
        cached = documents.len() - missing.len(),
        missing = missing.len(),
        "document embeddings resolved against cache"
    );

    let mut accumulator = EmbeddingAccumulator::new(cache, plan.namespace, plan.flush_every);
    for batch in missing.chunks(plan.batch_size.max(1)) {
        let texts = batch
            .iter()
            .map(|index| documents[*index].clone())
            .collect::<Vec<String>>();
        let vectors = embed_checked(embedder, &texts)?;
        for (index, vector) in batch.iter().zip(vectors) {
            accumulator.push(CacheEntry {
                key: doc_ids[*index].clone(),
                text_hash: hashes[*index].clone(),
                embedding: vector.clone(),
            })?;
            embeddings[*index] = vector;
        }
    }
    accumulator.finish()?;

    Ok(embeddings)
}

/// Per-query unit embeddings keyed by sanitized query id, role and unit slot.
pub struct UnitEmbeddingCache<'a> {
    cache: &'a EmbeddingCache,
    namespace: String,
}

impl<'a> UnitEmbeddingCache<'a> {
    pub fn new(cache: &'a EmbeddingCache, namespace: impl Into<String>) -> Self {
        Self {
            cache,
            namespace: namespace.into(),
        }
    }

    pub fn embed(
        &self,
        embedder: &dyn Embedder,
        query_id: &str,
        role: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let safe_query_id = sanitize_cache_key(query_id);
        let keys = (0..texts.len())
            .map(|index| format!("{safe_query_id}/{role}/{}", index + 1))
            .collect::<Vec<String>>();
        let hashes = texts
            .iter()
            .map(|text| sha256_text(text))
            .collect::<Vec<String>>();

        let mut cached = Vec::<Vec<f32>>::with_capacity(texts.len());
        for (key, text_hash) in keys.iter().zip(hashes.iter()) {
            match self.cache.load(&self.namespace, key, text_hash, embedder.dimensions())? {
                Some(vector) => cached.push(vector),
                None => break,
            }
        }
        if cached.len() == texts.len() {
            return Ok(cached);
        }

        let vectors = embed_checked(embedder, texts)?;
        let mut pending = keys
            .into_iter()
            .zip(hashes)
            .zip(vectors.iter())
            .map(|((key, text_hash), vector)| CacheEntry {
                key,
                text_hash,
                embedding: vector.clone(),
            })
            .collect::<Vec<CacheEntry>>();
        self.cache.store_batch(&self.namespace, &mut pending)?;
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::backend::HashEmbedder;

    struct CountingEmbedder {
        inner: HashEmbedder,
        embedded_texts: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new() -> Self {
            Self {
                inner: HashEmbedder::new(32).expect("embedder"),
                embedded_texts: AtomicUsize::new(0),
            }
        }

        fn embedded(&self) -> usize {
            self.embedded_texts.load(Ordering::SeqCst)
        }
    }

    impl Embedder for CountingEmbedder {
        fn backend_id(&self) -> &str {
            "counting"
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.embedded_texts.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed(texts)
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn plan(namespace: &str, batch_size: usize) -> DocumentEmbeddingPlan<'_> {
        DocumentEmbeddingPlan {
            namespace,
            batch_size,
            flush_every: 2,
        }
    }

    #[test]
    fn cached_document_embeddings_are_reused() {
        let cache = EmbeddingCache::open_in_memory().expect("cache");
        let embedder = CountingEmbedder::new();
        let documents = strings(&["alpha beta", "gamma delta", "epsilon"]);
        let doc_ids = strings(&["d1", "d2", "d3"]);

        let first = load_or_embed_documents(&embedder, &documents, &doc_ids, &cache, plan("ns", 2))
            .expect("first pass");
        assert_eq!(embedder.embedded(), 3);

        let second = load_or_embed_documents(&embedder, &documents, &doc_ids, &cache, plan("ns", 2))
            .expect("second pass");
        assert_eq!(embedder.embedded(), 3, "second pass should hit the cache");
        assert_eq!(first, second);
    }

    #[test]
    fn changed_document_text_is_recomputed() {
        let cache = EmbeddingCache::open_in_memory().expect("cache");
        let embedder = CountingEmbedder::new();
        let doc_ids = strings(&["d1", "d2"]);

        let original = strings(&["one", "two"]);
        load_or_embed_documents(&embedder, &original, &doc_ids, &cache, plan("ns", 8))
            .expect("first pass");
        let refreshed = load_or_embed_documents(
            &embedder,
            &strings(&["one", "two changed"]),
            &doc_ids,
            &cache,
            plan("ns", 8),
        )
        .expect("second pass");

        assert_eq!(embedder.embedded(), 3);
        let expected = HashEmbedder::new(32)
            .expect("embedder")
            .embed(&strings(&["two changed"]))
            .expect("embed");
        assert_eq!(refreshed[1], expected[0]);
    }

    #[test]
    fn batch_size_does_not_change_embeddings() {
        let documents = strings(&["a b c", "d e f", "g h i", "j k l", "m n o"]);
        let doc_ids = strings(&["1", "2", "3", "4", "5"]);

        let small = load_or_embed_documents(
            &HashEmbedder::new(32).expect("embedder"),
            &documents,
            &doc_ids,
            &EmbeddingCache::open_in_memory().expect("cache"),
            plan("small", 2),
        )
        .expect("small batches");
        let large = load_or_embed_documents(
            &HashEmbedder::new(32).expect("embedder"),
            &documents,
            &doc_ids,
            &EmbeddingCache::open_in_memory().expect("cache"),
            plan("large", 64),
        )
        .expect("large batches");
        assert_eq!(small, large);
    }

    #[test]
    fn accumulator_flushes_on_threshold_and_on_finish() {
        let cache = EmbeddingCache::open_in_memory().expect("cache");
        let mut accumulator = EmbeddingAccumulator::new(&cache, "acc", 2);
        let entry = |key: &str| CacheEntry {
            key: key.to_string(),
            text_hash: sha256_text(key),
            embedding: vec![1.0, 0.0],
        };

        accumulator.push(entry("a")).expect("push");
        assert!(cache.load("acc", "a", &sha256_text("a"), 2).expect("load").is_none());
        accumulator.push(entry("b")).expect("push");
        assert!(cache.load("acc", "a", &sha256_text("a"), 2).expect("load").is_some());

        accumulator.push(entry("c")).expect("push");
        assert_eq!(accumulator.finish().expect("finish"), 3);
        assert_eq!(
            cache.load("acc", "c", &sha256_text("c"), 2).expect("load"),
            Some(vec![1.0, 0.0])
        );
    }

    #[test]
    fn unit_cache_keys_by_sanitized_query_id() {
        let cache = EmbeddingCache::open_in_memory().expect("cache");
        let units = UnitEmbeddingCache::new(&cache, "units");
        let embedder = CountingEmbedder::new();
        let texts = strings(&["first unit", "second unit"]);

        let first = units.embed(&embedder, "task/7", "joint", &texts).expect("embed");
        let second = units.embed(&embedder, "task/7", "joint", &texts).expect("embed");
        assert_eq!(first, second);
        assert_eq!(embedder.embedded(), 2);
        assert!(
            cache
                .load("units", "task_7/joint/2", &sha256_text("second unit"), 32)
                .expect("load")
                .is_some()
        );
    }

    #[test]
    fn disabled_reads_always_miss() {
        let dir = crate::util::scratch_dir("cache-reads");
        let db_path = dir.join("embeddings.sqlite");
        let writer = EmbeddingCache::open(&db_path, true).expect("cache");
        let mut pending = vec![CacheEntry {
            key: "k".to_string(),
            text_hash: "h".to_string(),
            embedding: vec![0.5],
        }];
        writer.store_batch("ns", &mut pending).expect("store");
        assert!(writer.load("ns", "k", "h", 1).expect("load").is_some());
        drop(writer);

        let reader = EmbeddingCache::open(&db_path, false).expect("cache");
        assert!(reader.load("ns", "k", "h", 1).expect("load").is_none());
    }

    #[test]
    fn entries_of_another_dimension_are_misses() {
        let cache = EmbeddingCache::open_in_memory().expect("cache");
        let documents = strings(&["alpha beta", "gamma delta"]);
        let doc_ids = strings(&["d1", "d2"]);
        let wide = HashEmbedder::new(64).expect("embedder");
        load_or_embed_documents(&wide, &documents, &doc_ids, &cache, plan("shared", 8))
            .expect("wide pass");

        let narrow = CountingEmbedder::new();
        let vectors =
            load_or_embed_documents(&narrow, &documents, &doc_ids, &cache, plan("shared", 8))
                .expect("narrow pass");
        assert_eq!(narrow.embedded(), 2);
        assert!(vectors.iter().all(|vector| vector.len() == 32));
        assert!(
            cache
                .load("shared", "d1", &sha256_text("alpha beta"), 64)
                .expect("load")
                .is_none()
        );
    }

    #[test]
    fn namespaces_carry_the_embedder_fingerprint() {
        let narrow = HashEmbedder::new(128).expect("embedder");
        let wide = HashEmbedder::new(384).expect("embedder");
        assert_eq!(
            document_namespace(&narrow.fingerprint(), "biology", false, 16),
            "doc_emb/hash-dense_128/biology/long_false_16"
        );
        assert_ne!(
            unit_namespace(&narrow.fingerprint(), "biology", true, 16),
            unit_namespace(&wide.fingerprint(), "biology", true, 16)
        );
    }
}
