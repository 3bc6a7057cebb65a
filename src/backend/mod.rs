//! Retrieval backends behind one capability-variant abstraction.
//!
//! Dense backends turn texts into vectors and compare them by cosine
//! similarity. Lexical backends build an index over the documents and score
//! query texts against it. Everything downstream (aggregation, fusion,
//! metrics) only ever sees a [`ScoreMatrix`] or per-query score vectors.

use anyhow::{Context, Result, bail};
use rayon::prelude::*;

use crate::model::ScoreMatrix;

mod bm25;
mod hash;

pub use bm25::{Bm25Params, Bm25Ranker};
pub use hash::{
    HashEmbedder, MIN_EMBEDDING_DIM, cosine_similarity, decode_embedding_blob,
    encode_embedding_blob,
};

pub trait Embedder: Send + Sync {
    fn backend_id(&self) -> &str;

    /// Length of every vector this embedder returns.
    fn dimensions(&self) -> usize;

    /// Identifies the vector space; vectors with different fingerprints never mix.
    fn fingerprint(&self) -> String {
        format!("{}_{}", self.backend_id(), self.dimensions())
    }

    /// One vector per input text, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub trait LexicalRanker: Send + Sync {
    fn backend_id(&self) -> &str;

    fn index(&self, documents: &[String]) -> Result<Box<dyn LexicalIndex>>;
}

pub trait LexicalIndex: Send + Sync {
    fn document_count(&self) -> usize;

    /// Relevance of every indexed document for `query`, in document order.
    fn score(&self, query: &str) -> Result<Vec<f64>>;
}

/// Backend selected once at setup and handed to the scoring pipeline.
pub enum Backend {
    Dense(Box<dyn Embedder>),
    Lexical(Box<dyn LexicalRanker>),
}

impl Backend {
    pub fn backend_id(&self) -> &str {
        match self {
            Self::Dense(embedder) => embedder.backend_id(),
            Self::Lexical(ranker) => ranker.backend_id(),
        }
    }

    /// Cache identity of the backend's output, including its vector space.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Dense(embedder) => embedder.fingerprint(),
            Self::Lexical(ranker) => ranker.backend_id().to_string(),
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, Self::Dense(_))
    }

    /// Embeds or indexes the documents without consulting any cache.
    pub fn prepare(&self, documents: &[String]) -> Result<PreparedCorpus<'_>> {
        match self {
            Self::Dense(embedder) => {
                let embeddings = embedder.embed(documents).with_context(|| {
                    format!("{} failed to embed documents", embedder.backend_id())
                })?;
                PreparedCorpus::dense(embedder.as_ref(), embeddings, documents.len())
            }
            Self::Lexical(ranker) => {
                let index = ranker
                    .index(documents)
                    .with_context(|| format!("{} failed to index documents", ranker.backend_id()))?;
                Ok(PreparedCorpus::Lexical { index })
            }
        }
    }

    /// Scores every query against every document.
    pub fn score_all(&self, queries: &[String], documents: &[String]) -> Result<ScoreMatrix> {
        self.prepare(documents)?.score_texts(queries)
    }
}

/// Documents in the form a backend scores against.
pub enum PreparedCorpus<'a> {
    Dense {
        embedder: &'a dyn Embedder,
        documents: Vec<Vec<f32>>,
    },
    Lexical {
        index: Box<dyn LexicalIndex>,
    },
}

impl<'a> PreparedCorpus<'a> {
    pub fn dense(
        embedder: &'a dyn Embedder,
        documents: Vec<Vec<f32>>,
        expected: usize,
    ) -> Result<Self> {
        if documents.len() != expected {
            bail!(
                "{} returned {} document embeddings for {} documents",
                embedder.backend_id(),
                documents.len(),
                expected
            );
        }
        check_dimensions(embedder, &documents, "document")?;
        Ok(Self::Dense {
            embedder,
            documents,
        })
    }

    pub fn document_count(&self) -> usize {
        match self {
            Self::Dense { documents, .. } => documents.len(),
            Self::Lexical { index } => index.document_count(),
        }
    }

    pub fn score_texts(&self, texts: &[String]) -> Result<ScoreMatrix> {
        match self {
            Self::Dense { embedder, .. } => {
                let vectors = embed_checked(*embedder, texts)?;
                self.score_vectors(&vectors)
            }
            Self::Lexical { index } => {
                let rows = texts
                    .par_iter()
                    .map(|text| index.score(text))
                    .collect::<Result<Vec<Vec<f64>>>>()?;
                Ok(ScoreMatrix::from_rows(rows))
            }
        }
    }

    /// Cosine similarity of each vector against every document embedding.
    /// Lexical corpora have no vector space and yield an empty matrix.
    pub fn score_vectors(&self, vectors: &[Vec<f32>]) -> Result<ScoreMatrix> {
        let Self::Dense {
            embedder,
            documents,
        } = self
        else {
            return Ok(ScoreMatrix::default());
        };
        check_dimensions(*embedder, vectors, "query")?;

        let rows = vectors
            .par_iter()
            .map(|vector| {
                documents
                    .iter()
                    .map(|document| cosine_similarity(vector, document))
                    .collect::<Vec<f64>>()
            })
            .collect::<Vec<Vec<f64>>>();
        Ok(ScoreMatrix::from_rows(rows))
    }
}

fn check_dimensions(embedder: &dyn Embedder, vectors: &[Vec<f32>], role: &str) -> Result<()> {
    let expected = embedder.dimensions();
    if let Some(vector) = vectors.iter().find(|vector| vector.len() != expected) {
        bail!(
            "{role} embedding has {} dimensions, {} produces {expected}",
            vector.len(),
            embedder.fingerprint()
        );
    }
    Ok(())
}

pub fn embed_checked(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let vectors = embedder.embed(texts).with_context(|| {
        format!("{} failed to embed {} texts", embedder.backend_id(), texts.len())
    })?;
    if vectors.len() != texts.len() {
        bail!(
            "{} returned {} embeddings for {} texts",
            embedder.backend_id(),
            vectors.len(),
            texts.len()
        );
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests;
