//! Multi-unit fusion for composite queries.
//!
//! A composite query carries several `(sub-query, description)` units. Each
//! unit is scored against the whole corpus on its own, the per-unit score
//! vectors are fused elementwise, and the fused vector goes through the same
//! exclusion and top-k path as plain retrieval. Per-unit rankings are kept as
//! oracle diagnostics.

use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::backend::{Embedder, PreparedCorpus, embed_checked};
use crate::cache::UnitEmbeddingCache;
use crate::cli::{EmbedMethod, FusionMethod};
use crate::model::{ExcludedIds, GoldSets, OrderedMap, RankedResult, Ranking};
use crate::scoring::{TOP_K, excluded_for, rank_scores, top_k, zip_scores};

mod diagnostics;
mod units;

pub use diagnostics::{build_oracle_stats, unit_hit_ratios};
pub use units::{Unit, UnitExtractor};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionConfig {
    pub embed_method: EmbedMethod,
    pub desc_weight: f64,
    pub fusion_method: FusionMethod,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            embed_method: EmbedMethod::Separate,
            desc_weight: 0.5,
            fusion_method: FusionMethod::Sum,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.desc_weight) {
            bail!(
                "desc_weight must be within [0, 1], got {}",
                self.desc_weight
            );
        }
        Ok(())
    }
}

pub struct FusionRequest<'a> {
    pub queries: &'a [String],
    pub query_ids: &'a [String],
    pub doc_ids: &'a [String],
    pub excluded_ids: &'a ExcludedIds,
    pub ground_truth: Option<&'a GoldSets>,
}

/// Fused rankings plus per-unit and fused hit diagnostics, all keyed by query id.
#[derive(Debug, Clone, Default)]
pub struct FusionOutcome {
    pub fused: RankedResult,
    pub per_unit_hits: OrderedMap<OrderedMap<usize>>,
    pub per_unit_docs: OrderedMap<OrderedMap<Vec<String>>>,
    pub fused_hit_counts: OrderedMap<usize>,
}

struct QueryFusion {
    query_id: String,
    ranking: Ranking,
    unit_hits: OrderedMap<usize>,
    unit_docs: OrderedMap<Vec<String>>,
    fused_hits: usize,
}

pub struct FusionEngine<'a> {
    corpus: &'a PreparedCorpus<'a>,
    config: FusionConfig,
    extractor: UnitExtractor,
    unit_cache: Option<UnitEmbeddingCache<'a>>,
}

impl<'a> FusionEngine<'a> {
    pub fn new(corpus: &'a PreparedCorpus<'a>, config: FusionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            corpus,
            config,
            extractor: UnitExtractor::new()?,
            unit_cache: None,
        })
    }

    pub fn with_unit_cache(mut self, unit_cache: UnitEmbeddingCache<'a>) -> Self {
        self.unit_cache = Some(unit_cache);
        self
    }

    pub fn run(&self, request: &FusionRequest<'_>) -> Result<FusionOutcome> {
        if request.queries.len() != request.query_ids.len() {
            bail!(
                "{} queries but {} query ids were given",
                request.queries.len(),
                request.query_ids.len()
            );
        }
        if self.corpus.document_count() != request.doc_ids.len() {
            bail!(
                "corpus holds {} documents but {} document ids were given",
                self.corpus.document_count(),
                request.doc_ids.len()
            );
        }

        info!(
            queries = request.queries.len(),
            documents = request.doc_ids.len(),
            embed_method = self.config.embed_method.as_str(),
            fusion_method = self.config.fusion_method.as_str(),
            desc_weight = self.config.desc_weight,
            "fusion started"
        );

        let per_query = request
            .query_ids
            .par_iter()
            .zip(request.queries.par_iter())
            .map(|(query_id, query_text)| {
                self.fuse_query(query_id, query_text, request)
                    .with_context(|| format!("fusion failed for query {query_id}"))
            })
            .collect::<Result<Vec<QueryFusion>>>()?;

        let mut fused = Vec::with_capacity(per_query.len());
        let mut unit_hits = Vec::with_capacity(per_query.len());
        let mut unit_docs = Vec::with_capacity(per_query.len());
        let mut fused_hits = Vec::with_capacity(per_query.len());
        for query in per_query {
            fused.push((query.query_id.clone(), query.ranking));
            unit_hits.push((query.query_id.clone(), query.unit_hits));
            unit_docs.push((query.query_id.clone(), query.unit_docs));
            fused_hits.push((query.query_id, query.fused_hits));
        }
        let outcome = FusionOutcome {
            fused: OrderedMap::from_entries(fused),
            per_unit_hits: OrderedMap::from_entries(unit_hits),
            per_unit_docs: OrderedMap::from_entries(unit_docs),
            fused_hit_counts: OrderedMap::from_entries(fused_hits),
        };

        info!(queries = outcome.fused.len(), "fusion completed");
        Ok(outcome)
    }

    fn fuse_query(
        &self,
        query_id: &str,
        query_text: &str,
        request: &FusionRequest<'_>,
    ) -> Result<QueryFusion> {
        let units = self.extractor.extract(query_text);
        debug!(query_id, units = units.len(), "extracted retrieval units");

        let unit_scores = self.score_units(query_id, &units)?;
        for (index, scores) in unit_scores.iter().enumerate() {
            if scores.len() != request.doc_ids.len() {
                bail!(
                    "unit {} produced {} scores for {} documents",
                    index + 1,
                    scores.len(),
                    request.doc_ids.len()
                );
            }
        }

        let empty_gold = HashSet::<String>::new();
        let gold = request
            .ground_truth
            .and_then(|ground_truth| ground_truth.get(query_id))
            .unwrap_or(&empty_gold);

        let mut unit_hits = OrderedMap::with_capacity(units.len());
        let mut unit_docs = OrderedMap::with_capacity(units.len());
        for (index, scores) in unit_scores.iter().enumerate() {
            let label = format!("Unit{}", index + 1);
            let top_ids = top_k(zip_scores(request.doc_ids, scores), TOP_K)
                .keys()
                .map(str::to_string)
                .collect::<Vec<String>>();
            unit_hits.push(label.clone(), count_hits(top_ids.iter().map(String::as_str), gold));
            unit_docs.push(label, top_ids);
        }

        let fused_scores =
            fuse_unit_scores(&unit_scores, self.config.fusion_method, request.doc_ids.len());
        let ranking = rank_scores(
            request.doc_ids,
            &fused_scores,
            excluded_for(request.excluded_ids, query_id),
        );
        let fused_hits = count_hits(ranking.keys(), gold);

        Ok(QueryFusion {
            query_id: query_id.to_string(),
            ranking,
            unit_hits,
            unit_docs,
            fused_hits,
        })
    }

    /// One score vector per unit, aligned with the corpus document order.
    fn score_units(&self, query_id: &str, units: &[Unit]) -> Result<Vec<Vec<f64>>> {
        match self.corpus {
            PreparedCorpus::Dense { embedder, .. } => {
                let unit_vectors = match self.config.embed_method {
                    EmbedMethod::Joint => {
                        let texts = units.iter().map(Unit::joint_text).collect::<Vec<String>>();
                        self.embed_units(*embedder, query_id, "joint", &texts)?
                    }
                    EmbedMethod::Separate => {
                        let sub_queries = units
                            .iter()
                            .map(|unit| unit.sub_query.clone())
                            .collect::<Vec<String>>();
                        let descriptions = units
                            .iter()
                            .map(|unit| unit.description.clone())
                            .collect::<Vec<String>>();
                        let query_vectors =
                            self.embed_units(*embedder, query_id, "query", &sub_queries)?;
                        let desc_vectors =
                            self.embed_units(*embedder, query_id, "desc", &descriptions)?;
                        blend_unit_vectors(&query_vectors, &desc_vectors, self.config.desc_weight)?
                    }
                };
                Ok(self.corpus.score_vectors(&unit_vectors)?.into_rows())
            }
            PreparedCorpus::Lexical { index } => units
                .iter()
                .map(|unit| index.score(&unit.joint_text()))
                .collect(),
        }
    }

    fn embed_units(
        &self,
        embedder: &dyn Embedder,
        query_id: &str,
        role: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        match &self.unit_cache {
            Some(cache) => cache.embed(embedder, query_id, role, texts),
            None => embed_checked(embedder, texts),
        }
    }
}

/// `w * description + (1 - w) * sub_query`, unit by unit.
pub fn blend_unit_vectors(
    query_vectors: &[Vec<f32>],
    desc_vectors: &[Vec<f32>],
    desc_weight: f64,
) -> Result<Vec<Vec<f32>>> {
    if query_vectors.len() != desc_vectors.len() {
        bail!(
            "{} sub-query embeddings but {} description embeddings",
            query_vectors.len(),
            desc_vectors.len()
        );
    }

    let weight = desc_weight as f32;
    query_vectors
        .iter()
        .zip(desc_vectors.iter())
        .map(|(query, desc)| -> Result<Vec<f32>> {
            if query.len() != desc.len() {
                bail!(
                    "sub-query embedding has {} dimensions, description has {}",
                    query.len(),
                    desc.len()
                );
            }
            Ok(query
                .iter()
                .zip(desc.iter())
                .map(|(q, d)| weight * d + (1.0 - weight) * q)
                .collect())
        })
        .collect()
}

pub fn fuse_unit_scores(
    unit_scores: &[Vec<f64>],
    method: FusionMethod,
    doc_count: usize,
) -> Vec<f64> {
    let mut buffer = match method {
        FusionMethod::Sum => vec![0.0_f64; doc_count],
        FusionMethod::Max => vec![f64::NEG_INFINITY; doc_count],
    };
    for scores in unit_scores {
        for (slot, score) in buffer.iter_mut().zip(scores.iter()) {
            match method {
                FusionMethod::Sum => *slot += score,
                FusionMethod::Max => *slot = slot.max(*score),
            }
        }
    }
    buffer
}

fn count_hits<'s>(doc_ids: impl Iterator<Item = &'s str>, gold: &HashSet<String>) -> usize {
    if gold.is_empty() {
        return 0;
    }
    doc_ids
        .collect::<HashSet<&str>>()
        .into_iter()
        .filter(|doc_id| gold.contains(*doc_id))
        .count()
}
