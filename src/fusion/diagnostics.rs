use std::collections::HashSet;

use serde::Serialize;

use crate::model::{GoldSets, OrderedMap};
use crate::scoring::TOP_K;

/// How much of the gold set the units reach before fusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OracleStats {
    pub total_docs: usize,
    pub total_docs_unique: usize,
    pub hit_gold_ids: usize,
    pub total_gold_ids: usize,
    pub unit_hits: OrderedMap<usize>,
}

pub fn build_oracle_stats(
    per_unit_docs: &OrderedMap<OrderedMap<Vec<String>>>,
    ground_truth: &GoldSets,
) -> OrderedMap<OracleStats> {
    let empty_gold = HashSet::<String>::new();
    per_unit_docs.map_values(|query_id, unit_docs| {
        let gold = ground_truth.get(query_id).unwrap_or(&empty_gold);
        let unique_docs = unit_docs
            .values()
            .flatten()
            .map(String::as_str)
            .collect::<HashSet<&str>>();
        let hit_gold_ids = unique_docs
            .iter()
            .filter(|doc_id| gold.contains(**doc_id))
            .count();
        let unit_hits = unit_docs.map_values(|_, docs| {
            docs.iter()
                .map(String::as_str)
                .collect::<HashSet<&str>>()
                .into_iter()
                .filter(|doc_id| gold.contains(*doc_id))
                .count()
        });

        OracleStats {
            total_docs: unit_docs.len() * TOP_K,
            total_docs_unique: unique_docs.len(),
            hit_gold_ids,
            total_gold_ids: gold.len(),
            unit_hits,
        }
    })
}

/// Per-unit hit counts rendered as `"hit/total"` against each query's gold set.
pub fn unit_hit_ratios(
    per_unit_hits: &OrderedMap<OrderedMap<usize>>,
    ground_truth: &GoldSets,
) -> OrderedMap<OrderedMap<String>> {
    per_unit_hits.map_values(|query_id, hits| {
        let total = ground_truth.get(query_id).map_or(0, HashSet::len);
        hits.map_values(|_, count| format!("{count}/{total}"))
    })
}
