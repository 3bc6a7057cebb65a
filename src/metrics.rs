//! trec_eval-compatible retrieval metrics.
//!
//! A query is evaluated when it appears both in the results and in the
//! judgments. Retrieved documents are re-sorted the way trec_eval does it:
//! score descending, then document id descending. A judgment grade of at
//! least 1 counts as relevant; NDCG uses the raw grade as gain.

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::{Result, bail};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::model::{MetricReport, Qrels, RankedResult, Ranking};

pub const DEFAULT_K_VALUES: [usize; 6] = [1, 5, 10, 25, 50, 100];

const ROUNDING_SCALE: f64 = 1e5;

#[derive(Debug, Clone, Default)]
struct QueryMetrics {
    ndcg: Vec<f64>,
    map: Vec<f64>,
    recall: Vec<f64>,
    precision: Vec<f64>,
    reciprocal_rank: f64,
}

pub fn calculate_retrieval_metrics(
    results: &RankedResult,
    qrels: &Qrels,
    k_values: &[usize],
) -> Result<MetricReport> {
    if k_values.is_empty() {
        bail!("at least one cutoff is required");
    }
    if let Some(zero) = k_values.iter().find(|k| **k == 0) {
        bail!("cutoffs must be positive, got {zero}");
    }

    let evaluated = results
        .iter()
        .filter_map(|(query_id, ranking)| {
            qrels
                .get(query_id)
                .filter(|judgments| !judgments.is_empty())
                .map(|judgments| (query_id, ranking, judgments))
        })
        .collect::<Vec<_>>();
    if evaluated.is_empty() {
        bail!(
            "no evaluable queries: {} result queries, none with relevance judgments",
            results.len()
        );
    }
    let skipped = results.len() - evaluated.len();
    if skipped > 0 {
        debug!(skipped, "queries without judgments left out of the averages");
    }

    let per_query = evaluated
        .par_iter()
        .map(|(_, ranking, judgments)| score_query(ranking, judgments, k_values))
        .collect::<Vec<QueryMetrics>>();

    let mut report = MetricReport::with_capacity(k_values.len() * 4 + 1);
    for (index, k) in k_values.iter().enumerate() {
        report.push(format!("NDCG@{k}"), average(&per_query, |query| query.ndcg[index]));
    }
    for (index, k) in k_values.iter().enumerate() {
        report.push(format!("MAP@{k}"), average(&per_query, |query| query.map[index]));
    }
    for (index, k) in k_values.iter().enumerate() {
        report.push(format!("Recall@{k}"), average(&per_query, |query| query.recall[index]));
    }
    for (index, k) in k_values.iter().enumerate() {
        report.push(format!("P@{k}"), average(&per_query, |query| query.precision[index]));
    }
    report.push("MRR".to_string(), average(&per_query, |query| query.reciprocal_rank));

    info!(
        evaluated_queries = per_query.len(),
        skipped_queries = skipped,
        "retrieval metrics computed"
    );
    Ok(report)
}

fn score_query(
    ranking: &Ranking,
    judgments: &HashMap<String, i64>,
    k_values: &[usize],
) -> QueryMetrics {
    let ordered = trec_order(ranking);
    let grades = ordered
        .iter()
        .map(|doc_id| judgments.get(*doc_id).copied().unwrap_or(0))
        .collect::<Vec<i64>>();
    let relevant_total = judgments.values().filter(|grade| **grade >= 1).count();

    let mut ideal_grades = judgments
        .values()
        .copied()
        .filter(|grade| *grade > 0)
        .collect::<Vec<i64>>();
    ideal_grades.sort_unstable_by(|left, right| right.cmp(left));

    let mut metrics = QueryMetrics {
        reciprocal_rank: grades
            .iter()
            .position(|grade| *grade >= 1)
            .map_or(0.0, |index| 1.0 / (index + 1) as f64),
        ..QueryMetrics::default()
    };

    for &k in k_values {
        let top = &grades[..grades.len().min(k)];
        let hits = top.iter().filter(|grade| **grade >= 1).count();

        metrics.ndcg.push(ndcg_at_k(top, &ideal_grades, k));
        metrics.map.push(average_precision(top, relevant_total));
        metrics.recall.push(ratio(hits, relevant_total));
        metrics.precision.push(hits as f64 / k as f64);
    }
    metrics
}

/// Score descending, ties broken by document id descending.
fn trec_order(ranking: &Ranking) -> Vec<&str> {
    let mut ordered = ranking.iter().collect::<Vec<(&str, &f64)>>();
    ordered.sort_by(|left, right| match right.1.total_cmp(left.1) {
        Ordering::Equal => right.0.cmp(left.0),
        other => other,
    });
    ordered.into_iter().map(|(doc_id, _)| doc_id).collect()
}

fn ndcg_at_k(top: &[i64], ideal_grades: &[i64], k: usize) -> f64 {
    let dcg = discounted_gain(top.iter().copied());
    let idcg = discounted_gain(ideal_grades.iter().copied().take(k));
    if idcg <= 0.0 {
        return 0.0;
    }
    dcg / idcg
}

fn discounted_gain(grades: impl Iterator<Item = i64>) -> f64 {
    grades
        .enumerate()
        .filter(|(_, grade)| *grade > 0)
        .map(|(index, grade)| grade as f64 / (index as f64 + 2.0).log2())
        .sum()
}

fn average_precision(top: &[i64], relevant_total: usize) -> f64 {
    let mut hits = 0usize;
    let mut precision_sum = 0.0;
    for (index, grade) in top.iter().enumerate() {
        if *grade >= 1 {
            hits += 1;
            precision_sum += hits as f64 / (index + 1) as f64;
        }
    }
    if relevant_total == 0 {
        return 0.0;
    }
    precision_sum / relevant_total as f64
}

/// Mean over evaluated queries, rounded to five decimals.
fn average(per_query: &[QueryMetrics], pick: impl Fn(&QueryMetrics) -> f64) -> f64 {
    let total = per_query.iter().map(pick).sum::<f64>();
    round_metric(total / per_query.len() as f64)
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    numerator as f64 / denominator as f64
}

fn round_metric(value: f64) -> f64 {
    (value * ROUNDING_SCALE).round() / ROUNDING_SCALE
}
