use std::path::PathBuf;

use anyhow::{Result, bail};
use tracing::info;

use crate::cli::EvaluateArgs;
use crate::dataset::{ExampleRecord, build_qrels, load_examples, verify_exclusions};
use crate::metrics::calculate_retrieval_metrics;
use crate::model::{MetricReport, OrderedMap, Qrels, RankedResult};
use crate::util::{read_json, write_json_pretty};

#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub report: MetricReport,
    pub hit_counts: OrderedMap<String>,
    pub evaluated_queries: usize,
}

pub fn run(args: EvaluateArgs) -> Result<()> {
    let scores = read_json::<RankedResult>(&args.score_path)?;
    if scores.is_empty() {
        bail!("score file {} holds no rankings", args.score_path.display());
    }
    let examples = load_examples(&args.examples_path)?;
    info!(
        score_path = %args.score_path.display(),
        queries = scores.len(),
        long_context = args.long_context,
        "evaluation started"
    );

    let outcome = evaluate_scores(&examples, &scores, args.long_context, &args.k_values)?;

    let results_path = args.results_path.clone().unwrap_or_else(|| {
        args.score_path
            .parent()
            .map(|parent| parent.join("results.json"))
            .unwrap_or_else(|| PathBuf::from("results.json"))
    });
    write_json_pretty(&results_path, &outcome.report)?;

    log_report(&outcome.report);
    info!(
        path = %results_path.display(),
        evaluated_queries = outcome.evaluated_queries,
        "evaluation completed"
    );
    Ok(())
}

/// Integrity checks, hit counts and trec-style metrics for stored rankings.
pub fn evaluate_scores(
    examples: &[ExampleRecord],
    scores: &RankedResult,
    long_context: bool,
    k_values: &[usize],
) -> Result<EvaluationOutcome> {
    let qrels = build_qrels(examples, long_context);
    verify_exclusions(examples, scores, &qrels)?;

    let hit_counts = hit_count_ratios(scores, &qrels);
    let report = calculate_retrieval_metrics(scores, &qrels, k_values)?;
    let evaluated_queries = scores
        .keys()
        .filter(|query_id| qrels.get(*query_id).is_some_and(|judged| !judged.is_empty()))
        .count();

    Ok(EvaluationOutcome {
        report,
        hit_counts,
        evaluated_queries,
    })
}

/// `"hit/total"` per ranked query: gold documents retrieved over gold documents.
pub fn hit_count_ratios(scores: &RankedResult, qrels: &Qrels) -> OrderedMap<String> {
    scores.map_values(|query_id, ranking| {
        let Some(judged) = qrels.get(query_id) else {
            return "0/0".to_string();
        };
        let hit = judged
            .keys()
            .filter(|doc_id| ranking.contains_key(doc_id))
            .count();
        format!("{hit}/{}", judged.len())
    })
}

pub fn log_report(report: &MetricReport) {
    for (metric, value) in report.iter() {
        info!(metric, value, "metric");
    }
}
