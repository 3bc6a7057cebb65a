use std::collections::{HashMap, HashSet};

use anyhow::{Result, bail};
use rayon::prelude::*;
use tracing::debug;

use crate::model::{ExcludedIds, RankedResult, Ranking, ScoreMatrix};

/// Number of documents kept per query ranking.
pub const TOP_K: usize = 1000;

/// Excluded-id placeholder meaning "nothing to exclude".
pub const NO_EXCLUSION_SENTINEL: &str = "N/A";

/// Turns a dense score matrix into one filtered, truncated ranking per query.
pub fn get_scores(
    query_ids: &[String],
    doc_ids: &[String],
    scores: &ScoreMatrix,
    excluded_ids: &ExcludedIds,
) -> Result<RankedResult> {
    if scores.row_count() != query_ids.len() {
        bail!(
            "score matrix has {} rows but {} query ids were given",
            scores.row_count(),
            query_ids.len()
        );
    }
    for (row_index, row) in scores.rows().iter().enumerate() {
        if row.len() != doc_ids.len() {
            bail!(
                "score row {row_index} has {} columns but {} document ids were given",
                row.len(),
                doc_ids.len()
            );
        }
    }

    let rankings = query_ids
        .par_iter()
        .zip(scores.rows().par_iter())
        .map(|(query_id, row)| {
            let excluded = excluded_for(excluded_ids, query_id);
            (query_id.clone(), rank_scores(doc_ids, row, excluded))
        })
        .collect::<Vec<(String, Ranking)>>();

    Ok(RankedResult::from_entries(rankings))
}

pub fn excluded_for<'a>(excluded_ids: &'a ExcludedIds, query_id: &str) -> &'a [String] {
    excluded_ids
        .get(query_id)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Zip, exclude, then truncate to the top [`TOP_K`].
pub fn rank_scores(doc_ids: &[String], scores: &[f64], excluded: &[String]) -> Ranking {
    let mut entries = zip_scores(doc_ids, scores);
    apply_exclusions(&mut entries, excluded);
    top_k(entries, TOP_K)
}

/// Pairs ids with scores; a repeated id takes the later score at its first position.
pub fn zip_scores(doc_ids: &[String], scores: &[f64]) -> Vec<(String, f64)> {
    let mut positions = HashMap::<&str, usize>::with_capacity(doc_ids.len());
    let mut entries = Vec::<(String, f64)>::with_capacity(doc_ids.len());
    for (doc_id, score) in doc_ids.iter().zip(scores.iter()) {
        match positions.get(doc_id.as_str()) {
            Some(&index) => entries[index].1 = *score,
            None => {
                positions.insert(doc_id.as_str(), entries.len());
                entries.push((doc_id.clone(), *score));
            }
        }
    }
    entries
}

pub fn apply_exclusions(entries: &mut Vec<(String, f64)>, excluded: &[String]) {
    let blocked = excluded
        .iter()
        .map(String::as_str)
        .filter(|doc_id| *doc_id != NO_EXCLUSION_SENTINEL)
        .collect::<HashSet<&str>>();
    if blocked.is_empty() {
        return;
    }

    let before = entries.len();
    entries.retain(|(doc_id, _)| !blocked.contains(doc_id.as_str()));
    let removed = before - entries.len();
    if removed < blocked.len() {
        debug!(
            excluded = blocked.len(),
            removed, "some excluded ids were not among the scored documents"
        );
    }
}

/// Stable descending sort; equal scores keep their incoming order.
pub fn top_k(mut entries: Vec<(String, f64)>, k: usize) -> Ranking {
    entries.sort_by(|left, right| right.1.total_cmp(&left.1));
    entries.truncate(k);

    let mut ranking = Ranking::with_capacity(entries.len());
    for (doc_id, score) in entries {
        ranking.push(doc_id, score);
    }
    ranking
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(prefix: &str, count: usize) -> Vec<String> {
        (0..count).map(|index| format!("{prefix}{index}")).collect()
    }

    #[test]
    fn get_scores_drops_excluded_ids_and_sorts_descending() {
        let query_ids = vec!["q1".to_string(), "q2".to_string()];
        let doc_ids = ids("d", 4);
        let scores = ScoreMatrix::from_rows(vec![
            vec![0.1, 0.9, 0.5, 0.7],
            vec![0.3, 0.2, 0.8, 0.4],
        ]);
        let excluded = ExcludedIds::from([
            ("q1".to_string(), vec!["d1".to_string()]),
            ("q2".to_string(), vec!["N/A".to_string()]),
        ]);

        let result = get_scores(&query_ids, &doc_ids, &scores, &excluded).expect("scores");
        let q1 = result.get("q1").expect("q1 ranking");
        assert_eq!(q1.keys().collect::<Vec<_>>(), vec!["d3", "d2", "d0"]);
        assert!(!q1.contains_key("d1"));

        let q2 = result.get("q2").expect("q2 ranking");
        assert_eq!(q2.keys().collect::<Vec<_>>(), vec!["d2", "d3", "d0", "d1"]);
    }

    #[test]
    fn get_scores_rejects_shape_mismatches() {
        let doc_ids = ids("d", 2);
        let excluded = ExcludedIds::new();

        let error = get_scores(
            &["q1".to_string()],
            &doc_ids,
            &ScoreMatrix::from_rows(vec![vec![0.1, 0.2], vec![0.3, 0.4]]),
            &excluded,
        )
        .expect_err("row mismatch must fail");
        assert!(error.to_string().contains("2 rows"), "unexpected error: {error}");

        let error = get_scores(
            &["q1".to_string()],
            &doc_ids,
            &ScoreMatrix::from_rows(vec![vec![0.1, 0.2, 0.3]]),
            &excluded,
        )
        .expect_err("column mismatch must fail");
        assert!(error.to_string().contains("3 columns"), "unexpected error: {error}");
    }

    #[test]
    fn rankings_are_truncated_to_top_k() {
        let doc_ids = ids("d", TOP_K + 250);
        let row = (0..doc_ids.len()).map(|index| index as f64).collect::<Vec<f64>>();
        let result = get_scores(
            &["q".to_string()],
            &doc_ids,
            &ScoreMatrix::from_rows(vec![row]),
            &ExcludedIds::new(),
        )
        .expect("scores");

        let ranking = result.get("q").expect("ranking");
        assert_eq!(ranking.len(), TOP_K);
        let values = ranking.values().copied().collect::<Vec<f64>>();
        assert!(values.windows(2).all(|pair| pair[0] >= pair[1]));
        assert_eq!(ranking.keys().next(), Some("d1249"));
    }

    #[test]
    fn ties_keep_document_order() {
        let doc_ids = ids("d", 5);
        let ranking = rank_scores(&doc_ids, &[0.5, 0.7, 0.5, 0.7, 0.5], &[]);
        assert_eq!(
            ranking.keys().collect::<Vec<_>>(),
            vec!["d1", "d3", "d0", "d2", "d4"]
        );
    }

    #[test]
    fn duplicate_document_ids_keep_first_position_with_last_score() {
        let doc_ids = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let entries = zip_scores(&doc_ids, &[0.1, 0.5, 0.9]);
        assert_eq!(entries, vec![("a".to_string(), 0.9), ("b".to_string(), 0.5)]);
    }

    #[test]
    fn get_scores_is_idempotent() {
        let query_ids = ids("q", 3);
        let doc_ids = ids("d", 6);
        let rows = (0..3)
            .map(|row| {
                (0..6)
                    .map(|col| ((row * 7 + col * 3) % 5) as f64 / 5.0)
                    .collect::<Vec<f64>>()
            })
            .collect::<Vec<_>>();
        let scores = ScoreMatrix::from_rows(rows);
        let excluded = ExcludedIds::from([("q1".to_string(), vec!["d2".to_string()])]);

        let first = get_scores(&query_ids, &doc_ids, &scores, &excluded).expect("first");
        let second = get_scores(&query_ids, &doc_ids, &scores, &excluded).expect("second");
        assert_eq!(
            serde_json::to_string(&first).expect("json"),
            serde_json::to_string(&second).expect("json")
        );
        assert_eq!(first.keys().collect::<Vec<_>>(), vec!["q0", "q1", "q2"]);
    }

    #[test]
    fn missing_exclusion_entry_means_nothing_is_excluded() {
        let doc_ids = ids("d", 3);
        let result = get_scores(
            &["q".to_string()],
            &doc_ids,
            &ScoreMatrix::from_rows(vec![vec![0.3, 0.2, 0.1]]),
            &ExcludedIds::new(),
        )
        .expect("scores");
        assert_eq!(result.get("q").map(Ranking::len), Some(3));
    }
}
