use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::backend::{Backend, Bm25Params, Bm25Ranker, HashEmbedder, PreparedCorpus};
use crate::cache::{
    DocumentEmbeddingPlan, EmbeddingCache, UnitEmbeddingCache, document_namespace,
    load_or_embed_documents, unit_namespace,
};
use crate::cli::{BackendKind, RetrieveArgs};
use crate::commands::evaluate::{evaluate_scores, log_report};
use crate::dataset::{
    Corpus, DEBUG_DOCUMENT_LIMIT, ExampleRecord, TaskConfig, TaskInputs, apply_instruction,
    check_doc_id_manifest, load_documents, load_examples,
};
use crate::fusion::{
    FusionConfig, FusionEngine, FusionRequest, build_oracle_stats, unit_hit_ratios,
};
use crate::model::{RankedResult, RetrievalCounts, RetrievalRunManifest, RetrievalSettings};
use crate::scoring::get_scores;
use crate::util::{
    ensure_directory, now_utc_string, read_json, utc_compact_string, write_json_pretty,
};

const MANIFEST_VERSION: u32 = 1;

pub fn run(args: RetrieveArgs) -> Result<()> {
    let started_at = now_utc_string();
    let started = Instant::now();
    let run_id = format!("retrieve-{}", utc_compact_string(Utc::now()));

    let output_dir = output_directory(&args);
    ensure_directory(&output_dir)?;
    let score_path = output_dir.join("score.json");
    let examples = load_examples(&args.examples_path)?;

    info!(
        run_id = %run_id,
        task = %args.task,
        backend = args.backend.as_str(),
        fusion_desc = args.fusion_desc,
        long_context = args.long_context,
        output_dir = %output_dir.display(),
        "retrieval started"
    );

    let mut outputs = Vec::<String>::new();
    let mut warnings = Vec::<String>::new();
    let score_reused = score_path.exists();
    let (scores, document_count) = if score_reused {
        info!(path = %score_path.display(), "score file exists, reusing it");
        warnings.push("score.json reused; documents were not reloaded".to_string());
        (read_json::<RankedResult>(&score_path)?, 0)
    } else {
        let computed = compute_scores(&args, &examples, &output_dir, &mut outputs)?;
        write_json_pretty(&score_path, &computed.0)?;
        computed
    };
    outputs.push("score.json".to_string());

    let evaluation = evaluate_scores(&examples, &scores, args.long_context, &args.k_values)?;
    let hit_counts_name = format!("hit_counts_{}.json", hit_count_label(&args));
    write_json_pretty(&output_dir.join(&hit_counts_name), &evaluation.hit_counts)?;
    outputs.push(hit_counts_name);
    write_json_pretty(&output_dir.join("results.json"), &evaluation.report)?;
    outputs.push("results.json".to_string());
    log_report(&evaluation.report);

    let manifest = RetrievalRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id,
        task: args.task.clone(),
        backend: args.backend.as_str().to_string(),
        fusion_desc: args.fusion_desc,
        long_context: args.long_context,
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        duration_ms: started.elapsed().as_millis(),
        score_reused,
        settings: RetrievalSettings {
            embed_method: args.embed_method.as_str().to_string(),
            desc_weight: args.desc_weight,
            fusion_method: args.fusion_method.as_str().to_string(),
            k_values: args.k_values.clone(),
            batch_size: args.batch_size,
            flush_every: args.flush_every,
            dimensions: args.dimensions,
        },
        counts: RetrievalCounts {
            query_count: scores.len(),
            document_count,
            evaluated_query_count: evaluation.evaluated_queries,
        },
        outputs,
        warnings,
    };
    let manifest_path = output_dir.join("run_manifest.json");
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        queries = manifest.counts.query_count,
        evaluated_queries = manifest.counts.evaluated_query_count,
        duration_ms = manifest.duration_ms,
        "retrieval completed"
    );
    Ok(())
}

/// `<output_dir>/<task>_<label>_long_<flag>`; fusion runs are labelled by backend family.
pub fn output_directory(args: &RetrieveArgs) -> PathBuf {
    args.output_dir.join(format!(
        "{}_{}_long_{}",
        args.task,
        hit_count_label(args),
        args.long_context
    ))
}

fn hit_count_label(args: &RetrieveArgs) -> &'static str {
    if args.fusion_desc {
        args.backend.family()
    } else {
        args.backend.as_str()
    }
}

pub fn build_backend(kind: BackendKind, dimensions: usize) -> Result<Backend> {
    Ok(match kind {
        BackendKind::Bm25 => Backend::Lexical(Box::new(Bm25Ranker::new(Bm25Params::default()))),
        BackendKind::HashDense => Backend::Dense(Box::new(HashEmbedder::new(dimensions)?)),
    })
}

fn compute_scores(
    args: &RetrieveArgs,
    examples: &[ExampleRecord],
    output_dir: &Path,
    outputs: &mut Vec<String>,
) -> Result<(RankedResult, usize)> {
    let inputs = TaskInputs::from_examples(examples, args.long_context)?;
    let mut corpus = Corpus::from_records(load_documents(&args.documents_path)?);
    if corpus.is_empty() {
        bail!("no documents in {}", args.documents_path.display());
    }
    check_doc_id_manifest(&args.cache_dir, &args.task, args.long_context, &corpus.doc_ids)?;
    if args.debug {
        corpus.truncate(DEBUG_DOCUMENT_LIMIT);
        warn!(documents = corpus.len(), "debug run, corpus truncated");
    }
    info!(queries = inputs.queries.len(), documents = corpus.len(), "inputs loaded");

    let backend = build_backend(args.backend, args.dimensions)?;
    ensure_directory(&args.cache_dir)?;
    let cache_path = args.cache_dir.join("embedding_cache.sqlite");
    let cache = EmbeddingCache::open(&cache_path, !args.ignore_cache)?;

    let scores = if args.fusion_desc {
        fused_scores(args, &backend, &cache, &inputs, &corpus, output_dir, outputs)?
    } else {
        plain_scores(args, &backend, &cache, &inputs, &corpus)?
    };
    Ok((scores, corpus.len()))
}

fn plain_scores(
    args: &RetrieveArgs,
    backend: &Backend,
    cache: &EmbeddingCache,
    inputs: &TaskInputs,
    corpus: &Corpus,
) -> Result<RankedResult> {
    let matrix = if backend.is_dense() {
        let config = TaskConfig::load(&args.config_dir, args.backend.as_str(), &args.task)?;
        let instructions = config.instructions(args.long_context);
        let queries = apply_instruction(&instructions.query, &args.task, &inputs.queries);
        let documents = apply_instruction(&instructions.document, &args.task, &corpus.documents);
        prepare_corpus(args, backend, cache, &documents, &corpus.doc_ids)?.score_texts(&queries)?
    } else {
        backend.score_all(&inputs.queries, &corpus.documents)?
    };

    get_scores(&inputs.query_ids, &corpus.doc_ids, &matrix, &inputs.excluded_ids)
}

fn fused_scores(
    args: &RetrieveArgs,
    backend: &Backend,
    cache: &EmbeddingCache,
    inputs: &TaskInputs,
    corpus: &Corpus,
    output_dir: &Path,
    outputs: &mut Vec<String>,
) -> Result<RankedResult> {
    let prepared = prepare_corpus(args, backend, cache, &corpus.documents, &corpus.doc_ids)?;
    let config = FusionConfig {
        embed_method: args.embed_method,
        desc_weight: args.desc_weight,
        fusion_method: args.fusion_method,
    };
    let unit_cache = UnitEmbeddingCache::new(
        cache,
        unit_namespace(&backend.fingerprint(), &args.task, args.long_context, args.batch_size),
    );
    let engine = FusionEngine::new(&prepared, config)?.with_unit_cache(unit_cache);
    let outcome = engine.run(&FusionRequest {
        queries: &inputs.queries,
        query_ids: &inputs.query_ids,
        doc_ids: &corpus.doc_ids,
        excluded_ids: &inputs.excluded_ids,
        ground_truth: Some(&inputs.gold),
    })?;

    write_json_pretty(
        &output_dir.join("per_subq_hits.json"),
        &unit_hit_ratios(&outcome.per_unit_hits, &inputs.gold),
    )?;
    write_json_pretty(&output_dir.join("per_subq_docs.json"), &outcome.per_unit_docs)?;
    write_json_pretty(
        &output_dir.join("oracle_stats.json"),
        &build_oracle_stats(&outcome.per_unit_docs, &inputs.gold),
    )?;
    outputs.extend(
        ["per_subq_hits.json", "per_subq_docs.json", "oracle_stats.json"]
            .into_iter()
            .map(str::to_string),
    );

    info!(
        fused_hits = outcome.fused_hit_counts.values().sum::<usize>(),
        gold = inputs.gold.values().map(|gold| gold.len()).sum::<usize>(),
        "fusion diagnostics written"
    );
    Ok(outcome.fused)
}

/// Dense corpora go through the embedding cache; lexical corpora are indexed fresh.
fn prepare_corpus<'b>(
    args: &RetrieveArgs,
    backend: &'b Backend,
    cache: &EmbeddingCache,
    documents: &[String],
    doc_ids: &[String],
) -> Result<PreparedCorpus<'b>> {
    match backend {
        Backend::Dense(embedder) => {
            let namespace = document_namespace(
                &embedder.fingerprint(),
                &args.task,
                args.long_context,
                args.batch_size,
            );
            let vectors = load_or_embed_documents(
                embedder.as_ref(),
                documents,
                doc_ids,
                cache,
                DocumentEmbeddingPlan {
                    namespace: &namespace,
                    batch_size: args.batch_size,
                    flush_every: args.flush_every,
                },
            )?;
            PreparedCorpus::dense(embedder.as_ref(), vectors, documents.len())
        }
        Backend::Lexical(_) => backend.prepare(documents),
    }
}
