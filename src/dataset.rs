use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info};

use crate::model::{ExcludedIds, GoldSets, Qrels, RankedResult, deserialize_id, deserialize_id_list};
use crate::util::{ensure_directory, read_json, write_json_pretty};

/// Number of documents kept by `--debug` runs.
pub const DEBUG_DOCUMENT_LIMIT: usize = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct ExampleRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub query: String,
    #[serde(default, deserialize_with = "deserialize_id_list")]
    pub excluded_ids: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_id_list")]
    pub gold_ids: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_id_list")]
    pub gold_ids_long: Vec<String>,
}

impl ExampleRecord {
    pub fn gold(&self, long_context: bool) -> &[String] {
        if long_context {
            &self.gold_ids_long
        } else {
            &self.gold_ids
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub content: String,
}

pub fn load_examples(path: &Path) -> Result<Vec<ExampleRecord>> {
    let examples = read_json::<Vec<ExampleRecord>>(path)?;
    info!(path = %path.display(), examples = examples.len(), "loaded examples");
    Ok(examples)
}

pub fn load_documents(path: &Path) -> Result<Vec<DocumentRecord>> {
    let documents = read_json::<Vec<DocumentRecord>>(path)?;
    info!(path = %path.display(), documents = documents.len(), "loaded documents");
    Ok(documents)
}

/// Queries, exclusions and gold sets for one task, in example order.
#[derive(Debug, Clone, Default)]
pub struct TaskInputs {
    pub queries: Vec<String>,
    pub query_ids: Vec<String>,
    pub excluded_ids: ExcludedIds,
    pub gold: GoldSets,
}

impl TaskInputs {
    /// Fails when any example excludes one of its own gold documents.
    pub fn from_examples(examples: &[ExampleRecord], long_context: bool) -> Result<Self> {
        let mut inputs = Self {
            queries: Vec::with_capacity(examples.len()),
            query_ids: Vec::with_capacity(examples.len()),
            ..Self::default()
        };

        for example in examples {
            let gold = example
                .gold(long_context)
                .iter()
                .cloned()
                .collect::<HashSet<String>>();
            // Both gold lists are checked whatever the context length.
            let mut overlap = example
                .excluded_ids
                .iter()
                .filter(|doc_id| {
                    example.gold_ids.contains(*doc_id) || example.gold_ids_long.contains(*doc_id)
                })
                .cloned()
                .collect::<Vec<String>>();
            if !overlap.is_empty() {
                overlap.sort();
                overlap.dedup();
                bail!(
                    "example {} excludes its own gold documents: {}",
                    example.id,
                    overlap.join(", ")
                );
            }

            if inputs.excluded_ids.contains_key(&example.id) {
                bail!("duplicate example id {}", example.id);
            }
            inputs.queries.push(example.query.clone());
            inputs.query_ids.push(example.id.clone());
            inputs
                .excluded_ids
                .insert(example.id.clone(), example.excluded_ids.clone());
            inputs.gold.insert(example.id.clone(), gold);
        }

        Ok(inputs)
    }
}

/// Document texts and ids, positionally aligned.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub doc_ids: Vec<String>,
    pub documents: Vec<String>,
}

impl Corpus {
    pub fn from_records(records: Vec<DocumentRecord>) -> Self {
        let (doc_ids, documents) = records
            .into_iter()
            .map(|record| (record.id, record.content))
            .unzip();
        Self { doc_ids, documents }
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    pub fn truncate(&mut self, limit: usize) {
        self.doc_ids.truncate(limit);
        self.documents.truncate(limit);
    }
}

/// Every gold id graded 1, keyed by query id.
pub fn build_qrels(examples: &[ExampleRecord], long_context: bool) -> Qrels {
    examples
        .iter()
        .map(|example| {
            let judgments = example
                .gold(long_context)
                .iter()
                .map(|doc_id| (doc_id.clone(), 1))
                .collect::<HashMap<String, i64>>();
            (example.id.clone(), judgments)
        })
        .collect()
}

/// Checks stored rankings and judgments against every example's exclusions.
pub fn verify_exclusions(
    examples: &[ExampleRecord],
    scores: &RankedResult,
    qrels: &Qrels,
) -> Result<()> {
    for example in examples {
        let Some(ranking) = scores.get(&example.id) else {
            bail!("score file has no ranking for query {}", example.id);
        };
        let judgments = qrels.get(&example.id);
        for doc_id in &example.excluded_ids {
            if ranking.contains_key(doc_id) {
                bail!("excluded document {doc_id} was ranked for query {}", example.id);
            }
            if judgments.is_some_and(|judged| judged.contains_key(doc_id)) {
                bail!("excluded document {doc_id} is judged relevant for query {}", example.id);
            }
        }
    }
    debug!(examples = examples.len(), "exclusion checks passed");
    Ok(())
}

/// Writes the document-id order on first use and fails when a later run's
/// order drifts from it.
pub fn check_doc_id_manifest(
    cache_dir: &Path,
    task: &str,
    long_context: bool,
    doc_ids: &[String],
) -> Result<()> {
    let manifest_dir = cache_dir.join("doc_ids");
    ensure_directory(&manifest_dir)?;
    let manifest_path = manifest_dir.join(format!("{task}_{long_context}.json"));

    if !manifest_path.exists() {
        write_json_pretty(&manifest_path, &doc_ids)?;
        info!(
            path = %manifest_path.display(),
            documents = doc_ids.len(),
            "wrote document id manifest"
        );
        return Ok(());
    }

    let cached = read_json::<Vec<String>>(&manifest_path)?;
    if let Some((position, (cached_id, doc_id))) = cached
        .iter()
        .zip(doc_ids.iter())
        .enumerate()
        .find(|(_, (cached_id, doc_id))| cached_id != doc_id)
    {
        bail!(
            "document order drifted from {} at position {position}: \
             cached {cached_id}, found {doc_id}",
            manifest_path.display()
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstructionSet {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub document: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub instructions: InstructionSet,
    #[serde(default)]
    pub instructions_long: InstructionSet,
}

impl TaskConfig {
    /// `<config_dir>/<family>/<task>.json`, or empty instructions when the file is absent.
    pub fn load(config_dir: &Path, family: &str, task: &str) -> Result<Self> {
        let path = config_dir.join(family).join(format!("{task}.json"));
        if !path.exists() {
            debug!(path = %path.display(), "no task config, using empty instructions");
            return Ok(Self::default());
        }
        read_json::<Self>(&path).with_context(|| format!("invalid task config {}", path.display()))
    }

    pub fn instructions(&self, long_context: bool) -> &InstructionSet {
        if long_context {
            &self.instructions_long
        } else {
            &self.instructions
        }
    }
}

/// Prefixes every text with the instruction, `{task}` filled in.
pub fn apply_instruction(instruction: &str, task: &str, texts: &[String]) -> Vec<String> {
    if instruction.is_empty() {
        return texts.to_vec();
    }
    let prefix = instruction.replace("{task}", task);
    texts.iter().map(|text| format!("{prefix}{text}")).collect()
}
