use std::collections::HashMap;

use anyhow::Result;
use bm25::{DefaultTokenizer, Language, Tokenizer};

use super::{LexicalIndex, LexicalRanker};

pub const BM25_BACKEND_ID: &str = "bm25";

thread_local! {
    static ENGLISH_ANALYZER: DefaultTokenizer = DefaultTokenizer::new(Language::English);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 0.9, b: 0.4 }
    }
}

/// Lucene-flavoured BM25; queries are weighted with the same model as documents.
#[derive(Debug, Clone, Default)]
pub struct Bm25Ranker {
    params: Bm25Params,
}

impl Bm25Ranker {
    pub fn new(params: Bm25Params) -> Self {
        Self { params }
    }
}

impl LexicalRanker for Bm25Ranker {
    fn backend_id(&self) -> &str {
        BM25_BACKEND_ID
    }

    fn index(&self, documents: &[String]) -> Result<Box<dyn LexicalIndex>> {
        Ok(Box::new(Bm25Index::build(documents, self.params)))
    }
}

struct Bm25Index {
    params: Bm25Params,
    vocabulary: HashMap<String, usize>,
    document_frequency: Vec<usize>,
    postings: Vec<Vec<(usize, f64)>>,
    document_count: usize,
    average_length: f64,
}

impl Bm25Index {
    fn build(documents: &[String], params: Bm25Params) -> Self {
        let mut vocabulary = HashMap::<String, usize>::new();
        let mut document_frequency = Vec::<usize>::new();
        let mut bags = Vec::<(Vec<(usize, usize)>, usize)>::with_capacity(documents.len());

        for document in documents {
            let tokens = analyze(document);
            let length = tokens.len();
            let mut counts = HashMap::<usize, usize>::new();
            for token in tokens {
                let next_id = vocabulary.len();
                let term_id = *vocabulary.entry(token).or_insert(next_id);
                if term_id == document_frequency.len() {
                    document_frequency.push(0);
                }
                *counts.entry(term_id).or_insert(0) += 1;
            }
            for term_id in counts.keys() {
                document_frequency[*term_id] += 1;
            }
            let mut bag = counts.into_iter().collect::<Vec<(usize, usize)>>();
            bag.sort_unstable();
            bags.push((bag, length));
        }

        let total_length = bags.iter().map(|(_, length)| *length).sum::<usize>();
        let average_length = if bags.is_empty() {
            0.0
        } else {
            total_length as f64 / bags.len() as f64
        };

        let mut index = Self {
            params,
            vocabulary,
            document_frequency,
            postings: Vec::new(),
            document_count: documents.len(),
            average_length,
        };

        let mut postings = vec![Vec::<(usize, f64)>::new(); index.document_frequency.len()];
        for (doc_index, (bag, length)) in bags.iter().enumerate() {
            for (term_id, frequency) in bag {
                let weight = index.term_weight(*term_id, *frequency, *length);
                postings[*term_id].push((doc_index, weight));
            }
        }
        index.postings = postings;
        index
    }

    fn idf(&self, term_id: usize) -> f64 {
        let n = self.document_count as f64;
        let df = self.document_frequency[term_id] as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn term_weight(&self, term_id: usize, frequency: usize, length: usize) -> f64 {
        let Bm25Params { k1, b } = self.params;
        let tf = frequency as f64;
        let length_ratio = if self.average_length > 0.0 {
            length as f64 / self.average_length
        } else {
            1.0
        };
        self.idf(term_id) * tf / (tf + k1 * (1.0 - b + b * length_ratio))
    }
}

impl LexicalIndex for Bm25Index {
    fn document_count(&self) -> usize {
        self.document_count
    }

    fn score(&self, query: &str) -> Result<Vec<f64>> {
        let tokens = analyze(query);
        let length = tokens.len();
        let mut counts = HashMap::<usize, usize>::new();
        for token in &tokens {
            if let Some(term_id) = self.vocabulary.get(token) {
                *counts.entry(*term_id).or_insert(0) += 1;
            }
        }
        let mut bag = counts.into_iter().collect::<Vec<(usize, usize)>>();
        bag.sort_unstable();

        let mut scores = vec![0.0_f64; self.document_count];
        for (term_id, frequency) in bag {
            let query_weight = self.term_weight(term_id, frequency, length);
            for (doc_index, doc_weight) in &self.postings[term_id] {
                scores[*doc_index] += query_weight * doc_weight;
            }
        }
        Ok(scores)
    }
}

/// Normalised, stopword-free, stemmed English terms.
fn analyze(text: &str) -> Vec<String> {
    ENGLISH_ANALYZER.with(|analyzer| analyzer.tokenize(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<String> {
        vec![
            "Photosynthesis converts light into chemical energy in plants".to_string(),
            "The stock market reacts to interest rate changes".to_string(),
            "Chlorophyll absorbs light for photosynthesis".to_string(),
            String::new(),
        ]
    }

    #[test]
    fn analyzer_lowercases_stems_and_drops_stopwords() {
        let terms = analyze("The Cell-wall, and THE membrane!");
        assert!(terms.contains(&"cell".to_string()), "unexpected terms {terms:?}");
        assert!(terms.contains(&"wall".to_string()), "unexpected terms {terms:?}");
        assert!(!terms.iter().any(|term| term == "the" || term == "and"));
        assert_eq!(analyze("running"), analyze("runs"));
    }

    #[test]
    fn inflected_query_forms_match() {
        let documents = vec!["The runner runs daily".to_string(), "stock prices".to_string()];
        let index = Bm25Ranker::default().index(&documents).expect("index");
        let scores = index.score("running").expect("scores");
        assert!(scores[0] > 0.0, "unexpected scores {scores:?}");
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn matching_documents_outscore_unrelated_ones() {
        let index = Bm25Ranker::default().index(&corpus()).expect("index");
        let scores = index.score("photosynthesis light").expect("scores");

        assert_eq!(scores.len(), 4);
        assert!(scores[0] > 0.0);
        assert!(scores[2] > 0.0);
        assert_eq!(scores[1], 0.0);
        assert_eq!(scores[3], 0.0);
        // Shorter document with the same two matching terms wins under length normalisation.
        assert!(scores[2] > scores[0]);
    }

    #[test]
    fn unknown_terms_score_zero_everywhere() {
        let index = Bm25Ranker::default().index(&corpus()).expect("index");
        let scores = index.score("quantum chromodynamics").expect("scores");
        assert!(scores.iter().all(|score| *score == 0.0));
    }

    #[test]
    fn empty_corpus_yields_empty_scores() {
        let index = Bm25Ranker::default().index(&[]).expect("index");
        assert_eq!(index.document_count(), 0);
        assert!(index.score("anything").expect("scores").is_empty());
    }
}
