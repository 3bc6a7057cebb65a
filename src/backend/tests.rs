use super::*;

fn texts(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[test]
fn hash_embeddings_are_deterministic_and_normalised() {
    let embedder = HashEmbedder::new(64).expect("embedder");
    let first = embedder
        .embed(&texts(&["gene expression in yeast"]))
        .expect("embed");
    let second = embedder
        .embed(&texts(&["Gene expression, in yeast!"]))
        .expect("embed");

    assert_eq!(first, second);
    let norm = first[0]
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>()
        .sqrt();
    assert!((norm - 1.0).abs() < 1e-5, "unexpected norm {norm}");
}

#[test]
fn empty_text_embeds_to_zero_vector_with_zero_similarity() {
    let embedder = HashEmbedder::new(16).expect("embedder");
    let vectors = embedder.embed(&texts(&["", "plate tectonics"])).expect("embed");
    assert!(vectors[0].iter().all(|value| *value == 0.0));
    assert_eq!(cosine_similarity(&vectors[0], &vectors[1]), 0.0);
}

#[test]
fn cosine_similarity_ignores_vector_scale() {
    let left = vec![1.0_f32, 2.0, 3.0];
    let right = left.iter().map(|value| value * 4.0).collect::<Vec<f32>>();
    assert!((cosine_similarity(&left, &right) - 1.0).abs() < 1e-9);
    assert_eq!(cosine_similarity(&left, &[1.0, 2.0]), 0.0);
}

#[test]
fn embedding_blob_round_trips_and_rejects_wrong_dimensions() {
    let values = vec![0.25_f32, -1.5, 3.0];
    let blob = encode_embedding_blob(&values);
    assert_eq!(decode_embedding_blob(&blob, 3), Some(values));
    assert_eq!(decode_embedding_blob(&blob, 4), None);
    assert_eq!(decode_embedding_blob(&blob, 0), None);
}

#[test]
fn dense_score_all_ranks_the_matching_document_first() {
    let backend = Backend::Dense(Box::new(HashEmbedder::default()));
    let documents = texts(&[
        "volcanic eruptions release ash and lava",
        "mitochondria produce cellular energy",
    ]);
    let matrix = backend
        .score_all(&texts(&["how do mitochondria produce energy"]), &documents)
        .expect("scores");

    assert_eq!(matrix.row_count(), 1);
    let row = &matrix.rows()[0];
    assert_eq!(row.len(), 2);
    assert!(row[1] > row[0]);
    assert!(row.iter().all(|score| score.is_finite() && score.abs() <= 1.0 + 1e-9));
}

#[test]
fn lexical_score_all_uses_the_document_index() {
    let backend = Backend::Lexical(Box::new(Bm25Ranker::default()));
    assert!(!backend.is_dense());
    assert_eq!(backend.backend_id(), "bm25");

    let documents = texts(&["binary search tree insertion", "graph coloring heuristics"]);
    let matrix = backend
        .score_all(&texts(&["graph coloring", "tree"]), &documents)
        .expect("scores");

    assert_eq!(matrix.row_count(), 2);
    assert!(matrix.rows()[0][1] > matrix.rows()[0][0]);
    assert!(matrix.rows()[1][0] > matrix.rows()[1][1]);
}

struct ShortEmbedder;

impl Embedder for ShortEmbedder {
    fn backend_id(&self) -> &str {
        "short"
    }

    fn dimensions(&self) -> usize {
        1
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().skip(1).map(|_| vec![1.0]).collect())
    }
}

#[test]
fn embedders_returning_too_few_vectors_are_rejected() {
    let backend = Backend::Dense(Box::new(ShortEmbedder));
    let error = match backend.prepare(&texts(&["a", "b"])) {
        Ok(_) => panic!("a short embedding batch must fail"),
        Err(error) => error,
    };
    assert!(
        error.to_string().contains("1 document embeddings for 2 documents"),
        "unexpected error: {error}"
    );
}

#[test]
fn hash_embedder_rejects_too_few_dimensions() {
    for dimensions in [0, MIN_EMBEDDING_DIM - 1] {
        let error = HashEmbedder::new(dimensions).expect_err("tiny dimensions must fail");
        assert!(error.to_string().contains("at least 8 dimensions"), "unexpected error: {error}");
    }
    assert_eq!(HashEmbedder::new(MIN_EMBEDDING_DIM).expect("embedder").dimensions(), 8);
}

#[test]
fn fingerprint_separates_vector_spaces() {
    let narrow = Backend::Dense(Box::new(HashEmbedder::new(128).expect("embedder")));
    let wide = Backend::Dense(Box::new(HashEmbedder::new(384).expect("embedder")));
    assert_eq!(narrow.fingerprint(), "hash-dense_128");
    assert_ne!(narrow.fingerprint(), wide.fingerprint());
    assert_eq!(Backend::Lexical(Box::new(Bm25Ranker::default())).fingerprint(), "bm25");
}

#[test]
fn mismatched_vector_lengths_are_rejected() {
    let embedder = HashEmbedder::new(16).expect("embedder");
    let error = match PreparedCorpus::dense(&embedder, vec![vec![1.0; 8]], 1) {
        Ok(_) => panic!("stale document vectors must fail"),
        Err(error) => error,
    };
    assert!(
        error.to_string().contains("document embedding has 8 dimensions"),
        "unexpected error: {error}"
    );

    let documents = embedder.embed(&texts(&["river delta"])).expect("embed");
    let corpus = PreparedCorpus::dense(&embedder, documents, 1).expect("corpus");
    let error = corpus
        .score_vectors(&[vec![1.0; 32]])
        .expect_err("query vectors of another space must fail");
    assert!(
        error.to_string().contains("query embedding has 32 dimensions"),
        "unexpected error: {error}"
    );
    assert_eq!(corpus.score_vectors(&[vec![0.5; 16]]).expect("scores").row_count(), 1);
}
