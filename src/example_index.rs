//! Example Index
//!
//! Nearest-neighbor retrieval over embedded question exemplars paired with
//! known-good OMOP SQL. Built offline from a CSV dataset, persisted as two
//! positionally aligned artifact files, and queried read-only at generation
//! time.

use crate::embedding::{inner_product, normalize_l2, Embedding, TextEmbedder};
use crate::error::{MedSqlError, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Artifact file holding the normalized vectors.
const VECTORS_FILE: &str = "vectors.json";
/// Artifact file holding the aligned example metadata.
const METADATA_FILE: &str = "metadata.json";

/// Metadata for one indexed example, positionally aligned with its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleMeta {
    pub row_id: Option<i64>,
    pub canonical_question: String,
    pub sql: String,
}

/// A retrieved exemplar, as carried into prompts and results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarExample {
    pub question: String,
    pub sql: String,
    pub score: f32,
}

/// One retrieval hit: similarity score plus the matching example.
#[derive(Debug, Clone)]
pub struct ScoredExample {
    pub score: f32,
    pub example: ExampleMeta,
}

#[derive(Serialize, Deserialize)]
struct VectorArtifact {
    dim: usize,
    embedding_model: String,
    built_at: String,
    vectors: Vec<Embedding>,
}

/// Provider of similar question/SQL examples for a given question.
#[async_trait::async_trait]
pub trait ExampleSource: Send + Sync {
    async fn similar_examples(&self, question: &str, k: usize) -> Result<Vec<SimilarExample>>;
}

/// Inner-product index over L2-normalized question embeddings.
///
/// Immutable once constructed; rebuilding is an explicit offline step.
pub struct ExampleIndex {
    vectors: Vec<Embedding>,
    metadata: Vec<ExampleMeta>,
    dim: usize,
    embedder: Arc<dyn TextEmbedder>,
}

impl std::fmt::Debug for ExampleIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExampleIndex")
            .field("dim", &self.dim)
            .field("len", &self.vectors.len())
            .finish_non_exhaustive()
    }
}

impl ExampleIndex {
    /// Build the index from a CSV dataset and persist its two artifact files.
    ///
    /// Question columns are auto-detected as those whose upper-cased name
    /// starts with `QUESTION` unless named explicitly. The SQL column is the
    /// one whose upper-cased name contains both `QUERY` and `RUNNABLE`.
    pub async fn build(
        embedder: Arc<dyn TextEmbedder>,
        embedding_model: &str,
        dataset_path: &Path,
        index_dir: &Path,
        question_columns: Option<&[String]>,
    ) -> Result<Self> {
        if !dataset_path.exists() {
            return Err(MedSqlError::Config(format!(
                "Dataset not found: {}",
                dataset_path.display()
            )));
        }

        info!("Loading dataset from {}", dataset_path.display());
        let mut reader = csv::Reader::from_path(dataset_path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();

        let question_cols: Vec<String> = match question_columns {
            Some(cols) => {
                for col in cols {
                    if !headers.iter().any(|h| h == col) {
                        return Err(MedSqlError::Config(format!(
                            "Question column '{}' not found in dataset",
                            col
                        )));
                    }
                }
                cols.iter().cloned().unique().collect()
            }
            None => {
                let detected: Vec<String> = headers
                    .iter()
                    .filter(|h| h.to_uppercase().starts_with("QUESTION"))
                    .cloned()
                    .collect();
                if detected.is_empty() {
                    return Err(MedSqlError::Config(
                        "No QUESTION* columns found in dataset; pass question columns explicitly"
                            .to_string(),
                    ));
                }
                detected
            }
        };

        let sql_candidates: Vec<&String> = headers
            .iter()
            .filter(|h| {
                let upper = h.to_uppercase();
                upper.contains("QUERY") && upper.contains("RUNNABLE")
            })
            .collect();
        let sql_col = match sql_candidates.as_slice() {
            [] => {
                return Err(MedSqlError::Config(
                    "No runnable query column found in dataset".to_string(),
                ))
            }
            [one] => (*one).clone(),
            many => {
                return Err(MedSqlError::Config(format!(
                    "Ambiguous runnable query columns: {}",
                    many.iter().join(", ")
                )))
            }
        };

        let question_idx: Vec<usize> = question_cols
            .iter()
            .filter_map(|c| headers.iter().position(|h| h == c))
            .collect();
        let sql_idx = headers
            .iter()
            .position(|h| *h == sql_col)
            .ok_or_else(|| MedSqlError::Config(format!("Column '{}' vanished from headers", sql_col)))?;
        let id_idx = headers.iter().position(|h| h == "ID");

        let mut questions: Vec<String> = Vec::new();
        let mut metadata: Vec<ExampleMeta> = Vec::new();

        for record in reader.records() {
            let record = record?;
            let sql = match record.get(sql_idx).map(str::trim) {
                Some(s) if !s.is_empty() => s.to_string(),
                _ => continue,
            };
            let row_id = id_idx
                .and_then(|i| record.get(i))
                .and_then(|s| s.trim().parse::<i64>().ok());

            let variants: Vec<String> = question_idx
                .iter()
                .filter_map(|&i| record.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            let canonical = match variants.first() {
                Some(first) => first.clone(),
                None => continue,
            };

            for variant in variants {
                questions.push(variant);
                metadata.push(ExampleMeta {
                    row_id,
                    canonical_question: canonical.clone(),
                    sql: sql.clone(),
                });
            }
        }

        if questions.is_empty() {
            return Err(MedSqlError::Config(
                "Dataset produced no question examples".to_string(),
            ));
        }

        info!("Total question variants: {}", questions.len());
        info!("Computing embeddings...");
        let mut vectors = embedder.embed_batch(&questions).await?;
        let dim = vectors.first().map(|v| v.len()).unwrap_or(0);
        if dim == 0 {
            return Err(MedSqlError::Embedding("Embedder returned empty vectors".to_string()));
        }
        for vector in vectors.iter_mut() {
            if vector.len() != dim {
                return Err(MedSqlError::Embedding(format!(
                    "Inconsistent embedding dimensions: {} vs {}",
                    vector.len(),
                    dim
                )));
            }
            normalize_l2(vector);
        }

        let index = Self {
            vectors,
            metadata,
            dim,
            embedder,
        };
        index.save(embedding_model, index_dir)?;
        info!("✅ Example index built: {} vectors ({} dims)", index.len(), dim);
        Ok(index)
    }

    /// Load a previously built index from its artifact files.
    pub fn load(
        embedder: Arc<dyn TextEmbedder>,
        embedding_model: &str,
        index_dir: &Path,
    ) -> Result<Self> {
        let vectors_path = index_dir.join(VECTORS_FILE);
        let metadata_path = index_dir.join(METADATA_FILE);
        for path in [&vectors_path, &metadata_path] {
            if !path.exists() {
                return Err(MedSqlError::IndexNotFound(format!(
                    "{} (run the index build first)",
                    path.display()
                )));
            }
        }

        let artifact: VectorArtifact = serde_json::from_str(&std::fs::read_to_string(&vectors_path)?)?;
        let metadata: Vec<ExampleMeta> = serde_json::from_str(&std::fs::read_to_string(&metadata_path)?)?;

        if artifact.vectors.len() != metadata.len() {
            return Err(MedSqlError::Config(format!(
                "Index artifacts disagree: {} vectors vs {} metadata entries",
                artifact.vectors.len(),
                metadata.len()
            )));
        }
        if artifact.embedding_model != embedding_model {
            warn!(
                "Index was built with embedding model '{}' but the engine uses '{}'",
                artifact.embedding_model, embedding_model
            );
        }

        info!("Example index loaded: {} vectors", artifact.vectors.len());
        Ok(Self {
            vectors: artifact.vectors,
            metadata,
            dim: artifact.dim,
            embedder,
        })
    }

    fn save(&self, embedding_model: &str, index_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(index_dir)?;
        let artifact = VectorArtifact {
            dim: self.dim,
            embedding_model: embedding_model.to_string(),
            built_at: chrono::Utc::now().to_rfc3339(),
            vectors: self.vectors.clone(),
        };
        std::fs::write(index_dir.join(VECTORS_FILE), serde_json::to_string(&artifact)?)?;
        std::fs::write(
            index_dir.join(METADATA_FILE),
            serde_json::to_string_pretty(&self.metadata)?,
        )?;
        Ok(())
    }

    /// Top-k inner-product search, scores descending in [-1, 1].
    ///
    /// Returns fewer than k hits when the index holds fewer vectors; hits
    /// whose position has no metadata entry are dropped.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredExample>> {
        if self.vectors.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut embedded = self.embedder.embed_batch(&[text.to_string()]).await?;
        let mut query_vector = embedded
            .pop()
            .ok_or_else(|| MedSqlError::Embedding("Embedder returned no vector for the query".to_string()))?;
        if query_vector.len() != self.dim {
            return Err(MedSqlError::Embedding(format!(
                "Query embedding dimension {} doesn't match index dimension {}",
                query_vector.len(),
                self.dim
            )));
        }
        normalize_l2(&mut query_vector);

        let hits = self
            .vectors
            .iter()
            .enumerate()
            .map(|(position, vector)| (inner_product(&query_vector, vector), position))
            .sorted_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal))
            .take(k)
            .filter_map(|(score, position)| {
                self.metadata.get(position).map(|meta| ScoredExample {
                    score,
                    example: meta.clone(),
                })
            })
            .collect();

        Ok(hits)
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Metadata entries, in vector order.
    pub fn metadata(&self) -> &[ExampleMeta] {
        &self.metadata
    }
}

/// Lazily initialized retriever facade over [`ExampleIndex`].
///
/// The first caller loads the persisted index, building it from the dataset
/// when no artifacts exist; concurrent callers wait on the same
/// initialization instead of duplicating it.
pub struct ExampleRetriever {
    embedder: Arc<dyn TextEmbedder>,
    embedding_model: String,
    dataset_path: PathBuf,
    index_dir: PathBuf,
    index: OnceCell<ExampleIndex>,
}

impl ExampleRetriever {
    pub fn new(
        embedder: Arc<dyn TextEmbedder>,
        embedding_model: impl Into<String>,
        dataset_path: PathBuf,
        index_dir: PathBuf,
    ) -> Self {
        Self {
            embedder,
            embedding_model: embedding_model.into(),
            dataset_path,
            index_dir,
            index: OnceCell::new(),
        }
    }

    /// Load-or-build the index exactly once for the process lifetime.
    pub async fn ensure_ready(&self) -> Result<&ExampleIndex> {
        self.index
            .get_or_try_init(|| async {
                match ExampleIndex::load(
                    Arc::clone(&self.embedder),
                    &self.embedding_model,
                    &self.index_dir,
                ) {
                    Ok(index) => Ok(index),
                    Err(MedSqlError::IndexNotFound(_)) => {
                        info!(
                            "Example index not found, building from {}",
                            self.dataset_path.display()
                        );
                        ExampleIndex::build(
                            Arc::clone(&self.embedder),
                            &self.embedding_model,
                            &self.dataset_path,
                            &self.index_dir,
                            None,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }
}

#[async_trait::async_trait]
impl ExampleSource for ExampleRetriever {
    /// Best-scoring examples for the question; query-time failures degrade
    /// to an empty list rather than failing the request.
    async fn similar_examples(&self, question: &str, k: usize) -> Result<Vec<SimilarExample>> {
        let index = self.ensure_ready().await?;
        match index.query(question, k).await {
            Ok(hits) => Ok(hits
                .into_iter()
                .map(|hit| SimilarExample {
                    question: hit.example.canonical_question,
                    sql: hit.example.sql,
                    score: hit.score,
                })
                .collect()),
            Err(e) => {
                warn!("Example retrieval failed: {}", e);
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    struct StubEmbedder;

    #[async_trait::async_trait]
    impl TextEmbedder for StubEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            Ok(texts.iter().map(|t| stub_vector(t)).collect())
        }
    }

    fn stub_vector(text: &str) -> Embedding {
        let mut v = vec![0.0f32; 8];
        for (i, byte) in text.bytes().enumerate() {
            v[(byte as usize + i) % 8] += 1.0;
        }
        v
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("medsql_index_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_dataset(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("dataset.csv");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const DATASET: &str = "\
ID,QUESTION,QUESTION_PARAPHRASE,QUERY_RUNNABLE_SQLITE
1,How many patients have diabetes?,Count of diabetic patients,SELECT COUNT(*) FROM person;
2,List female patients,Which patients are female,SELECT person_id FROM person WHERE gender_concept_id = 8532;
";

    #[tokio::test]
    async fn test_build_detects_question_columns() {
        let dir = temp_dir("detect");
        let dataset = write_dataset(&dir, DATASET);
        let index = ExampleIndex::build(Arc::new(StubEmbedder), "stub", &dataset, &dir.join("idx"), None)
            .await
            .unwrap();
        // Two rows, two non-empty variants each
        assert_eq!(index.len(), 4);
        assert_eq!(index.metadata().len(), 4);
        assert_eq!(index.metadata()[0].canonical_question, "How many patients have diabetes?");
        assert_eq!(index.metadata()[1].canonical_question, "How many patients have diabetes?");
        assert_eq!(index.metadata()[0].row_id, Some(1));
    }

    #[tokio::test]
    async fn test_build_rejects_missing_question_columns() {
        let dir = temp_dir("noq");
        let dataset = write_dataset(&dir, "ID,PROMPT,QUERY_RUNNABLE\n1,hello,SELECT 1;\n");
        let err = ExampleIndex::build(Arc::new(StubEmbedder), "stub", &dataset, &dir.join("idx"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MedSqlError::Config(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_unknown_named_column() {
        let dir = temp_dir("named");
        let dataset = write_dataset(&dir, DATASET);
        let cols = vec!["QUESTION_MISSING".to_string()];
        let err = ExampleIndex::build(
            Arc::new(StubEmbedder),
            "stub",
            &dataset,
            &dir.join("idx"),
            Some(&cols),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MedSqlError::Config(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_missing_runnable_column() {
        let dir = temp_dir("nosql");
        let dataset = write_dataset(&dir, "ID,QUESTION,SQL\n1,how many,SELECT 1;\n");
        let err = ExampleIndex::build(Arc::new(StubEmbedder), "stub", &dataset, &dir.join("idx"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MedSqlError::Config(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_ambiguous_runnable_columns() {
        let dir = temp_dir("ambig");
        let dataset = write_dataset(
            &dir,
            "ID,QUESTION,QUERY_RUNNABLE_A,QUERY_RUNNABLE_B\n1,how many,SELECT 1;,SELECT 2;\n",
        );
        let err = ExampleIndex::build(Arc::new(StubEmbedder), "stub", &dataset, &dir.join("idx"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MedSqlError::Config(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_missing_dataset() {
        let dir = temp_dir("nodata");
        let err = ExampleIndex::build(
            Arc::new(StubEmbedder),
            "stub",
            &dir.join("absent.csv"),
            &dir.join("idx"),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MedSqlError::Config(_)));
    }

    #[tokio::test]
    async fn test_query_returns_best_match_first() {
        let dir = temp_dir("query");
        let dataset = write_dataset(&dir, DATASET);
        let index = ExampleIndex::build(Arc::new(StubEmbedder), "stub", &dataset, &dir.join("idx"), None)
            .await
            .unwrap();

        let hits = index.query("How many patients have diabetes?", 3).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits.len() <= 3);
        assert_eq!(hits[0].example.sql, "SELECT COUNT(*) FROM person;");
        assert!(hits[0].score > 0.999);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for hit in &hits {
            assert!(hit.score <= 1.0001 && hit.score >= -1.0001);
        }

        // Asking for more than the index holds returns everything
        let all = index.query("How many patients have diabetes?", 10).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_query_k_zero_is_empty() {
        let dir = temp_dir("kzero");
        let dataset = write_dataset(&dir, DATASET);
        let index = ExampleIndex::build(Arc::new(StubEmbedder), "stub", &dataset, &dir.join("idx"), None)
            .await
            .unwrap();
        let hits = index.query("anything", 0).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_artifacts() {
        let dir = temp_dir("load_missing");
        let err = ExampleIndex::load(Arc::new(StubEmbedder), "stub", &dir.join("idx")).unwrap_err();
        assert!(matches!(err, MedSqlError::IndexNotFound(_)));
    }
}
