//! SQL Generation Engine
//!
//! Orchestrates the full question-to-SQL pipeline: retrieve a similar worked
//! example, compose the prompt, call the generation backend, then push the
//! cleaned output through the syntax and execution gates. Failed attempts
//! feed the next prompt as error context, up to the attempt budget. The first
//! executable statement wins.

use crate::config::EngineConfig;
use crate::embedding::OllamaEmbedder;
use crate::error::{MedSqlError, Result};
use crate::example_index::{ExampleRetriever, ExampleSource, SimilarExample};
use crate::ollama::{GenerateOptions, GenerationBackend, OllamaClient};
use crate::prompt;
use crate::validator::{
    clean_generated_sql, validate_sql_syntax, ExecutionGate, SqlErrorKind, SqlValidator,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Pre-resolved medical concept, mapped upstream of this engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicalTermRef {
    pub term: String,
    pub concept_id: String,
}

/// A natural-language question plus its resolved concept codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub question: String,
    #[serde(default)]
    pub medical_terms: Vec<MedicalTermRef>,
}

/// One attempt as recorded by the retry loop.
#[derive(Debug, Clone)]
pub struct GenerationAttempt {
    pub iteration: u32,
    pub sql: String,
    pub executable: bool,
    pub error: Option<String>,
    pub error_kind: Option<SqlErrorKind>,
}

/// Final outcome of a generation request. `generated_sql` is the first
/// executable attempt, or the last attempt when none executed.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub question: String,
    pub generated_sql: String,
    pub is_executable: bool,
    pub error_message: Option<String>,
    pub attempts_count: u32,
    pub similar_example: Option<SimilarExample>,
}

/// Outcome of validating caller-supplied SQL outside the generation loop.
#[derive(Debug, Clone, Serialize)]
pub struct SqlValidationReport {
    pub sql: String,
    pub is_valid: bool,
    pub syntax_error: Option<String>,
    pub is_executable: bool,
    pub execution_error: Option<String>,
    pub execution_time: Option<f64>,
    pub row_count: Option<i64>,
}

/// Liveness snapshot of the generation backend.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub backend_reachable: bool,
    pub model_available: bool,
    pub model: String,
}

/// Question-to-SQL engine over injectable backend, gate and example source.
pub struct SqlGenerationEngine {
    config: EngineConfig,
    backend: Arc<dyn GenerationBackend>,
    gate: Arc<dyn ExecutionGate>,
    examples: Arc<dyn ExampleSource>,
}

impl SqlGenerationEngine {
    /// Wire the engine to a live Ollama server and the configured OMOP
    /// database.
    pub fn new(config: EngineConfig) -> Self {
        let backend = Arc::new(OllamaClient::new(config.ollama_base_url.clone()));
        let gate = Arc::new(SqlValidator::new(config.omop_db_path.clone()));
        let embedder = Arc::new(OllamaEmbedder::new(
            config.ollama_base_url.clone(),
            config.embedding_model.clone(),
        ));
        let examples = Arc::new(ExampleRetriever::new(
            embedder,
            config.embedding_model.clone(),
            config.dataset_path.clone(),
            config.index_dir.clone(),
        ));
        Self::with_components(config, backend, gate, examples)
    }

    /// Build the engine from explicit components.
    pub fn with_components(
        config: EngineConfig,
        backend: Arc<dyn GenerationBackend>,
        gate: Arc<dyn ExecutionGate>,
        examples: Arc<dyn ExampleSource>,
    ) -> Self {
        Self {
            config,
            backend,
            gate,
            examples,
        }
    }

    /// Generate executable SQL for the request, retrying with error feedback
    /// up to the attempt budget.
    ///
    /// Soft failures (bad SQL, engine rejections) are folded into the result;
    /// only environment problems surface as errors: a missing OMOP database,
    /// or an example index that cannot be built or loaded.
    pub async fn generate_sql(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        info!("Generating SQL for: {}", request.question);

        if !self.backend.is_available().await {
            warn!("Generation backend is not responding");
            return Ok(self.unattempted_result(
                request,
                "Generation service unavailable: backend is not responding".to_string(),
            ));
        }

        if !self.backend.model_available(&self.config.ollama_model).await {
            warn!("Model {} is not available", self.config.ollama_model);
            return Ok(self.unattempted_result(
                request,
                format!(
                    "Model {} is not available on the generation backend",
                    self.config.ollama_model
                ),
            ));
        }

        let best_example = self
            .examples
            .similar_examples(&request.question, self.config.rag_top_k)
            .await?
            .into_iter()
            .next();
        if let Some(example) = &best_example {
            info!(
                "Using similar example (score {:.3}): {}",
                example.score, example.question
            );
        }

        let options = GenerateOptions {
            max_tokens: self.config.max_tokens,
            timeout: self.per_attempt_timeout(),
            ..GenerateOptions::default()
        };

        let mut attempts: Vec<GenerationAttempt> = Vec::new();
        let mut current_sql: Option<String> = None;
        let mut error_context: Option<String> = None;

        for iteration in 1..=self.config.max_attempts {
            info!("Generation attempt {} of {}", iteration, self.config.max_attempts);

            let prompt_text = match current_sql.as_deref() {
                Some(previous_sql) if iteration > 1 => prompt::corrective_prompt(
                    &request.question,
                    &request.medical_terms,
                    previous_sql,
                    error_context.as_deref().unwrap_or("unknown error"),
                ),
                _ => prompt::initial_prompt(
                    &request.question,
                    &request.medical_terms,
                    best_example.as_ref(),
                ),
            };

            let response = self
                .backend
                .generate(&self.config.ollama_model, &prompt_text, &options)
                .await;

            let raw = match response {
                Some(text) if !text.trim().is_empty() => text,
                _ => {
                    warn!("No response from the generation model on attempt {}", iteration);
                    attempts.push(GenerationAttempt {
                        iteration,
                        sql: String::new(),
                        executable: false,
                        error: Some("No response from the generation model".to_string()),
                        error_kind: Some(SqlErrorKind::Generation),
                    });
                    break;
                }
            };

            let sql = clean_generated_sql(&raw);
            current_sql = Some(sql.clone());

            if let Some(message) = validate_sql_syntax(&sql) {
                warn!("Syntax gate rejected attempt {}: {}", iteration, message);
                attempts.push(GenerationAttempt {
                    iteration,
                    sql,
                    executable: false,
                    error: Some(format!("Syntax error: {}", message)),
                    error_kind: Some(SqlErrorKind::Syntax),
                });
                error_context = Some(message);
                continue;
            }

            let report = self.gate.test_execution(&sql);
            attempts.push(GenerationAttempt {
                iteration,
                sql,
                executable: report.executable,
                error: report.error.clone(),
                error_kind: report.error_kind.clone(),
            });

            if report.executable {
                info!("✅ Executable SQL on attempt {}", iteration);
                break;
            }

            // A missing database fails every attempt the same way; this is an
            // environment problem, not a generation problem.
            if report.error_kind == Some(SqlErrorKind::DatabaseNotFound) {
                return Err(MedSqlError::DatabaseNotFound(
                    report
                        .error
                        .unwrap_or_else(|| "OMOP database not found".to_string()),
                ));
            }

            warn!(
                "Execution gate rejected attempt {}: {}",
                iteration,
                report.error.as_deref().unwrap_or("unknown error")
            );
            error_context = report.error;
        }

        let final_attempt = attempts.iter().find(|a| a.executable).or_else(|| attempts.last());

        Ok(match final_attempt {
            Some(attempt) => GenerationResult {
                question: request.question.clone(),
                generated_sql: attempt.sql.clone(),
                is_executable: attempt.executable,
                error_message: attempt.error.clone(),
                attempts_count: attempts.len() as u32,
                similar_example: best_example,
            },
            None => GenerationResult {
                question: request.question.clone(),
                generated_sql: String::new(),
                is_executable: false,
                error_message: Some("No generation attempts were made".to_string()),
                attempts_count: 0,
                similar_example: best_example,
            },
        })
    }

    /// Clean and validate caller-supplied SQL through both gates. The
    /// execution gate only runs when the syntax gate passes; a missing
    /// database is reported in the result rather than raised.
    pub fn validate_sql(&self, sql: &str) -> SqlValidationReport {
        let cleaned = clean_generated_sql(sql);

        if let Some(message) = validate_sql_syntax(&cleaned) {
            return SqlValidationReport {
                sql: cleaned,
                is_valid: false,
                syntax_error: Some(message),
                is_executable: false,
                execution_error: None,
                execution_time: None,
                row_count: None,
            };
        }

        let report = self.gate.test_execution(&cleaned);
        SqlValidationReport {
            sql: cleaned,
            is_valid: true,
            syntax_error: None,
            is_executable: report.executable,
            execution_error: report.error,
            execution_time: report.execution_time,
            row_count: report.row_count,
        }
    }

    /// Reachability of the backend and availability of the configured model.
    pub async fn status(&self) -> ServiceStatus {
        let backend_reachable = self.backend.is_available().await;
        let model_available = if backend_reachable {
            self.backend.model_available(&self.config.ollama_model).await
        } else {
            false
        };
        ServiceStatus {
            backend_reachable,
            model_available,
            model: self.config.ollama_model.clone(),
        }
    }

    /// The total generation budget split evenly across attempts, at least one
    /// second each.
    fn per_attempt_timeout(&self) -> Duration {
        let attempts = u64::from(self.config.max_attempts.max(1));
        Duration::from_secs((self.config.generation_timeout_secs / attempts).max(1))
    }

    fn unattempted_result(&self, request: &GenerationRequest, message: String) -> GenerationResult {
        GenerationResult {
            question: request.question.clone(),
            generated_sql: String::new(),
            is_executable: false,
            error_message: Some(message),
            attempts_count: 0,
            similar_example: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserializes_without_terms() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{"question": "How many patients have diabetes?"}"#).unwrap();
        assert_eq!(request.question, "How many patients have diabetes?");
        assert!(request.medical_terms.is_empty());
    }

    #[test]
    fn test_request_deserializes_terms() {
        let request: GenerationRequest = serde_json::from_str(
            r#"{"question": "q", "medical_terms": [{"term": "diabetes", "concept_id": "201826"}]}"#,
        )
        .unwrap();
        assert_eq!(
            request.medical_terms,
            vec![MedicalTermRef {
                term: "diabetes".to_string(),
                concept_id: "201826".to_string(),
            }]
        );
    }

    #[test]
    fn test_result_serializes_expected_fields() {
        let result = GenerationResult {
            question: "q".to_string(),
            generated_sql: "SELECT 1 FROM person;".to_string(),
            is_executable: true,
            error_message: None,
            attempts_count: 1,
            similar_example: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["generated_sql"], "SELECT 1 FROM person;");
        assert_eq!(value["is_executable"], true);
        assert_eq!(value["attempts_count"], 1);
    }
}
