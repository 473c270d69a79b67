//! Engine Configuration
//!
//! Environment-driven settings with defaults suitable for a local Ollama
//! instance and an on-disk OMOP SQLite database.

use crate::error::{MedSqlError, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Runtime configuration for the SQL generation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the Ollama-compatible backend
    pub ollama_base_url: String,
    /// Generation model name
    pub ollama_model: String,
    /// Embedding model name
    pub embedding_model: String,
    /// Total time budget for one generation request, in seconds
    pub generation_timeout_secs: u64,
    /// Token cap passed to the backend per generate call
    pub max_tokens: usize,
    /// Retry budget for the generation loop
    pub max_attempts: u32,
    /// How many similar examples to retrieve per question
    pub rag_top_k: usize,
    /// Question/SQL exemplar dataset (CSV)
    pub dataset_path: PathBuf,
    /// Target OMOP SQLite database used by the execution gate
    pub omop_db_path: PathBuf,
    /// Directory holding the persisted index artifacts
    pub index_dir: PathBuf,
}

impl EngineConfig {
    /// Build the configuration from environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let base = Self::default();
        Ok(Self {
            ollama_base_url: env_or("OLLAMA_BASE_URL", &base.ollama_base_url),
            ollama_model: env_or("OLLAMA_MODEL", &base.ollama_model),
            embedding_model: env_or("EMBEDDING_MODEL", &base.embedding_model),
            generation_timeout_secs: env_parse("SQL_GENERATION_TIMEOUT", base.generation_timeout_secs)?,
            max_tokens: env_parse("SQL_GENERATION_MAX_TOKENS", base.max_tokens)?,
            max_attempts: env_parse("MAX_SQL_ATTEMPTS", base.max_attempts)?,
            rag_top_k: env_parse("RAG_TOP_K", base.rag_top_k)?,
            dataset_path: PathBuf::from(env_or("DATASET_PATH", "data/question_sql_dataset.csv")),
            omop_db_path: PathBuf::from(env_or("OMOP_DB_PATH", "data/omop_cdm.sqlite")),
            index_dir: PathBuf::from(env_or("RAG_INDEX_DIR", "rag_index")),
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_model: "deepseek-coder-v2:16b-lite-instruct-q4_K_M".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            generation_timeout_secs: 180,
            max_tokens: 700,
            max_attempts: 3,
            rag_top_k: 1,
            dataset_path: PathBuf::from("data/question_sql_dataset.csv"),
            omop_db_path: PathBuf::from("data/omop_cdm.sqlite"),
            index_dir: PathBuf::from("rag_index"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| MedSqlError::Config(format!("Invalid value for {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.rag_top_k, 1);
        assert_eq!(config.generation_timeout_secs, 180);
        assert_eq!(config.ollama_base_url, "http://localhost:11434");
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("MEDSQL_TEST_BAD_NUMBER", "not-a-number");
        let result: Result<u32> = env_parse("MEDSQL_TEST_BAD_NUMBER", 3);
        assert!(matches!(result, Err(MedSqlError::Config(_))));
        std::env::remove_var("MEDSQL_TEST_BAD_NUMBER");
    }

    #[test]
    fn test_env_parse_unset_uses_default() {
        let result: Result<u32> = env_parse("MEDSQL_TEST_UNSET_KEY", 7);
        assert_eq!(result.unwrap(), 7);
    }
}
