//! MedSQL Engine
//!
//! Turns natural-language clinical questions with pre-resolved medical
//! concept codes into validated SQL over an OMOP CDM SQLite database.

pub mod config;
pub mod embedding;
pub mod error;
pub mod example_index;
pub mod generation;
pub mod ollama;
pub mod prompt;
pub mod validator;
