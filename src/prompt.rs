//! Prompt Composition
//!
//! Pure builders for the initial and corrective NL-to-SQL prompts. No I/O,
//! no failure modes; truncation keeps corrective context bounded.

use crate::example_index::SimilarExample;
use crate::generation::MedicalTermRef;

/// Character cap on the previous SQL carried into a corrective prompt.
pub const MAX_PREVIOUS_SQL_CHARS: usize = 300;
/// Character cap on the error message carried into a corrective prompt.
pub const MAX_ERROR_CONTEXT_CHARS: usize = 150;

/// First-iteration prompt: question, concept codes and an optional worked
/// example, with instructions to emit SQL only.
pub fn initial_prompt(
    question: &str,
    terms: &[MedicalTermRef],
    example: Option<&SimilarExample>,
) -> String {
    let similar_text = match example {
        Some(ex) => format!("\nSimilar example:\nQuestion: {}\nSQL: {}\n", ex.question, ex.sql),
        None => String::new(),
    };

    format!(
        r#"You are a SQL expert. Generate ONLY valid SQL for OMOP CDM v5.3.

Question: {}

Medical codes to use:
{}
{}

Instructions:
- Generate ONLY SQL code, no explanations
- Use the provided concept IDs in your WHERE clauses
- Use standard OMOP table names (PERSON, CONDITION_OCCURRENCE, DRUG_EXPOSURE, etc.)
- End with semicolon

SQL:"#,
        question,
        format_medical_terms(terms),
        similar_text
    )
}

/// Retry prompt carrying the failed SQL and its error, both truncated.
pub fn corrective_prompt(
    question: &str,
    terms: &[MedicalTermRef],
    previous_sql: &str,
    previous_error: &str,
) -> String {
    format!(
        r#"Fix this SQL error for OMOP CDM v5.3:

Question: {}

Medical codes to use:
{}

Previous SQL (FAILED):
{}

Error: {}

Fixed SQL:"#,
        question,
        format_medical_terms(terms),
        clip(previous_sql, MAX_PREVIOUS_SQL_CHARS),
        clip_with_ellipsis(previous_error, MAX_ERROR_CONTEXT_CHARS)
    )
}

/// Bulleted `term → concept_id` listing, or an explicit no-codes marker.
fn format_medical_terms(terms: &[MedicalTermRef]) -> String {
    if terms.is_empty() {
        return "No specific medical codes provided".to_string();
    }
    terms
        .iter()
        .map(|t| format!("- {} → {}", t.term, t.concept_id))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Character-bounded prefix.
fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn clip_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", clip(text, max_chars))
    } else {
        text.to_string()
    }
}
