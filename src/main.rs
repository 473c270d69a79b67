use anyhow::Result;
use clap::Parser;
use medsql_engine::config::EngineConfig;
use medsql_engine::generation::{GenerationRequest, MedicalTermRef, SqlGenerationEngine};
use tracing::info;

#[derive(Parser)]
#[command(name = "medsql")]
#[command(about = "Generate validated OMOP CDM SQL from a clinical question")]
struct Args {
    /// The clinical question in natural language
    question: String,

    /// Resolved medical concept as term=concept_id (repeatable)
    #[arg(short, long = "term", value_parser = parse_term)]
    term: Vec<MedicalTermRef>,
}

fn parse_term(s: &str) -> Result<MedicalTermRef, String> {
    let (term, concept_id) = s
        .split_once('=')
        .ok_or_else(|| format!("expected term=concept_id, got '{}'", s))?;
    Ok(MedicalTermRef {
        term: term.trim().to_string(),
        concept_id: concept_id.trim().to_string(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("MedSQL engine starting...");
    info!("Question: {}", args.question);

    let config = EngineConfig::from_env()?;
    let max_attempts = config.max_attempts;
    let engine = SqlGenerationEngine::new(config);

    let request = GenerationRequest {
        question: args.question,
        medical_terms: args.term,
    };
    let result = engine.generate_sql(&request).await?;

    // Print results
    println!("\n=== Generated SQL ===");
    println!("{}", result.generated_sql);
    println!("\nExecutable: {}", result.is_executable);
    println!("Attempts: {} of {}", result.attempts_count, max_attempts);
    if let Some(example) = &result.similar_example {
        println!("Similar example ({:.3}): {}", example.score, example.question);
    }
    if let Some(error) = &result.error_message {
        println!("Error: {}", error);
    }

    Ok(())
}
