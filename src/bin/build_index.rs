use anyhow::Result;
use clap::Parser;
use medsql_engine::config::EngineConfig;
use medsql_engine::embedding::OllamaEmbedder;
use medsql_engine::example_index::ExampleIndex;
use std::path::PathBuf;
use std::sync::Arc;

/// CLI tool to embed the question/SQL dataset ahead of serving
#[derive(Parser)]
#[command(name = "build-index")]
#[command(about = "Embed the question/SQL dataset and persist the example index")]
struct Args {
    /// Path to the dataset CSV (default: from environment)
    #[arg(short, long)]
    dataset: Option<PathBuf>,

    /// Output directory for the index artifacts (default: from environment)
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Question column to embed, repeatable (default: auto-detect QUESTION* columns)
    #[arg(short, long = "question-column")]
    question_columns: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = EngineConfig::from_env()?;

    let dataset = args.dataset.unwrap_or(config.dataset_path);
    let out_dir = args.out_dir.unwrap_or(config.index_dir);

    println!("🧮 Example Index Builder");
    println!("========================\n");
    println!("Dataset: {}", dataset.display());
    println!("Output: {}", out_dir.display());
    println!("Embedding model: {}\n", config.embedding_model);

    let embedder = Arc::new(OllamaEmbedder::new(
        config.ollama_base_url.clone(),
        config.embedding_model.clone(),
    ));

    let columns = if args.question_columns.is_empty() {
        None
    } else {
        Some(args.question_columns.as_slice())
    };

    let index = ExampleIndex::build(
        embedder,
        &config.embedding_model,
        &dataset,
        &out_dir,
        columns,
    )
    .await?;

    println!("\n✅ Index written to: {}", out_dir.display());
    println!("   Examples embedded: {}", index.len());

    Ok(())
}
