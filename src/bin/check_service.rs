//! Probe the generation backend and OMOP database
//!
//! Run with: cargo run --bin check_service

use medsql_engine::config::EngineConfig;
use medsql_engine::generation::SqlGenerationEngine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    println!("🔌 Checking the generation service...\n");

    let config = EngineConfig::from_env()?;
    println!("📡 Backend: {}", config.ollama_base_url);
    println!("   Model: {}", config.ollama_model);
    println!("   Embedding model: {}", config.embedding_model);
    println!("   OMOP database: {}\n", config.omop_db_path.display());

    let db_exists = config.omop_db_path.exists();
    let engine = SqlGenerationEngine::new(config);
    let status = engine.status().await;

    if status.backend_reachable {
        println!("✅ Backend is reachable");
    } else {
        println!("❌ Backend is not responding");
        println!("   Is Ollama running? (check with: ollama list)");
    }

    if status.model_available {
        println!("✅ Model {} is available", status.model);
    } else {
        println!("⚠️  Model {} is not available (run: ollama pull {})", status.model, status.model);
    }

    if db_exists {
        println!("✅ OMOP database found");
    } else {
        println!("⚠️  OMOP database not found, execution checks will fail");
    }

    Ok(())
}
