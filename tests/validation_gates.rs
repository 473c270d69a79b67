use medsql_engine::config::EngineConfig;
use medsql_engine::generation::SqlGenerationEngine;
use medsql_engine::validator::{SqlErrorKind, SqlValidator};
use rusqlite::Connection;
use std::fs;
use std::path::PathBuf;

/// Minimal OMOP-shaped database: two patients, one diabetes diagnosis.
fn create_omop_db(path: &PathBuf) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE person (
             person_id INTEGER PRIMARY KEY,
             gender_concept_id INTEGER,
             year_of_birth INTEGER
         );
         CREATE TABLE condition_occurrence (
             condition_occurrence_id INTEGER PRIMARY KEY,
             person_id INTEGER,
             condition_concept_id INTEGER
         );
         INSERT INTO person VALUES (1, 8532, 1984);
         INSERT INTO person VALUES (2, 8507, 1970);
         INSERT INTO condition_occurrence VALUES (10, 1, 201826);",
    )
    .unwrap();
}

fn test_db(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("medsql_gates_{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.sqlite", name));
    let _ = fs::remove_file(&path);
    create_omop_db(&path);
    path
}

#[test]
fn test_select_counts_rows() {
    let validator = SqlValidator::new(test_db("select"));
    let report = validator.test_sql_execution("SELECT * FROM person;");

    assert!(report.executable);
    assert_eq!(report.row_count, Some(2));
    assert!(report.error.is_none());
    assert!(report.execution_time.unwrap() >= 0.0);
}

#[test]
fn test_missing_table_is_operational() {
    let validator = SqlValidator::new(test_db("missing_table"));
    let report = validator.test_sql_execution("SELECT * FROM visit_occurrence;");

    assert!(!report.executable);
    assert_eq!(report.error_kind, Some(SqlErrorKind::Operational));
    assert!(report.error.unwrap().contains("no such table"));
}

#[test]
fn test_malformed_sql_is_operational() {
    let validator = SqlValidator::new(test_db("malformed"));
    let report = validator.test_sql_execution("SELECT FROM WHERE;");

    assert!(!report.executable);
    assert_eq!(report.error_kind, Some(SqlErrorKind::Operational));
}

#[test]
fn test_cte_counts_result_rows() {
    let validator = SqlValidator::new(test_db("cte"));
    let report = validator.test_sql_execution(
        "WITH diabetics AS (
             SELECT person_id FROM condition_occurrence WHERE condition_concept_id = 201826
         )
         SELECT COUNT(*) FROM diabetics;",
    );

    assert!(report.executable);
    assert_eq!(report.row_count, Some(1));
}

#[test]
fn test_join_counts_result_rows() {
    let validator = SqlValidator::new(test_db("join"));
    let report = validator.test_sql_execution(
        "SELECT p.person_id
         FROM person p
         JOIN condition_occurrence co ON co.person_id = p.person_id
         WHERE co.condition_concept_id = 201826;",
    );

    assert!(report.executable);
    assert_eq!(report.row_count, Some(1));
}

#[test]
fn test_writes_are_blocked_by_readonly_connection() {
    let db = test_db("readonly");
    let validator = SqlValidator::new(db.clone());
    let report = validator.test_sql_execution("INSERT INTO person VALUES (3, 8507, 1999);");

    assert!(!report.executable);
    assert_eq!(report.error_kind, Some(SqlErrorKind::Database));

    let conn = Connection::open(&db).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM person", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_engine_validates_fenced_select() {
    let mut config = EngineConfig::default();
    config.omop_db_path = test_db("engine_valid");
    let engine = SqlGenerationEngine::new(config);

    let report = engine.validate_sql("```sql\nSELECT COUNT(*) FROM person\n```");

    assert!(report.is_valid);
    assert!(report.syntax_error.is_none());
    assert_eq!(report.sql, "SELECT COUNT(*) FROM person;");
    assert!(report.is_executable);
    assert_eq!(report.row_count, Some(1));
    assert!(report.execution_error.is_none());
}

#[tokio::test]
async fn test_engine_rejects_prohibited_statement_before_execution() {
    let db = test_db("engine_prohibited");
    let mut config = EngineConfig::default();
    config.omop_db_path = db.clone();
    let engine = SqlGenerationEngine::new(config);

    let report = engine.validate_sql("SELECT * FROM person; DROP TABLE person;");

    assert!(!report.is_valid);
    assert_eq!(report.syntax_error.as_deref(), Some("Prohibited operation: DROP"));
    assert!(!report.is_executable);
    assert!(report.execution_error.is_none());
    assert!(report.row_count.is_none());

    let conn = Connection::open(&db).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM person", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_engine_rejects_empty_input() {
    let mut config = EngineConfig::default();
    config.omop_db_path = test_db("engine_empty");
    let engine = SqlGenerationEngine::new(config);

    let report = engine.validate_sql("   ");

    assert!(!report.is_valid);
    assert_eq!(report.syntax_error.as_deref(), Some("SQL is empty"));
}

#[tokio::test]
async fn test_engine_reports_missing_database_in_result() {
    let mut config = EngineConfig::default();
    config.omop_db_path = PathBuf::from("/nonexistent/omop_cdm.sqlite");
    let engine = SqlGenerationEngine::new(config);

    let report = engine.validate_sql("SELECT COUNT(*) FROM person;");

    assert!(report.is_valid);
    assert!(!report.is_executable);
    assert!(report
        .execution_error
        .unwrap()
        .contains("OMOP database not found"));
}
