//! SQL Validator
//!
//! Three independent pieces: a static syntax/policy gate, a best-effort
//! extractor that pulls SQL out of free-form model output, and a sandboxed
//! execution gate that runs the statement read-only against the OMOP SQLite
//! database. Gate outcomes are tagged values, never errors.

use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Lock-wait budget for the sandboxed execution probe.
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Mutating operations the policy gate rejects, checked in this order.
const PROHIBITED_OPERATIONS: [&str; 7] = [
    "CREATE", "DROP", "INSERT", "UPDATE", "DELETE", "TRUNCATE", "ALTER",
];

/// Clause keywords that mark a line as SQL during line-filter extraction.
const CLAUSE_KEYWORDS: [&str; 9] = [
    "SELECT", "FROM", "WHERE", "JOIN", "WITH", "GROUP", "ORDER", "HAVING", "UNION",
];

/// Phrases that mark a line as prose rather than SQL.
const EXPLANATORY_PHRASES: [&str; 5] = ["explanation:", "the query", "this sql", "note:", "answer:"];

lazy_static! {
    /// Extraction strategies, tried in order: sql-tagged fence, any fence,
    /// then an explicit SQL: label up to a blank line or end of text.
    static ref SQL_BLOCK_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?is)```sql\s*(.*?)\s*```").unwrap(),
        Regex::new(r"(?is)```\s*(.*?)\s*```").unwrap(),
        Regex::new(r"(?is)SQL:\s*(.*?)(?:\n\n|\z)").unwrap(),
    ];
}

/// Failure taxonomy for generation attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlErrorKind {
    Generation,
    Syntax,
    Operational,
    Database,
    DatabaseNotFound,
    Other(String),
}

impl fmt::Display for SqlErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlErrorKind::Generation => write!(f, "GenerationError"),
            SqlErrorKind::Syntax => write!(f, "SyntaxError"),
            SqlErrorKind::Operational => write!(f, "OperationalError"),
            SqlErrorKind::Database => write!(f, "DatabaseError"),
            SqlErrorKind::DatabaseNotFound => write!(f, "DatabaseNotFound"),
            SqlErrorKind::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Outcome of one sandboxed execution probe.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub executable: bool,
    pub error: Option<String>,
    pub error_kind: Option<SqlErrorKind>,
    /// Wall-clock execution time in seconds, on success.
    pub execution_time: Option<f64>,
    /// Rows returned for row-producing statements, affected count otherwise.
    pub row_count: Option<i64>,
}

impl ExecutionReport {
    fn failure(error: String, kind: SqlErrorKind) -> Self {
        Self {
            executable: false,
            error: Some(error),
            error_kind: Some(kind),
            execution_time: None,
            row_count: None,
        }
    }
}

/// Sandboxed execution check, injectable so the generation loop is testable
/// without a database file.
pub trait ExecutionGate: Send + Sync {
    fn test_execution(&self, sql: &str) -> ExecutionReport;
}

/// Static syntax/policy gate. Returns the first failing check's message, or
/// `None` when the statement passes every check.
pub fn validate_sql_syntax(sql: &str) -> Option<String> {
    if sql.is_empty() || sql.trim() == ";" {
        return Some("SQL is empty".to_string());
    }

    let sql_upper = sql.to_uppercase();

    if !sql_upper.contains("SELECT") || !sql_upper.contains("FROM") {
        return Some("SQL must contain SELECT and FROM".to_string());
    }

    for op in PROHIBITED_OPERATIONS {
        if sql_upper.contains(op) {
            return Some(format!("Prohibited operation: {}", op));
        }
    }

    if sql.chars().count() > 5000 {
        return Some("SQL is too long".to_string());
    }

    if sql.matches("SELECT").count() > 20 {
        return Some("Too many nested SELECTs".to_string());
    }

    None
}

/// Best-effort extraction of SQL from free-form model output.
///
/// Tries the fenced/labelled strategies first; a strategy wins only when its
/// capture contains SELECT. Falls back to keeping clause-keyword lines plus
/// their continuations. Never fails; worst case returns the trimmed,
/// semicolon-terminated input. Multi-statement or CTE-heavy output may be
/// mis-truncated by the fallback.
pub fn clean_generated_sql(generated_text: &str) -> String {
    let text = generated_text.trim();

    for pattern in SQL_BLOCK_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(text) {
            if let Some(matched) = captures.get(1) {
                let sql = matched.as_str().trim();
                if !sql.is_empty() && sql.to_uppercase().contains("SELECT") {
                    return clean_sql_text(sql);
                }
            }
        }
    }

    let mut sql_lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim();

        let lower = line.to_lowercase();
        if EXPLANATORY_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
            continue;
        }

        if line.starts_with("--") && line.chars().count() > 50 {
            continue;
        }

        let upper = line.to_uppercase();
        if CLAUSE_KEYWORDS.iter().any(|keyword| upper.contains(keyword)) {
            sql_lines.push(line);
        } else if !sql_lines.is_empty() && !line.is_empty() && !line.starts_with("--") {
            sql_lines.push(line);
        }
    }

    if !sql_lines.is_empty() {
        return clean_sql_text(&sql_lines.join("\n"));
    }

    clean_sql_text(text)
}

fn clean_sql_text(sql: &str) -> String {
    let cleaned: Vec<&str> = sql
        .lines()
        .map(str::trim)
        .filter(|line| !(line.starts_with("--") && line.chars().count() > 80))
        .filter(|line| !line.is_empty())
        .collect();

    let mut sql = cleaned.join("\n").trim().to_string();
    if !sql.is_empty() && !sql.ends_with(';') {
        sql.push(';');
    }
    sql
}

/// Execution gate against the OMOP SQLite database.
pub struct SqlValidator {
    omop_db_path: PathBuf,
    execution_timeout: Duration,
}

impl SqlValidator {
    pub fn new(omop_db_path: PathBuf) -> Self {
        Self {
            omop_db_path,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    pub fn with_timeout(omop_db_path: PathBuf, execution_timeout: Duration) -> Self {
        Self {
            omop_db_path,
            execution_timeout,
        }
    }

    /// Run the statement read-only and report the outcome. The connection is
    /// scoped to this call and released on every exit path.
    pub fn test_sql_execution(&self, sql: &str) -> ExecutionReport {
        if !self.omop_db_path.exists() {
            return ExecutionReport::failure(
                format!("OMOP database not found: {}", self.omop_db_path.display()),
                SqlErrorKind::DatabaseNotFound,
            );
        }

        debug!("Probing SQL against {}", self.omop_db_path.display());
        let start = Instant::now();
        match run_statement(&self.omop_db_path, sql, self.execution_timeout) {
            Ok(row_count) => ExecutionReport {
                executable: true,
                error: None,
                error_kind: None,
                execution_time: Some(start.elapsed().as_secs_f64()),
                row_count: Some(row_count),
            },
            Err(e) => {
                let kind = classify_execution_error(&e);
                ExecutionReport::failure(e.to_string(), kind)
            }
        }
    }
}

impl ExecutionGate for SqlValidator {
    fn test_execution(&self, sql: &str) -> ExecutionReport {
        self.test_sql_execution(sql)
    }
}

fn run_statement(db_path: &Path, sql: &str, timeout: Duration) -> rusqlite::Result<i64> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(timeout)?;

    let mut stmt = conn.prepare(sql)?;
    if stmt.column_count() > 0 {
        let mut rows = stmt.query([])?;
        let mut count: i64 = 0;
        while rows.next()?.is_some() {
            count += 1;
        }
        Ok(count)
    } else {
        let affected = stmt.execute([])?;
        Ok(affected as i64)
    }
}

/// Map an engine failure onto the taxonomy: the generic SQLite error code
/// covers malformed/unsupported statements, everything else engine-level is
/// a database failure.
fn classify_execution_error(error: &rusqlite::Error) -> SqlErrorKind {
    match error {
        rusqlite::Error::SqliteFailure(inner, _) => match inner.code {
            rusqlite::ErrorCode::Unknown => SqlErrorKind::Operational,
            _ => SqlErrorKind::Database,
        },
        other => {
            let debug = format!("{:?}", other);
            let name = debug
                .split(|c: char| c == '(' || c == ' ')
                .next()
                .unwrap_or("Error")
                .to_string();
            SqlErrorKind::Other(name)
        }
    }
}
