//! Statement text helpers: normalization and leading-keyword classification.

use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static LEADING_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\(*\s*([A-Za-z]+)").unwrap());

/// Collapse every whitespace run (newlines included) to one space and trim.
///
/// This is the canonical form stored on events and compared against the
/// reserved bookkeeping statements.
pub fn normalize_statement(raw: &str) -> String {
    WHITESPACE_RUN.replace_all(raw, " ").trim().to_string()
}

/// Leading SQL verb, used for span naming only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Replace,
    Ddl,
    Begin,
    Commit,
    Rollback,
    Set,
    Show,
    Other,
}

impl SqlOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOperation::Select => "SELECT",
            SqlOperation::Insert => "INSERT",
            SqlOperation::Update => "UPDATE",
            SqlOperation::Delete => "DELETE",
            SqlOperation::Replace => "REPLACE",
            SqlOperation::Ddl => "DDL",
            SqlOperation::Begin => "BEGIN",
            SqlOperation::Commit => "COMMIT",
            SqlOperation::Rollback => "ROLLBACK",
            SqlOperation::Set => "SET",
            SqlOperation::Show => "SHOW",
            SqlOperation::Other => "QUERY",
        }
    }

    /// Classify a statement by its first keyword.
    pub fn parse(sql: &str) -> Self {
        let keyword = match LEADING_KEYWORD.captures(sql.trim_start()) {
            Some(caps) => caps[1].to_ascii_uppercase(),
            None => return SqlOperation::Other,
        };

        match keyword.as_str() {
            "SELECT" | "WITH" => SqlOperation::Select,
            "INSERT" => SqlOperation::Insert,
            "UPDATE" => SqlOperation::Update,
            "DELETE" => SqlOperation::Delete,
            "REPLACE" => SqlOperation::Replace,
            "CREATE" | "DROP" | "ALTER" | "TRUNCATE" | "RENAME" => SqlOperation::Ddl,
            "BEGIN" | "START" => SqlOperation::Begin,
            "COMMIT" => SqlOperation::Commit,
            "ROLLBACK" => SqlOperation::Rollback,
            "SET" => SqlOperation::Set,
            "SHOW" => SqlOperation::Show,
            _ => SqlOperation::Other,
        }
    }
}

impl std::fmt::Display for SqlOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(
            normalize_statement("  SELECT *\n\tFROM   users\r\n WHERE id = ?  "),
            "SELECT * FROM users WHERE id = ?"
        );
    }

    #[test]
    fn test_normalize_empty() {
        assert_eq!(normalize_statement(""), "");
        assert_eq!(normalize_statement(" \n\t "), "");
    }

    #[test]
    fn test_parse_dml() {
        assert_eq!(SqlOperation::parse("select id from orders"), SqlOperation::Select);
        assert_eq!(
            SqlOperation::parse("WITH cte AS (SELECT 1) SELECT * FROM cte"),
            SqlOperation::Select
        );
        assert_eq!(
            SqlOperation::parse("(SELECT 1) UNION (SELECT 2)"),
            SqlOperation::Select
        );
        assert_eq!(
            SqlOperation::parse("INSERT INTO users (name) VALUES (?)"),
            SqlOperation::Insert
        );
        assert_eq!(
            SqlOperation::parse("\n  DELETE FROM users WHERE id = 1"),
            SqlOperation::Delete
        );
    }

    #[test]
    fn test_parse_control_statements() {
        assert_eq!(SqlOperation::parse("START TRANSACTION"), SqlOperation::Begin);
        assert_eq!(SqlOperation::parse("commit"), SqlOperation::Commit);
        assert_eq!(
            SqlOperation::parse("SET `profiling_history_size` = 100"),
            SqlOperation::Set
        );
        assert_eq!(SqlOperation::parse("SHOW PROFILES"), SqlOperation::Show);
        assert_eq!(SqlOperation::parse(""), SqlOperation::Other);
    }
}
