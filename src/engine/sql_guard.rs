// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! SQL guard for protective mode enforcement.
//!
//! Classifies SQL statements and detects potentially destructive operations.
//! Keyword/regex based and deliberately conservative: no full SQL parser.
//! A parser-backed path may be swapped in later as long as it keeps the
//! same warning vocabulary; this heuristic path stays as the fallback.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::config::PolicyConfig;

// Keywords that indicate destructive/mutating SQL operations.
// Conservative list, may produce false positives on edge cases.
const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "REPLACE", "TRUNCATE", "DROP", "CREATE",
    "ALTER", "GRANT", "REVOKE", "COPY", "LOAD", "VACUUM", "REINDEX", "CLUSTER", "REFRESH", "CALL",
    "EXEC", "EXECUTE",
];

const READ_ONLY_STARTS: &[&str] = &["SELECT", "WITH", "EXPLAIN", "SHOW", "DESCRIBE", "PRAGMA"];

static DESTRUCTIVE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b({})\b", DESTRUCTIVE_KEYWORDS.join("|"))).expect("valid pattern")
});

static SELECT_STAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSELECT\s+\*").expect("valid pattern"));

static SELECT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSELECT\b").expect("valid pattern"));

static WHERE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").expect("valid pattern"));

static LIMIT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\b").expect("valid pattern"));

static DELETE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bDELETE\b").expect("valid pattern"));

static DDL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(CREATE|ALTER|DROP)\b").expect("valid pattern"));

static DML_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(INSERT|UPDATE|DELETE)\b").expect("valid pattern"));

/// Classification of SQL statement safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlClassification {
    ReadOnly,
    Destructive,
    Unknown,
}

impl SqlClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Destructive => "destructive",
            Self::Unknown => "unknown",
        }
    }
}

/// Risk level for a SQL statement in protective mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SqlRiskLevel {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl SqlRiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Specific warnings for SQL queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SqlWarning {
    /// SELECT without LIMIT clause
    NoLimit,
    /// Uses SELECT *
    SelectStar,
    /// Multiple statements
    MultiStatement,
    /// Data definition (CREATE, ALTER, DROP)
    Ddl,
    /// Data manipulation (INSERT, UPDATE, DELETE)
    Dml,
    /// DELETE without WHERE clause
    DeleteNoWhere,
    /// Result near the configured row cap
    ApproachedRowCap,
}

impl SqlWarning {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoLimit => "NO_LIMIT",
            Self::SelectStar => "SELECT_STAR",
            Self::MultiStatement => "MULTI_STATEMENT",
            Self::Ddl => "DDL",
            Self::Dml => "DML",
            Self::DeleteNoWhere => "DELETE_NO_WHERE",
            Self::ApproachedRowCap => "APPROACHED_ROW_CAP",
        }
    }
}

/// Result of SQL guard analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlGuardResult {
    pub classification: SqlClassification,
    pub is_multi_statement: bool,
    pub risk_level: SqlRiskLevel,
    pub warnings: Vec<SqlWarning>,
    pub reason: Option<String>,
}

impl SqlGuardResult {
    /// Whether the SQL is considered safe for protective mode.
    pub fn is_safe(&self) -> bool {
        self.classification == SqlClassification::ReadOnly && !self.is_multi_statement
    }

    pub fn warning_labels(&self) -> Vec<String> {
        self.warnings.iter().map(|w| w.as_str().to_string()).collect()
    }
}

/// Detect if SQL contains multiple statements.
///
/// Heuristic: strip one trailing semicolon plus whitespace; any remaining
/// semicolon flags multi-statement. May have false positives on semicolons
/// inside string literals (known limitation).
fn detect_multi_statement(sql: &str) -> bool {
    let stripped = sql
        .trim_end()
        .trim_end_matches(';')
        .trim_end();
    stripped.contains(';')
}

/// Flag DELETE statements with no WHERE clause anywhere in the text.
fn detect_delete_without_where(sql: &str) -> bool {
    if !DELETE_PATTERN.is_match(sql) {
        return false;
    }
    !WHERE_PATTERN.is_match(sql)
}

/// Classify a statement as read-only, destructive, or unknown.
fn classify_sql(sql: &str) -> SqlClassification {
    if DESTRUCTIVE_PATTERN.is_match(sql) {
        return SqlClassification::Destructive;
    }

    let upper = sql.trim().to_uppercase();
    if READ_ONLY_STARTS.iter().any(|kw| upper.starts_with(kw)) {
        return SqlClassification::ReadOnly;
    }

    SqlClassification::Unknown
}

/// Whether the projection uses `SELECT *`. `COUNT(*)` must not trip this.
fn detect_select_star(sql: &str) -> bool {
    SELECT_STAR_PATTERN.is_match(sql)
}

/// Whether a SELECT has no LIMIT clause.
///
/// If a WHERE clause is present we do not warn for lack of LIMIT; this
/// reduces noise for common filtered exploration queries.
fn detect_no_limit(sql: &str) -> bool {
    if !SELECT_PATTERN.is_match(sql) {
        return false;
    }
    if WHERE_PATTERN.is_match(sql) {
        return false;
    }
    !LIMIT_PATTERN.is_match(sql)
}

fn detect_ddl(sql: &str) -> bool {
    DDL_PATTERN.is_match(sql)
}

fn detect_dml(sql: &str) -> bool {
    DML_PATTERN.is_match(sql)
}

/// Analyze SQL for safety in protective mode.
pub fn analyze_sql(sql: &str) -> SqlGuardResult {
    if sql.trim().is_empty() {
        return SqlGuardResult {
            classification: SqlClassification::Unknown,
            is_multi_statement: false,
            risk_level: SqlRiskLevel::Medium,
            warnings: Vec::new(),
            reason: Some("Empty SQL".to_string()),
        };
    }

    let is_multi = detect_multi_statement(sql);
    let classification = classify_sql(sql);
    let delete_without_where = detect_delete_without_where(sql);

    let mut warnings = Vec::new();
    if is_multi {
        warnings.push(SqlWarning::MultiStatement);
    }
    if detect_select_star(sql) {
        warnings.push(SqlWarning::SelectStar);
    }
    if detect_no_limit(sql) {
        warnings.push(SqlWarning::NoLimit);
    }
    if delete_without_where {
        warnings.push(SqlWarning::DeleteNoWhere);
    }
    if detect_ddl(sql) {
        warnings.push(SqlWarning::Ddl);
    }
    if detect_dml(sql) {
        warnings.push(SqlWarning::Dml);
    }

    let reason = if is_multi {
        Some("Multi-statement SQL detected".to_string())
    } else if delete_without_where {
        Some("DELETE without WHERE detected".to_string())
    } else if classification == SqlClassification::Destructive {
        Some("Destructive SQL operation detected".to_string())
    } else if classification == SqlClassification::Unknown {
        Some("Unable to classify SQL as safe".to_string())
    } else {
        None
    };

    let risk_level = if is_multi
        || delete_without_where
        || classification == SqlClassification::Destructive
    {
        SqlRiskLevel::Critical
    } else if classification == SqlClassification::Unknown {
        SqlRiskLevel::Medium
    } else {
        SqlRiskLevel::Low
    };

    SqlGuardResult {
        classification,
        is_multi_statement: is_multi,
        risk_level,
        warnings,
        reason,
    }
}

/// Determine if SQL should be blocked under the active policy toggles.
pub fn should_block_sql(sql: &str, policy: &PolicyConfig) -> (bool, Option<String>) {
    if !policy.protective_mode {
        return (false, None);
    }

    let result = analyze_sql(sql);

    if result.is_multi_statement && policy.block_multi_statement {
        return (
            true,
            Some(
                result
                    .reason
                    .unwrap_or_else(|| "Multi-statement SQL detected".to_string()),
            ),
        );
    }

    if result.warnings.contains(&SqlWarning::DeleteNoWhere) && policy.block_delete_without_where {
        return (
            true,
            Some(
                result
                    .reason
                    .unwrap_or_else(|| "DELETE without WHERE detected".to_string()),
            ),
        );
    }

    if result.warnings.contains(&SqlWarning::Ddl) && policy.block_ddl {
        return (
            true,
            Some("DDL statements are blocked in protective mode".to_string()),
        );
    }

    if result.warnings.contains(&SqlWarning::Dml) && policy.block_dml {
        return (
            true,
            Some("DML statements are blocked in protective mode".to_string()),
        );
    }

    // Destructive statements that map to no toggle (e.g. TRUNCATE) still block.
    if result.classification == SqlClassification::Destructive
        && !result.warnings.contains(&SqlWarning::Ddl)
        && !result.warnings.contains(&SqlWarning::Dml)
    {
        return (
            true,
            Some(
                result
                    .reason
                    .unwrap_or_else(|| "Destructive SQL operation detected".to_string()),
            ),
        );
    }

    (false, None)
}

/// Derive the policy rule ids fired for a blocked SQL statement.
///
/// Coarse-grained ids that are safe to persist/export.
pub fn derive_policy_rule_ids(guard: &SqlGuardResult, policy: &PolicyConfig) -> Vec<String> {
    let mut rule_ids = Vec::new();

    if guard.warnings.contains(&SqlWarning::MultiStatement) && policy.block_multi_statement {
        rule_ids.push("block_multi_statement".to_string());
    }
    if guard.warnings.contains(&SqlWarning::DeleteNoWhere) && policy.block_delete_without_where {
        rule_ids.push("block_delete_without_where".to_string());
    }
    if guard.warnings.contains(&SqlWarning::Ddl) && policy.block_ddl {
        rule_ids.push("block_ddl".to_string());
    }
    if guard.warnings.contains(&SqlWarning::Dml) && policy.block_dml {
        rule_ids.push("block_dml".to_string());
    }

    // Fallback for blocked operations that don't map cleanly to a toggle.
    if rule_ids.is_empty() {
        rule_ids.push("block_destructive".to_string());
    }

    rule_ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sql_is_unknown_medium() {
        let result = analyze_sql("   ");
        assert_eq!(result.classification, SqlClassification::Unknown);
        assert_eq!(result.risk_level, SqlRiskLevel::Medium);
        assert_eq!(result.reason.as_deref(), Some("Empty SQL"));
        assert!(!result.is_multi_statement);
    }

    #[test]
    fn plain_select_is_read_only_low() {
        let result = analyze_sql("SELECT id FROM users WHERE id = 1");
        assert_eq!(result.classification, SqlClassification::ReadOnly);
        assert_eq!(result.risk_level, SqlRiskLevel::Low);
        assert!(result.warnings.is_empty());
        assert!(result.reason.is_none());
        assert!(result.is_safe());
    }

    #[test]
    fn read_only_starts_classify_read_only() {
        for sql in [
            "WITH t AS (SELECT 1) SELECT x FROM t WHERE x > 0",
            "EXPLAIN SELECT 1 WHERE true",
            "SHOW TABLES",
            "DESCRIBE users",
            "PRAGMA table_info(users)",
        ] {
            assert_eq!(
                analyze_sql(sql).classification,
                SqlClassification::ReadOnly,
                "expected read_only for {sql}"
            );
        }
    }

    #[test]
    fn trailing_semicolon_is_single_statement() {
        let result = analyze_sql("SELECT 1 WHERE true;");
        assert!(!result.is_multi_statement);
        let result = analyze_sql("SELECT 1 WHERE true;   ");
        assert!(!result.is_multi_statement);
    }

    #[test]
    fn interior_semicolon_flags_multi_statement() {
        let result = analyze_sql("SELECT 1; SELECT 2");
        assert!(result.is_multi_statement);
        assert!(result.warnings.contains(&SqlWarning::MultiStatement));
        assert_eq!(result.risk_level, SqlRiskLevel::Critical);
        assert_eq!(result.reason.as_deref(), Some("Multi-statement SQL detected"));
    }

    #[test]
    fn delete_without_where_is_critical() {
        let result = analyze_sql("DELETE FROM t");
        assert!(result.warnings.contains(&SqlWarning::DeleteNoWhere));
        assert_eq!(result.risk_level, SqlRiskLevel::Critical);
        assert_eq!(result.classification, SqlClassification::Destructive);
    }

    #[test]
    fn delete_with_where_has_no_delete_warning() {
        let result = analyze_sql("DELETE FROM t WHERE id = 1");
        assert!(!result.warnings.contains(&SqlWarning::DeleteNoWhere));
        // Still destructive DML
        assert!(result.warnings.contains(&SqlWarning::Dml));
        assert_eq!(result.risk_level, SqlRiskLevel::Critical);
    }

    #[test]
    fn count_star_is_not_select_star() {
        let result = analyze_sql("SELECT COUNT(*) FROM t");
        assert!(!result.warnings.contains(&SqlWarning::SelectStar));
    }

    #[test]
    fn select_star_without_where_warns_twice() {
        let result = analyze_sql("SELECT * FROM t");
        assert!(result.warnings.contains(&SqlWarning::SelectStar));
        assert!(result.warnings.contains(&SqlWarning::NoLimit));
        assert_eq!(result.risk_level, SqlRiskLevel::Low);
    }

    #[test]
    fn where_clause_suppresses_no_limit() {
        // Deliberate false-negative tradeoff: any WHERE suppresses the warning,
        // even one that filters nothing.
        let result = analyze_sql("SELECT * FROM t WHERE 1=1");
        assert!(!result.warnings.contains(&SqlWarning::NoLimit));
        assert!(result.warnings.contains(&SqlWarning::SelectStar));
    }

    #[test]
    fn limit_suppresses_no_limit() {
        let result = analyze_sql("SELECT * FROM t LIMIT 10");
        assert!(!result.warnings.contains(&SqlWarning::NoLimit));
    }

    #[test]
    fn truncate_is_destructive_without_ddl_or_dml() {
        let result = analyze_sql("TRUNCATE TABLE t");
        assert_eq!(result.classification, SqlClassification::Destructive);
        assert!(!result.warnings.contains(&SqlWarning::Ddl));
        assert!(!result.warnings.contains(&SqlWarning::Dml));
        assert_eq!(result.risk_level, SqlRiskLevel::Critical);
    }

    #[test]
    fn drop_table_is_ddl() {
        let result = analyze_sql("DROP TABLE users");
        assert!(result.warnings.contains(&SqlWarning::Ddl));
        assert_eq!(result.classification, SqlClassification::Destructive);
    }

    #[test]
    fn destructive_keyword_anywhere_wins_over_read_only_start() {
        let result = analyze_sql("SELECT 1; DROP TABLE users");
        assert_eq!(result.classification, SqlClassification::Destructive);
        assert!(result.is_multi_statement);
    }

    #[test]
    fn keyword_as_substring_does_not_match() {
        // "created_at" contains CREATE but not as a whole word
        let result = analyze_sql("SELECT created_at FROM events WHERE id = 1");
        assert_eq!(result.classification, SqlClassification::ReadOnly);
    }

    #[test]
    fn vendor_specific_statement_is_unknown() {
        let result = analyze_sql("LIST TABLES");
        assert_eq!(result.classification, SqlClassification::Unknown);
        assert_eq!(result.risk_level, SqlRiskLevel::Medium);
        assert_eq!(result.reason.as_deref(), Some("Unable to classify SQL as safe"));
    }

    #[test]
    fn reason_precedence_multi_statement_first() {
        let result = analyze_sql("DELETE FROM a; DELETE FROM b");
        assert_eq!(result.reason.as_deref(), Some("Multi-statement SQL detected"));
    }

    mod blocking {
        use super::*;

        fn protective() -> PolicyConfig {
            PolicyConfig::default()
        }

        #[test]
        fn transparent_mode_never_blocks() {
            let policy = PolicyConfig {
                protective_mode: false,
                ..PolicyConfig::default()
            };
            let (blocked, reason) = should_block_sql("DROP TABLE users", &policy);
            assert!(!blocked);
            assert!(reason.is_none());
        }

        #[test]
        fn read_only_select_passes() {
            let (blocked, _) = should_block_sql("SELECT 1 FROM t WHERE x = 1", &protective());
            assert!(!blocked);
        }

        #[test]
        fn ddl_blocks_with_toggle_reason() {
            let (blocked, reason) = should_block_sql("CREATE TABLE t (id INT)", &protective());
            assert!(blocked);
            assert_eq!(
                reason.as_deref(),
                Some("DDL statements are blocked in protective mode")
            );
        }

        #[test]
        fn dml_blocks() {
            let (blocked, reason) = should_block_sql("INSERT INTO t VALUES (1)", &protective());
            assert!(blocked);
            assert_eq!(
                reason.as_deref(),
                Some("DML statements are blocked in protective mode")
            );
        }

        #[test]
        fn truncate_blocks_via_destructive_fallback() {
            let (blocked, reason) = should_block_sql("TRUNCATE TABLE t", &protective());
            assert!(blocked);
            assert_eq!(reason.as_deref(), Some("Destructive SQL operation detected"));
        }

        #[test]
        fn disabled_toggles_still_block_plain_destructive() {
            let policy = PolicyConfig {
                protective_mode: true,
                block_ddl: false,
                block_dml: false,
                block_multi_statement: false,
                block_delete_without_where: false,
            };
            // TRUNCATE is neither DDL nor DML per our tags, so it blocks
            let (blocked, _) = should_block_sql("TRUNCATE TABLE t", &policy);
            assert!(blocked);
            // DROP is DDL and the toggle is off, and the destructive fallback
            // only applies when neither tag is present
            let (blocked, _) = should_block_sql("DROP TABLE t", &policy);
            assert!(!blocked);
        }

        #[test]
        fn rule_ids_map_toggles_with_fallback() {
            let policy = protective();
            let guard = analyze_sql("DELETE FROM t");
            let ids = derive_policy_rule_ids(&guard, &policy);
            assert!(ids.contains(&"block_delete_without_where".to_string()));
            assert!(ids.contains(&"block_dml".to_string()));

            let guard = analyze_sql("TRUNCATE TABLE t");
            let ids = derive_policy_rule_ids(&guard, &policy);
            assert_eq!(ids, vec!["block_destructive".to_string()]);
        }
    }
}
