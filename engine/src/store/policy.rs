use regex::Regex;
use sdk::errors::EngineError;

/// Statements the guard refuses to run.
///
/// The first seven mutate data or schema; the SQLite-specific ones write
/// rows, attach foreign files, rebuild indexes or change connection state.
pub const MUTATING_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "TRUNCATE", "ALTER", "CREATE", "INSERT", "UPDATE", "REPLACE", "ATTACH",
    "DETACH", "PRAGMA", "VACUUM", "REINDEX", "ANALYZE",
];

/// Whole-word pattern for one keyword
///
/// `REPLACE` is only blocked as a statement; the `replace(x, y, z)` string
/// function stays usable.
fn keyword_pattern(keyword: &str) -> String {
    match keyword {
        "REPLACE" => r"(?i)\bREPLACE\b\s*(?:[^\s(]|$)".to_string(),
        other => format!(r"(?i)\b{}\b", other),
    }
}

/// Read-only policy applied to every generated query before execution
///
/// Keywords are matched as whole words, case-insensitively, so identifiers
/// such as `update_count` or `created_at` pass.
///
/// # Example
///
/// ```
/// use tabula_engine::store::policy::QueryPolicy;
///
/// let policy = QueryPolicy::new().unwrap();
/// assert!(policy.check("SELECT created_at FROM orders").is_ok());
/// assert!(policy.check("drop table orders").is_err());
/// ```
pub struct QueryPolicy {
    patterns: Vec<(&'static str, Regex)>,
}

impl QueryPolicy {
    /// Compile one whole-word pattern per keyword
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern fails to compile (never happens with the
    /// fixed keyword list).
    pub fn new() -> anyhow::Result<Self> {
        let patterns = MUTATING_KEYWORDS
            .iter()
            .map(|keyword| Ok((*keyword, Regex::new(&keyword_pattern(keyword))?)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    /// First blocked keyword found in the query, in keyword-list order
    pub fn find_mutating_keyword(&self, query: &str) -> Option<&'static str> {
        self.patterns
            .iter()
            .find(|(_, pattern)| pattern.is_match(query))
            .map(|(keyword, _)| *keyword)
    }

    /// Reject queries containing a blocked keyword
    pub fn check(&self, query: &str) -> Result<(), EngineError> {
        match self.find_mutating_keyword(query) {
            Some(keyword) => Err(EngineError::QueryRejected {
                keyword: keyword.to_string(),
                query: query.to_string(),
            }),
            None => Ok(()),
        }
    }
}
