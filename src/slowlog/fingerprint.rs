// # Query Fingerprinting
//
// Produces the structure-preserving, literal-erased form of a statement used
// to group semantically identical queries. Normalization is idempotent:
// applying it to its own output yields the same string.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::NormalizationMode;

static STRING_LITERALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:[^'\\]|\\.)*'").expect("string literal regex"));

static NUMERIC_LITERALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+\b").expect("numeric literal regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Normalize a query according to the configured mode.
pub fn normalize(query: &str, mode: NormalizationMode) -> String {
    match mode {
        NormalizationMode::None => query.to_string(),
        NormalizationMode::Basic => {
            let stripped = STRING_LITERALS.replace_all(query, "?");
            let stripped = NUMERIC_LITERALS.replace_all(&stripped, "?");
            let collapsed = WHITESPACE.replace_all(&stripped, " ");
            collapsed.trim().to_uppercase()
        }
    }
}
