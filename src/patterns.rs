/// Shared regular-expression semantics.
///
/// Every pattern in the system (URI searches, snapshot attribute filters,
/// standing queries, and the SQL predicates) matches full strings only,
/// and an invalid pattern matches nothing instead of raising.
use regex::Regex;

/// Compile a user pattern into a full-string matcher, or `None` when the
/// pattern does not compile.
pub(crate) fn compile_anchored(pattern: &str) -> Option<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).ok()
}

/// The anchored source string handed to SQL regex predicates.
pub(crate) fn anchored_source(pattern: &str) -> String {
    format!("^(?:{pattern})$")
}
