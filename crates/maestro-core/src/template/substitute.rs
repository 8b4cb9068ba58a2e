//! `{UPPER_SNAKE_CASE}` placeholder substitution.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use super::types::Variables;

#[allow(clippy::unwrap_used)] // literal pattern
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Z][A-Z0-9_]*)\}").unwrap());

/// Replace every known placeholder in `text`.
///
/// Unknown placeholders are left untouched so a partially resolved prompt
/// still shows what was missing.
pub fn substitute(text: &str, vars: &Variables) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures<'_>| {
            vars.get(&caps[1])
                .map_or_else(|| caps[0].to_string(), stringify)
        })
        .into_owned()
}

/// Placeholder names in `text` with no value in `vars`.
pub fn unresolved(text: &str, vars: &Variables) -> Vec<String> {
    let mut names: Vec<String> = PLACEHOLDER
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .filter(|name| !vars.contains_key(name))
        .collect();
    names.dedup();
    names
}

/// Render a JSON value the way prompts expect it.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "yes".to_string(),
        Value::Bool(false) => "no".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(", "),
        Value::Object(_) => value.to_string(),
    }
}
