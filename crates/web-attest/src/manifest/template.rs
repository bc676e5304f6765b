//! `{{name}}` placeholder scanning and substitution.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Variable names referenced by placeholders in `text`, in order of appearance.
pub fn placeholders(text: &str) -> impl Iterator<Item = &str> + '_ {
    placeholder_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
}

/// Replace every placeholder whose variable has a value.
///
/// Placeholders naming unknown variables are left verbatim.
pub fn substitute(text: &str, values: &BTreeMap<String, String>) -> String {
    placeholder_re()
        .replace_all(text, |caps: &Captures| match values.get(&caps[1]) {
            Some(v) => v.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
