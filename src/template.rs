//! Template rendering for outbound messages.
//!
//! Supports both `{{token}}` and `[token]` placeholder syntaxes. Resolution
//! order: contact fields, then job-level variables, then template-declared
//! defaults. Unresolved placeholders are left in place.

use crate::db::models::Contact;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}|\[([A-Za-z0-9_]+)\]").expect("placeholder regex")
});

/// Substitute placeholders in `template`.
pub fn render(
    template: &str,
    contact: Option<&Contact>,
    variables: &HashMap<String, String>,
    defaults: &HashMap<String, String>,
) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let token = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            resolve(token, contact, variables, defaults)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn resolve(
    token: &str,
    contact: Option<&Contact>,
    variables: &HashMap<String, String>,
    defaults: &HashMap<String, String>,
) -> Option<String> {
    if let Some(contact) = contact
        && let Some(value) = contact.field(token)
        && !value.is_empty()
    {
        return Some(value.to_string());
    }
    if let Some(value) = variables.get(token) {
        return Some(value.clone());
    }
    defaults.get(token).cloned()
}
