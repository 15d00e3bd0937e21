use std::collections::{BTreeMap, BTreeSet};

use crate::config::DeploymentConfiguration;
use crate::orchestrator::Error;

pub const IMAGE: &str = "IMAGE";
pub const NAMESPACE: &str = "NAMESPACE";
pub const NAME: &str = "NAME";

const OPEN: &str = "${";
const CLOSE: char = '}';

/// The three values every workload template is rendered with.
pub fn workload_parameters(
    config: &DeploymentConfiguration,
    namespace: &str,
) -> BTreeMap<&'static str, String> {
    let mut params = BTreeMap::new();
    params.insert(IMAGE, config.image_reference.clone());
    params.insert(NAMESPACE, namespace.to_string());
    params.insert(NAME, config.workload_name.clone());
    params
}

/// Substitutes `${TOKEN}` placeholders in a single pass.
///
/// Every referenced token must have a value. Values are inserted verbatim and
/// never scanned again, so a value containing `${...}` stays literal.
pub fn render(template: &str, params: &BTreeMap<&str, String>) -> Result<String, Error> {
    let mut output = String::with_capacity(template.len());
    let mut missing: BTreeSet<String> = BTreeSet::new();
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        output.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        match token_at(after) {
            Some(name) => {
                match params.get(name) {
                    Some(value) => output.push_str(value),
                    None => {
                        missing.insert(name.to_string());
                    }
                };
                rest = &after[name.len() + CLOSE.len_utf8()..];
            }
            None => {
                output.push_str(OPEN);
                rest = after;
            }
        }
    }
    output.push_str(rest);

    if !missing.is_empty() {
        return Err(Error::UnresolvedPlaceholder(missing.into_iter().collect()));
    }
    Ok(output)
}

/// Placeholder names a template references.
pub fn placeholders(template: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        match token_at(after) {
            Some(name) => {
                found.insert(name.to_string());
                rest = &after[name.len() + CLOSE.len_utf8()..];
            }
            None => rest = after,
        }
    }
    found
}

fn token_at(text: &str) -> Option<&str> {
    let end = text.find(CLOSE)?;
    let name = &text[..end];
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Some(name)
    } else {
        None
    }
}
