//! Label selector evaluation

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::BTreeMap;

/// Evaluate a label selector against a label set.
///
/// A selector without requirements matches everything.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(key, value)| labels.get(key) == Some(value));

    labels_match
        && selector
            .match_expressions
            .iter()
            .flatten()
            .all(|req| requirement_matches(req, labels))
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    let current = labels.get(&req.key);

    match req.operator.as_str() {
        "In" => current.is_some_and(|v| values.contains(v)),
        "NotIn" => current.map_or(true, |v| !values.contains(v)),
        "Exists" => current.is_some(),
        "DoesNotExist" => current.is_none(),
        _ => false,
    }
}
