//! The unordered-map capability model shared by the Registry's simplified
//! `(name, version)` variant and the Directory's general offer/query model.
//!
//! A capability is an unordered `{key: value}` map. A *query* matches an
//! *offer* iff every key in the query is present in the offer with the same
//! value — the offer may carry additional keys the query doesn't mention.

use std::collections::BTreeMap;

/// An unordered capability map, e.g. `{"type": "chat", "family": "llama"}`.
pub type Capability = BTreeMap<String, String>;

/// Returns whether `offer` is a superset of `query`: every key in `query`
/// is present in `offer` with the same value.
pub fn matches(query: &Capability, offer: &Capability) -> bool {
    query
        .iter()
        .all(|(k, v)| offer.get(k).is_some_and(|ov| ov == v))
}

/// Builds the two-key special case used when the Registry's `(name,
/// version)` addressing is expressed as a capability offer, e.g. for
/// publishing a Dispatcher's locally hosted models to the Directory.
pub fn model_capability(model_name: &str, model_version: &str) -> Capability {
    let mut cap = Capability::new();
    cap.insert("model_name".to_string(), model_name.to_string());
    if !model_version.is_empty() {
        cap.insert("model_version".to_string(), model_version.to_string());
    }
    cap
}
