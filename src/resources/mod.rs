//! Typed infrastructure components — each wraps a subgraph of resource nodes
//! behind a curated output contract.

pub mod addons;
pub mod cluster;
pub mod edge;
pub mod network;
pub mod registry;
pub mod storage;

use indexmap::IndexMap;
use serde_json::Value;

use crate::core::value::{literal, Input};

/// Build an ordered input map from (name, cell) pairs.
pub(crate) fn input_map<const N: usize>(pairs: [(&str, Input); N]) -> IndexMap<String, Input> {
    let mut map = IndexMap::new();
    for (k, v) in pairs {
        map.insert(k.to_string(), v);
    }
    map
}

/// Merge base tags plus extras into a JSON tags object input.
pub(crate) fn tag_value(base: &IndexMap<String, String>, extra: &[(&str, &str)]) -> Input {
    let mut tags = serde_json::Map::new();
    tags.insert("managedBy".to_string(), Value::String("stratus".to_string()));
    for (k, v) in base {
        tags.insert(k.clone(), Value::String(v.clone()));
    }
    for (k, v) in extra {
        tags.insert(k.to_string(), Value::String(v.to_string()));
    }
    literal(Value::Object(tags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_value_merges_with_extras_last() {
        let mut base = IndexMap::new();
        base.insert("app".to_string(), "chatbot".to_string());
        base.insert("env".to_string(), "dev".to_string());
        let tags = tag_value(&base, &[("env", "prod"), ("component", "network")]);
        let value = tags.try_get().unwrap().unwrap();
        assert_eq!(value["managedBy"], json!("stratus"));
        assert_eq!(value["app"], json!("chatbot"));
        assert_eq!(value["env"], json!("prod"), "extras override base tags");
        assert_eq!(value["component"], json!("network"));
    }
}
