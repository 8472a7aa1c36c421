//! Fetch targets and their field/item mappings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Downstream binding for one bulletin row key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemMapping {
    /// Downstream instrument name.
    pub ric: String,
    /// Opaque label carried for diagnostics.
    pub topic: String,
}

/// One fetch target: an upstream path plus the column and row mappings
/// applied to every bulletin it returns. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Human label, unique across the configuration.
    pub name: String,
    /// Feed family tag, published as SF_NAME.
    pub source: String,
    /// Path appended to `base_url`; the composed URL is in `url`.
    pub path: String,
    /// Full fetch URL, composed at load time from `base_url` + `path`.
    #[serde(skip)]
    pub url: String,
    /// Entitlement code carried in the permission lock.
    pub entitlement_code: u32,
    /// Column label to field-id.
    pub fields: HashMap<String, i32>,
    /// Row key (sector) to downstream item.
    pub items: HashMap<String, ItemMapping>,
}

impl Resource {
    /// Field-ids must be unique within a resource; returns the first
    /// duplicated id if any.
    pub fn duplicate_field_id(&self) -> Option<i32> {
        let mut seen = std::collections::HashSet::new();
        self.fields.values().find(|fid| !seen.insert(**fid)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource_with_fields(fields: &[(&str, i32)]) -> Resource {
        Resource {
            name: "equities".to_string(),
            source: "MarketPsych".to_string(),
            path: "/equities.n1".to_string(),
            url: String::new(),
            entitlement_code: 29,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            items: HashMap::new(),
        }
    }

    #[test]
    fn test_unique_field_ids() {
        let r = resource_with_fields(&[("Buzz", 7001), ("Sentiment", 7002)]);
        assert_eq!(r.duplicate_field_id(), None);
    }

    #[test]
    fn test_duplicate_field_id_detected() {
        let r = resource_with_fields(&[("Buzz", 7001), ("Sentiment", 7001)]);
        assert_eq!(r.duplicate_field_id(), Some(7001));
    }
}
