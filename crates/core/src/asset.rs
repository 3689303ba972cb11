//! Assets and the selector expressions contract definitions use to pick them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::Operator;

/// Property key that resolves to the asset's id.
pub const ASSET_ID_PROPERTY: &str = "asset:prop:id";

/// A data asset offered by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl Asset {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Resolve a property by key. `asset:prop:id` always resolves to the id.
    pub fn property(&self, key: &str) -> Option<String> {
        if key == ASSET_ID_PROPERTY {
            return Some(self.id.clone());
        }
        match self.properties.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// One selector criterion: `property operator value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub left: String,
    pub operator: Operator,
    pub right: Value,
}

impl Criterion {
    pub fn new(left: impl Into<String>, operator: Operator, right: impl Into<Value>) -> Self {
        Self {
            left: left.into(),
            operator,
            right: right.into(),
        }
    }

    fn matches(&self, asset: &Asset) -> bool {
        asset
            .property(&self.left)
            .is_some_and(|value| self.operator.apply(&value, &self.right))
    }
}

/// A conjunction of criteria. The empty selector matches every asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetSelectorExpression {
    pub criteria: Vec<Criterion>,
}

impl AssetSelectorExpression {
    pub fn select_all() -> Self {
        Self::default()
    }

    /// Selector matching exactly the asset with the given id.
    pub fn for_asset(asset_id: impl Into<String>) -> Self {
        Self {
            criteria: vec![Criterion::new(
                ASSET_ID_PROPERTY,
                Operator::Eq,
                Value::String(asset_id.into()),
            )],
        }
    }

    pub fn matches(&self, asset: &Asset) -> bool {
        self.criteria.iter().all(|c| c.matches(asset))
    }
}
