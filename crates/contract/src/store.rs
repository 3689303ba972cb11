//! Read-side collaborators: where definitions and assets come from.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use connector_core::{Asset, AssetSelectorExpression, ContractDefinition};

/// Source of the provider's contract definitions.
pub trait ContractDefinitionStore: Send + Sync {
    fn find_all(&self) -> Vec<ContractDefinition>;

    fn find_by_id(&self, id: &str) -> Option<ContractDefinition> {
        self.find_all().into_iter().find(|d| d.id == id)
    }
}

/// Source of the provider's assets.
pub trait AssetIndex: Send + Sync {
    /// Assets matching the selector, ordered by id.
    fn query(&self, selector: &AssetSelectorExpression) -> Vec<Asset>;

    fn find_by_id(&self, id: &str) -> Option<Asset>;
}

/// Definitions held in memory, in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryDefinitionStore {
    definitions: RwLock<Vec<ContractDefinition>>,
}

impl InMemoryDefinitionStore {
    pub fn new(definitions: Vec<ContractDefinition>) -> Self {
        Self {
            definitions: RwLock::new(definitions),
        }
    }

    /// Store a definition. Definitions are immutable once stored, so a
    /// duplicate id is refused and `false` returned.
    pub fn save(&self, definition: ContractDefinition) -> bool {
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if definitions.iter().any(|d| d.id == definition.id) {
            return false;
        }
        definitions.push(definition);
        true
    }
}

impl ContractDefinitionStore for InMemoryDefinitionStore {
    fn find_all(&self) -> Vec<ContractDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Assets held in memory, keyed by id.
#[derive(Debug, Default)]
pub struct InMemoryAssetIndex {
    assets: RwLock<BTreeMap<String, Asset>>,
}

impl InMemoryAssetIndex {
    pub fn new(assets: impl IntoIterator<Item = Asset>) -> Self {
        let index = Self::default();
        for asset in assets {
            index.insert(asset);
        }
        index
    }

    pub fn insert(&self, asset: Asset) {
        self.assets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(asset.id.clone(), asset);
    }
}

impl AssetIndex for InMemoryAssetIndex {
    fn query(&self, selector: &AssetSelectorExpression) -> Vec<Asset> {
        self.assets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|a| selector.matches(a))
            .cloned()
            .collect()
    }

    fn find_by_id(&self, id: &str) -> Option<Asset> {
        self.assets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connector_core::{Criterion, Operator, Policy};

    fn definition(id: &str) -> ContractDefinition {
        ContractDefinition {
            id: id.to_string(),
            access_policy: Policy::permit_all(),
            contract_policy: Policy::permit_all(),
            selector: AssetSelectorExpression::select_all(),
        }
    }

    #[test]
    fn definitions_are_immutable_once_saved() {
        let store = InMemoryDefinitionStore::default();
        assert!(store.save(definition("d1")));
        assert!(!store.save(definition("d1")));
        assert_eq!(store.find_all().len(), 1);
        assert!(store.find_by_id("d1").is_some());
        assert!(store.find_by_id("d2").is_none());
    }

    #[test]
    fn asset_query_applies_selector() {
        let index = InMemoryAssetIndex::new([
            Asset::new("a2").with_property("type", "csv"),
            Asset::new("a1").with_property("type", "csv"),
            Asset::new("a3").with_property("type", "json"),
        ]);
        let csv = AssetSelectorExpression {
            criteria: vec![Criterion::new("type", Operator::Eq, "csv")],
        };
        let ids: Vec<String> = index.query(&csv).into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert_eq!(index.query(&AssetSelectorExpression::select_all()).len(), 3);
    }
}
