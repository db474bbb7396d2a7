//! Collection catalog: current document state plus per-collection pre-image
//! recording configuration.
//!
//! Collections are addressed by a stable [`CollectionId`] so that renames do
//! not change the identity recorded in pre-images or log annotations.

use crate::record::{CollectionId, DocumentId};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub body: Value,
}

#[derive(Debug)]
pub struct Collection {
    name: String,
    preimages_enabled: bool,
    documents: BTreeMap<DocumentId, Document>,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn preimages_enabled(&self) -> bool {
        self.preimages_enabled
    }

    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub(crate) fn upsert(&mut self, document: Document) {
        self.documents.insert(document.id.clone(), document);
    }

    pub(crate) fn remove(&mut self, id: &DocumentId) -> Option<Document> {
        self.documents.remove(id)
    }
}

#[derive(Debug, Default)]
pub struct CollectionCatalog {
    collections: BTreeMap<CollectionId, Collection>,
    next_id: u64,
}

impl CollectionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, name: impl Into<String>, preimages_enabled: bool) -> CollectionId {
        let id = CollectionId(self.next_id);
        self.next_id += 1;
        let name = name.into();
        info!(
            "event=collection_created collection={} name={} preimages_enabled={}",
            id.0, name, preimages_enabled
        );
        self.collections.insert(
            id,
            Collection {
                name,
                preimages_enabled,
                documents: BTreeMap::new(),
            },
        );
        id
    }

    /// Registers a collection under a caller-chosen identity. Used when a
    /// resyncing node clones the source catalog and must keep identities
    /// byte-identical to the source.
    pub fn register(
        &mut self,
        id: CollectionId,
        name: impl Into<String>,
        preimages_enabled: bool,
    ) -> Result<(), CatalogError> {
        if self.collections.contains_key(&id) {
            return Err(CatalogError::IdentityInUse { id });
        }
        self.next_id = self.next_id.max(id.0 + 1);
        self.collections.insert(
            id,
            Collection {
                name: name.into(),
                preimages_enabled,
                documents: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn get(&self, id: CollectionId) -> Result<&Collection, CatalogError> {
        self.collections
            .get(&id)
            .ok_or(CatalogError::UnknownCollection { id })
    }

    pub(crate) fn get_mut(&mut self, id: CollectionId) -> Result<&mut Collection, CatalogError> {
        self.collections
            .get_mut(&id)
            .ok_or(CatalogError::UnknownCollection { id })
    }

    /// Renames a collection. The identity, and therefore every recorded
    /// pre-image referencing it, is unaffected.
    pub fn rename(&mut self, id: CollectionId, name: impl Into<String>) -> Result<(), CatalogError> {
        let collection = self.get_mut(id)?;
        let name = name.into();
        info!(
            "event=collection_renamed collection={} from={} to={}",
            id.0, collection.name, name
        );
        collection.name = name;
        Ok(())
    }

    pub fn set_preimages_enabled(
        &mut self,
        id: CollectionId,
        enabled: bool,
    ) -> Result<(), CatalogError> {
        let collection = self.get_mut(id)?;
        info!(
            "event=preimages_config_changed collection={} enabled={}",
            id.0, enabled
        );
        collection.preimages_enabled = enabled;
        Ok(())
    }

    pub fn drop(&mut self, id: CollectionId) -> Result<(), CatalogError> {
        self.collections
            .remove(&id)
            .map(|_| ())
            .ok_or(CatalogError::UnknownCollection { id })
    }

    pub fn ids(&self) -> impl Iterator<Item = CollectionId> + '_ {
        self.collections.keys().copied()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown collection identity {}", id.0)]
    UnknownCollection { id: CollectionId },
    #[error("collection identity {} already registered", id.0)]
    IdentityInUse { id: CollectionId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_survives_rename() {
        let mut catalog = CollectionCatalog::new();
        let id = catalog.create("orders", true);
        catalog.rename(id, "orders_v2").unwrap();
        let collection = catalog.get(id).unwrap();
        assert_eq!(collection.name(), "orders_v2");
        assert!(collection.preimages_enabled());
    }

    #[test]
    fn register_rejects_duplicate_identity() {
        let mut catalog = CollectionCatalog::new();
        catalog.register(CollectionId(9), "orders", true).unwrap();
        let err = catalog.register(CollectionId(9), "other", false).unwrap_err();
        assert_eq!(err, CatalogError::IdentityInUse { id: CollectionId(9) });
        // Fresh identities allocated afterwards must not collide.
        let fresh = catalog.create("fresh", false);
        assert!(fresh.0 > 9);
    }

    #[test]
    fn upsert_and_remove_round_trip() {
        let mut catalog = CollectionCatalog::new();
        let id = catalog.create("orders", true);
        let doc = Document {
            id: DocumentId::new("a"),
            body: json!({"_id": "a", "v": 1}),
        };
        catalog.get_mut(id).unwrap().upsert(doc.clone());
        assert_eq!(catalog.get(id).unwrap().get(&doc.id), Some(&doc));
        assert!(catalog.get_mut(id).unwrap().remove(&doc.id).is_some());
        assert!(catalog.get(id).unwrap().is_empty());
    }
}
