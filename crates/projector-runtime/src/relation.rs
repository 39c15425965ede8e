#![forbid(unsafe_code)]

//! Relation views: repository relation queries cached on a dependency
//! signature.
//!
//! A relation view for `(source, id, target)` re-queries the repository only
//! when the [`RelationSignature`] of its two slots changed. Full related
//! data is memoized the same way against the store generation.
//!
//! Repository errors are logged and downgraded: relations are presentation
//! data.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use projector_core::{EntityId, EntityRepository, Record};
use serde_json::Value;

use crate::error::{ProjectionError, Result};
use crate::reactive::Memo;
use crate::store::ProjectionStore;

/// Cheap summary of the two slots a relation view depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelationSignature {
    pub source_generation: u64,
    pub target_generation: u64,
    pub source_len: usize,
    pub target_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RelationKey {
    source: String,
    id: EntityId,
    target: String,
}

type RelationCache =
    IndexMap<RelationKey, Memo<RelationSignature, Rc<[Record]>>, ahash::RandomState>;
type FullCache =
    IndexMap<(String, Option<EntityId>), Memo<u64, Option<Rc<Value>>>, ahash::RandomState>;

/// Cached relation queries of one scope.
pub struct RelationViews {
    repository: Rc<dyn EntityRepository>,
    store: ProjectionStore,
    capacity: usize,
    related: RefCell<RelationCache>,
    full: RefCell<FullCache>,
}

impl std::fmt::Debug for RelationViews {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationViews")
            .field("capacity", &self.capacity)
            .field("related", &self.related.borrow().len())
            .field("full", &self.full.borrow().len())
            .finish()
    }
}

/// Get the memo for `key`, inserting a fresh one and evicting the oldest
/// entries beyond `capacity`.
fn memo_for<K, M>(cache: &RefCell<IndexMap<K, M, ahash::RandomState>>, key: K, capacity: usize) -> M
where
    K: std::hash::Hash + Eq,
    M: Clone + Default,
{
    let mut cache = cache.borrow_mut();
    if let Some(memo) = cache.get(&key) {
        return memo.clone();
    }
    while cache.len() >= capacity {
        cache.shift_remove_index(0);
    }
    let memo = M::default();
    cache.insert(key, memo.clone());
    memo
}

impl RelationViews {
    pub(crate) fn new(
        repository: Rc<dyn EntityRepository>,
        store: ProjectionStore,
        capacity: usize,
    ) -> Self {
        Self {
            repository,
            store,
            capacity: capacity.max(1),
            related: RefCell::default(),
            full: RefCell::default(),
        }
    }

    fn ensure_registered(&self, type_name: &str) -> Result<()> {
        match self.store.descriptor(type_name) {
            Some(_) => Ok(()),
            None => Err(ProjectionError::unknown_type(type_name)),
        }
    }

    #[must_use]
    pub fn signature(&self, source: &str, target: &str) -> RelationSignature {
        RelationSignature {
            source_generation: self.store.slot_generation(source),
            target_generation: self.store.slot_generation(target),
            source_len: self.store.len(source),
            target_len: self.store.len(target),
        }
    }

    /// Records of `target` related to record `id` of `source`.
    ///
    /// Both types must be registered. Repository failures yield an empty
    /// result.
    pub fn related(&self, source: &str, id: &EntityId, target: &str) -> Result<Rc<[Record]>> {
        self.ensure_registered(source)?;
        self.ensure_registered(target)?;
        let key = RelationKey {
            source: source.to_owned(),
            id: id.clone(),
            target: target.to_owned(),
        };
        let memo = memo_for(&self.related, key, self.capacity);
        let signature = self.signature(source, target);
        Ok(memo.get_or_compute(signature, || {
            match self.repository.get_related(source, id, target) {
                Ok(records) => records.into(),
                Err(error) => {
                    tracing::debug!(
                        message = "projection.relation_fallback",
                        source_type = source,
                        target_type = target,
                        id = %id,
                        %error
                    );
                    Rc::from([])
                }
            }
        }))
    }

    /// The repository's full related data for `type_name`, optionally for
    /// one record. `None` when the repository cannot produce it.
    pub fn full_related(
        &self,
        type_name: &str,
        id: Option<&EntityId>,
    ) -> Result<Option<Rc<Value>>> {
        self.ensure_registered(type_name)?;
        let memo = memo_for(
            &self.full,
            (type_name.to_owned(), id.cloned()),
            self.capacity,
        );
        Ok(memo.get_or_compute(self.store.generation(), || {
            match self.repository.get_full_related_data(type_name, id) {
                Ok(value) => Some(Rc::new(value)),
                Err(error) => {
                    tracing::debug!(
                        message = "projection.full_related_fallback",
                        type_name,
                        %error
                    );
                    None
                }
            }
        }))
    }

    /// Number of cached relation views.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.related.borrow().len()
    }

    /// Drop every cached result.
    pub fn clear(&self) {
        self.related.borrow_mut().clear();
        self.full.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use projector_core::TypeDescriptor;
    use projector_harness::MemoryRepository;
    use serde_json::json;

    use crate::store::StoreAction;

    fn fixture(capacity: usize) -> (Rc<MemoryRepository>, ProjectionStore, RelationViews) {
        let descriptors = [
            TypeDescriptor::collection("author"),
            TypeDescriptor::collection("post"),
            TypeDescriptor::collection("tag"),
        ];
        let repo = MemoryRepository::new();
        for d in &descriptors {
            repo.register(d.clone());
        }
        repo.relate("author", "post", "id", "author_id");
        repo.merge_data("author", json!([{"id": 1}, {"id": 2}])).unwrap();
        repo.merge_data(
            "post",
            json!([{"id": 10, "author_id": 1}, {"id": 11, "author_id": 2}]),
        )
        .unwrap();
        let repo = Rc::new(repo);
        let store = ProjectionStore::new(&descriptors);
        let views = RelationViews::new(repo.clone(), store.clone(), capacity);
        (repo, store, views)
    }

    #[test]
    fn repeated_query_is_cached() {
        let (repo, _, views) = fixture(8);
        let a = views.related("author", &EntityId::from(1), "post").unwrap();
        let b = views.related("author", &EntityId::from(1), "post").unwrap();
        assert_eq!(a.len(), 1);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(repo.stats().related_queries, 1);
    }

    #[test]
    fn signature_change_requeries() {
        let (repo, store, views) = fixture(8);
        let a = views.related("author", &EntityId::from(1), "post").unwrap();
        store
            .reduce(StoreAction::SetData {
                type_name: "post".into(),
                data: json!([{"id": 10, "author_id": 1}]),
            })
            .unwrap();
        let b = views.related("author", &EntityId::from(1), "post").unwrap();
        assert!(!Rc::ptr_eq(&a, &b));
        assert_eq!(repo.stats().related_queries, 2);

        store
            .reduce(StoreAction::SetData {
                type_name: "tag".into(),
                data: json!([]),
            })
            .unwrap();
        views.related("author", &EntityId::from(1), "post").unwrap();
        assert_eq!(repo.stats().related_queries, 2);
    }

    #[test]
    fn undefined_relation_is_empty() {
        let (_, _, views) = fixture(8);
        let records = views.related("post", &EntityId::from(10), "tag").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn unregistered_type_is_misuse() {
        let (_, _, views) = fixture(8);
        assert!(matches!(
            views.related("author", &EntityId::from(1), "comment"),
            Err(ProjectionError::UnknownType { .. })
        ));
    }

    #[test]
    fn oldest_view_is_evicted() {
        let (repo, _, views) = fixture(2);
        views.related("author", &EntityId::from(1), "post").unwrap();
        views.related("author", &EntityId::from(2), "post").unwrap();
        views.related("post", &EntityId::from(10), "tag").unwrap();
        assert_eq!(views.cached(), 2);
        views.related("author", &EntityId::from(1), "post").unwrap();
        assert_eq!(repo.stats().related_queries, 4);
    }

    #[test]
    fn full_related_is_memoized_on_store_generation() {
        let (repo, store, views) = fixture(8);
        let a = views.full_related("author", Some(&EntityId::from(1))).unwrap();
        let b = views.full_related("author", Some(&EntityId::from(1))).unwrap();
        assert!(a.is_some());
        assert_eq!(repo.stats().full_related_queries, 1);
        assert_eq!(a, b);

        store
            .reduce(StoreAction::SetData {
                type_name: "author".into(),
                data: json!([]),
            })
            .unwrap();
        views.full_related("author", Some(&EntityId::from(1))).unwrap();
        assert_eq!(repo.stats().full_related_queries, 2);
    }

    #[test]
    fn full_related_error_is_none() {
        let (_, _, views) = fixture(8);
        assert_eq!(
            views.full_related("author", Some(&EntityId::from(99))).unwrap(),
            None
        );
    }
}
