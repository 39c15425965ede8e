#![forbid(unsafe_code)]

//! Batched message dispatch with optional per-type callbacks.
//!
//! [`Dispatcher::dispatch`] forwards a batch to the repository in one call.
//! Once the repository has merged it (and emitted the batch the
//! multiplexer applies), each callback registered for a type that appears
//! in the batch is invoked once with that type's post-merge data, read back
//! from the repository:
//!
//! - collection: the records the batch touched, with deleted ids listed in
//!   `removed`; a `null` payload (clear) reports every remaining record,
//! - singleton: the current record.

use std::rc::Rc;

use ahash::AHashMap;
use indexmap::IndexMap;
use projector_core::{
    EntityId, EntityRepository, Message, StorageKind, TypeDescriptor, TypedPayload,
};
use serde_json::Value;

use crate::error::{ProjectionError, Result};

type PayloadCallback = Box<dyn Fn(&TypedPayload)>;

/// Per-type callbacks for one dispatch.
#[derive(Default)]
pub struct DispatchCallbacks {
    callbacks: AHashMap<String, PayloadCallback>,
}

impl std::fmt::Debug for DispatchCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.callbacks.keys()).finish()
    }
}

impl DispatchCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` with the post-merge data of `type_name`. A second
    /// registration for the same type replaces the first.
    #[must_use]
    pub fn on(
        mut self,
        type_name: impl Into<String>,
        callback: impl Fn(&TypedPayload) + 'static,
    ) -> Self {
        self.callbacks.insert(type_name.into(), Box::new(callback));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// What one batch did to a collection type, per id (last write wins). Once
/// the type is cleared the callback gets a snapshot, so later ids are not
/// tracked.
#[derive(Default)]
struct Touched {
    ids: IndexMap<EntityId, bool, ahash::RandomState>,
    cleared: bool,
}

impl Touched {
    fn record(&mut self, descriptor: &TypeDescriptor, payload: &Value) {
        if self.cleared {
            return;
        }
        match payload {
            Value::Array(items) => {
                for item in items {
                    if let Some(id) = EntityId::of_record(item, &descriptor.id_field) {
                        self.ids.insert(id, false);
                    }
                }
            }
            Value::Object(entries) => {
                for (key, value) in entries {
                    self.ids.insert(EntityId::from(key.as_str()), value.is_null());
                }
            }
            Value::Null => {
                self.cleared = true;
                self.ids.clear();
            }
            _ => {}
        }
    }
}

/// Dispatch binding of a scope.
#[derive(Clone)]
pub struct Dispatcher {
    repository: Rc<dyn EntityRepository>,
    descriptors: Rc<AHashMap<String, TypeDescriptor>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("types", &self.descriptors.len())
            .finish()
    }
}

impl Dispatcher {
    pub(crate) fn new(
        repository: Rc<dyn EntityRepository>,
        descriptors: Rc<AHashMap<String, TypeDescriptor>>,
    ) -> Self {
        Self {
            repository,
            descriptors,
        }
    }

    /// Forward `messages` to the repository in one call, then run the
    /// callbacks of the types the batch touched.
    ///
    /// Callbacks naming unregistered types are rejected before anything is
    /// sent. A repository error is returned before any callback runs.
    pub fn dispatch(
        &self,
        messages: Vec<Message>,
        callbacks: Option<&DispatchCallbacks>,
    ) -> Result<()> {
        let callbacks = callbacks.filter(|c| !c.is_empty());
        if let Some(callbacks) = callbacks
            && let Some(unknown) = callbacks
                .callbacks
                .keys()
                .find(|name| !self.descriptors.contains_key(*name))
        {
            return Err(ProjectionError::unknown_type(unknown.as_str()));
        }

        let mut touched: IndexMap<String, Touched, ahash::RandomState> = IndexMap::default();
        if let Some(callbacks) = callbacks {
            for message in &messages {
                if !callbacks.callbacks.contains_key(&message.type_name) {
                    continue;
                }
                let Some(descriptor) = self.descriptors.get(&message.type_name) else {
                    continue;
                };
                touched
                    .entry(message.type_name.clone())
                    .or_default()
                    .record(descriptor, &message.payload);
            }
        }

        self.repository.dispatch_batch(messages)?;

        let Some(callbacks) = callbacks else {
            return Ok(());
        };
        for (type_name, touched) in touched {
            let (Some(callback), Some(descriptor)) = (
                callbacks.callbacks.get(&type_name),
                self.descriptors.get(&type_name),
            ) else {
                continue;
            };
            callback(&self.read_back(descriptor, touched));
        }
        Ok(())
    }

    fn read_back(&self, descriptor: &TypeDescriptor, touched: Touched) -> TypedPayload {
        match descriptor.storage {
            StorageKind::Singleton => TypedPayload::Singleton(
                self.repository
                    .find_all(&descriptor.name)
                    .into_iter()
                    .next()
                    .map(Rc::new),
            ),
            StorageKind::Collection if touched.cleared => TypedPayload::Collection {
                records: self
                    .repository
                    .find_all(&descriptor.name)
                    .into_iter()
                    .map(Rc::new)
                    .collect(),
                removed: Vec::new(),
                snapshot: true,
            },
            StorageKind::Collection => {
                let mut records = Vec::new();
                let mut removed = Vec::new();
                for (id, deleted) in touched.ids {
                    match self.repository.find_by_id(&descriptor.name, &id) {
                        Some(record) if !deleted => records.push(Rc::new(record)),
                        _ if deleted => removed.push(id),
                        _ => {}
                    }
                }
                TypedPayload::Collection {
                    records,
                    removed,
                    snapshot: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use projector_harness::MemoryRepository;
    use serde_json::json;
    use std::cell::RefCell;

    fn fixture() -> (Rc<MemoryRepository>, Dispatcher) {
        let descriptors = [
            TypeDescriptor::collection("user"),
            TypeDescriptor::singleton("session"),
        ];
        let repo = Rc::new(
            MemoryRepository::new()
                .with_type(descriptors[0].clone())
                .with_type(descriptors[1].clone()),
        );
        let table = descriptors
            .iter()
            .map(|d| (d.name.clone(), d.clone()))
            .collect();
        (repo.clone(), Dispatcher::new(repo, Rc::new(table)))
    }

    #[test]
    fn dispatch_without_callbacks() {
        let (repo, dispatcher) = fixture();
        dispatcher
            .dispatch(vec![Message::new("user", json!([{"id": 1}]))], None)
            .unwrap();
        assert_eq!(repo.find_all("user").len(), 1);
        assert_eq!(repo.stats().dispatches, 1);
    }

    #[test]
    fn callbacks_see_post_merge_data() {
        let (repo, dispatcher) = fixture();
        repo.merge_data("user", json!([{"id": 1, "name": "A", "age": 3}]))
            .unwrap();

        let users: Rc<RefCell<Vec<TypedPayload>>> = Rc::default();
        let sessions: Rc<RefCell<Vec<TypedPayload>>> = Rc::default();
        let (u, s) = (Rc::clone(&users), Rc::clone(&sessions));
        let callbacks = DispatchCallbacks::new()
            .on("user", move |p| u.borrow_mut().push(p.clone()))
            .on("session", move |p| s.borrow_mut().push(p.clone()));

        dispatcher
            .dispatch(
                vec![
                    Message::new("user", json!({"1": {"name": "B"}})),
                    Message::new("user", json!([{"id": 2}])),
                ],
                Some(&callbacks),
            )
            .unwrap();

        let users = users.borrow();
        assert_eq!(users.len(), 1);
        let records = users[0].records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], "B");
        assert_eq!(records[0]["age"], 3);
        assert!(sessions.borrow().is_empty());
    }

    #[test]
    fn removed_ids_are_reported() {
        let (repo, dispatcher) = fixture();
        repo.merge_data("user", json!([{"id": 1}, {"id": 2}])).unwrap();
        let seen: Rc<RefCell<Option<TypedPayload>>> = Rc::default();
        let s = Rc::clone(&seen);
        let callbacks =
            DispatchCallbacks::new().on("user", move |p| *s.borrow_mut() = Some(p.clone()));
        dispatcher
            .dispatch(vec![Message::new("user", json!({"1": null}))], Some(&callbacks))
            .unwrap();
        match seen.borrow().as_ref() {
            Some(TypedPayload::Collection {
                records, removed, ..
            }) => {
                assert!(records.is_empty());
                assert_eq!(removed, &vec![EntityId::from(1)]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn singleton_callback_gets_current_record() {
        let (_, dispatcher) = fixture();
        let seen: Rc<RefCell<Option<TypedPayload>>> = Rc::default();
        let s = Rc::clone(&seen);
        let callbacks =
            DispatchCallbacks::new().on("session", move |p| *s.borrow_mut() = Some(p.clone()));
        dispatcher
            .dispatch(
                vec![Message::new("session", json!({"token": "t"}))],
                Some(&callbacks),
            )
            .unwrap();
        let seen = seen.borrow();
        let record = seen.as_ref().and_then(TypedPayload::single).unwrap();
        assert_eq!(record["token"], "t");
    }

    #[test]
    fn repository_error_skips_callbacks() {
        let (_, dispatcher) = fixture();
        let called = Rc::new(std::cell::Cell::new(false));
        let c = Rc::clone(&called);
        let callbacks = DispatchCallbacks::new().on("user", move |_| c.set(true));
        let err = dispatcher
            .dispatch(
                vec![
                    Message::new("user", json!([{"id": 1}])),
                    Message::new("ghost", json!([])),
                ],
                Some(&callbacks),
            )
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Repository(_)));
        assert!(!called.get());
    }

    #[test]
    fn callback_for_unregistered_type_is_misuse() {
        let (repo, dispatcher) = fixture();
        let callbacks = DispatchCallbacks::new().on("ghost", |_| {});
        assert!(matches!(
            dispatcher.dispatch(Vec::new(), Some(&callbacks)),
            Err(ProjectionError::UnknownType { .. })
        ));
        assert_eq!(repo.stats().dispatches, 0);
    }

    #[test]
    fn clear_then_add_reports_a_snapshot() {
        let (repo, dispatcher) = fixture();
        repo.merge_data("user", json!([{"id": 1}, {"id": 2}])).unwrap();
        let seen: Rc<RefCell<Option<TypedPayload>>> = Rc::default();
        let s = Rc::clone(&seen);
        let callbacks =
            DispatchCallbacks::new().on("user", move |p| *s.borrow_mut() = Some(p.clone()));
        dispatcher
            .dispatch(
                vec![
                    Message::new("user", json!(null)),
                    Message::new("user", json!([{"id": 3}])),
                ],
                Some(&callbacks),
            )
            .unwrap();

        assert_eq!(repo.find_all("user"), vec![json!({"id": 3})]);
        match seen.borrow().as_ref() {
            Some(TypedPayload::Collection {
                records,
                removed,
                snapshot,
            }) => {
                assert!(*snapshot);
                assert!(removed.is_empty());
                assert_eq!(records.len(), 1);
                assert_eq!(records[0]["id"], 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
