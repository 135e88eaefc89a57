// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory implementation of [`DocStore`]

use crate::txn::apply_update;
use crate::AbortReason;
use crate::Assertion;
use crate::DocStore;
use crate::Effect;
use crate::Error;
use crate::Op;
use async_trait::async_trait;
use futures::lock::Mutex;
use serde_json::Value;
use slog::{debug, o, Logger};
use std::collections::BTreeMap;

type Collections = BTreeMap<&'static str, BTreeMap<String, Value>>;

/// A [`DocStore`] that keeps every collection in process memory
///
/// A single mutex serializes transactions, so each one observes a consistent
/// snapshot for all of its assertions.
pub struct MemoryStore {
    log: Logger,
    collections: Mutex<Collections>,
}

impl MemoryStore {
    pub fn new(log: &Logger) -> MemoryStore {
        MemoryStore {
            log: log.new(o!("component" => "MemoryStore")),
            collections: Mutex::new(BTreeMap::new()),
        }
    }
}

/// Checks every assertion against `collections` before anything is applied.
fn check_assertions(
    collections: &Collections,
    ops: &[Op],
) -> Result<(), Error> {
    for (index, op) in ops.iter().enumerate() {
        let doc = collections.get(op.collection).and_then(|c| c.get(&op.id));
        let reason = match (&op.assert, doc) {
            (Assertion::Any, _) => None,
            (Assertion::DocMissing, None) => None,
            (Assertion::DocMissing, Some(_)) => Some(AbortReason::DocExists),
            (Assertion::DocExists | Assertion::Fields(_), None) => {
                Some(AbortReason::DocMissing)
            }
            (Assertion::DocExists, Some(_)) => None,
            (Assertion::Fields(conditions), Some(doc)) => {
                if conditions.iter().all(|c| c.holds(doc)) {
                    None
                } else {
                    Some(AbortReason::ConditionFailed)
                }
            }
        };
        if let Some(reason) = reason {
            return Err(Error::Aborted {
                index,
                collection: op.collection.to_string(),
                id: op.id.clone(),
                reason,
            });
        }
    }
    Ok(())
}

/// Applies the effects of `ops`, in order, to `collections`.
fn apply_effects(
    collections: &mut Collections,
    ops: Vec<Op>,
) -> Result<(), Error> {
    for (index, op) in ops.into_iter().enumerate() {
        let invalid = |message: String| Error::InvalidOp {
            index,
            collection: op.collection.to_string(),
            id: op.id.clone(),
            message,
        };
        let collection = collections.entry(op.collection).or_default();
        match &op.effect {
            Effect::None => (),
            Effect::Insert(doc) => {
                if !doc.is_object() {
                    return Err(invalid(
                        "inserted document is not an object".into(),
                    ));
                }
                if collection.contains_key(&op.id) {
                    // Two inserts of the same document in one batch.
                    return Err(Error::Aborted {
                        index,
                        collection: op.collection.to_string(),
                        id: op.id.clone(),
                        reason: AbortReason::DocExists,
                    });
                }
                collection.insert(op.id.clone(), doc.clone());
            }
            Effect::Update(updates) => {
                let doc = collection.get_mut(&op.id).ok_or_else(|| {
                    invalid("update of missing document".into())
                })?;
                for update in updates {
                    apply_update(doc, update).map_err(&invalid)?;
                }
            }
            Effect::Remove => {
                collection.remove(&op.id);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl DocStore for MemoryStore {
    async fn run_transaction(&self, ops: Vec<Op>) -> Result<(), Error> {
        let mut collections = self.collections.lock().await;
        let nops = ops.len();
        if let Err(error) = check_assertions(&collections, &ops) {
            debug!(self.log, "transaction aborted";
                "ops" => nops, "error" => %error);
            return Err(error);
        }

        // Apply to a copy so that a failure partway through leaves the
        // committed state untouched.
        let mut updated = collections.clone();
        apply_effects(&mut updated, ops)?;
        *collections = updated;
        debug!(self.log, "transaction committed"; "ops" => nops);
        Ok(())
    }

    async fn get(
        &self,
        collection: &'static str,
        id: &str,
    ) -> Result<Option<Value>, Error> {
        let collections = self.collections.lock().await;
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn list(
        &self,
        collection: &'static str,
    ) -> Result<Vec<Value>, Error> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn increment(
        &self,
        collection: &'static str,
        id: &str,
        field: &'static str,
    ) -> Result<u64, Error> {
        let mut collections = self.collections.lock().await;
        let doc = collections
            .entry(collection)
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| serde_json::json!({ "_id": id }));
        let object = doc.as_object_mut().ok_or_else(|| Error::InvalidOp {
            index: 0,
            collection: collection.to_string(),
            id: id.to_string(),
            message: "document is not an object".to_string(),
        })?;
        let current = match object.get(field) {
            None => 0,
            Some(value) => value.as_u64().ok_or_else(|| Error::InvalidOp {
                index: 0,
                collection: collection.to_string(),
                id: id.to_string(),
                message: format!("field {:?} is not a counter", field),
            })?,
        };
        object.insert(field.to_string(), Value::from(current + 1));
        Ok(current)
    }
}
