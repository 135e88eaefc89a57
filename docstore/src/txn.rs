// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operations that make up a transaction
//!
//! Each [`Op`] names one document (by collection and id), carries an
//! [`Assertion`] about that document's current contents, and an [`Effect`] to
//! apply if every assertion in the transaction holds.

use serde::Serialize;
use serde_json::Value;

/// A single conditional mutation of one document
#[derive(Clone, Debug, PartialEq)]
pub struct Op {
    pub collection: &'static str,
    pub id: String,
    pub assert: Assertion,
    pub effect: Effect,
}

/// Precondition on the document named by an [`Op`]
#[derive(Clone, Debug, PartialEq)]
pub enum Assertion {
    /// No precondition.
    Any,
    /// The document must not exist.
    DocMissing,
    /// The document must exist.
    DocExists,
    /// The document must exist and satisfy every condition.
    Fields(Vec<FieldCondition>),
}

/// A condition on a top-level field of a document
///
/// A missing field compares as `null`.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldCondition {
    Eq { field: &'static str, value: Value },
    Ne { field: &'static str, value: Value },
    /// The field is an array with exactly `len` elements.
    Size { field: &'static str, len: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Only check the assertion.
    None,
    Insert(Value),
    Update(Vec<Update>),
    Remove,
}

/// A modification of a top-level field of an existing document
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    Set { field: &'static str, value: Value },
    /// Append each value that the array does not already contain.
    AddToSet { field: &'static str, values: Vec<Value> },
    Push { field: &'static str, values: Vec<Value> },
}

impl Op {
    /// Inserts `doc`, asserting that no document with this id exists.
    pub fn insert<T: Serialize>(
        collection: &'static str,
        id: impl Into<String>,
        doc: &T,
    ) -> Result<Op, serde_json::Error> {
        Ok(Op {
            collection,
            id: id.into(),
            assert: Assertion::DocMissing,
            effect: Effect::Insert(serde_json::to_value(doc)?),
        })
    }

    /// Applies `updates` if `assert` holds.
    pub fn update(
        collection: &'static str,
        id: impl Into<String>,
        assert: Assertion,
        updates: Vec<Update>,
    ) -> Op {
        Op {
            collection,
            id: id.into(),
            assert,
            effect: Effect::Update(updates),
        }
    }

    /// Checks `assert` without changing anything.
    pub fn assert(
        collection: &'static str,
        id: impl Into<String>,
        assert: Assertion,
    ) -> Op {
        Op { collection, id: id.into(), assert, effect: Effect::None }
    }

    pub fn remove(
        collection: &'static str,
        id: impl Into<String>,
        assert: Assertion,
    ) -> Op {
        Op { collection, id: id.into(), assert, effect: Effect::Remove }
    }
}

impl FieldCondition {
    pub(crate) fn holds(&self, doc: &Value) -> bool {
        match self {
            FieldCondition::Eq { field, value } => {
                field_of(doc, field) == value
            }
            FieldCondition::Ne { field, value } => {
                field_of(doc, field) != value
            }
            FieldCondition::Size { field, len } => matches!(
                field_of(doc, field),
                Value::Array(a) if a.len() == *len
            ),
        }
    }
}

fn field_of<'a>(doc: &'a Value, field: &str) -> &'a Value {
    doc.get(field).unwrap_or(&Value::Null)
}

/// Applies `update` to `doc`, returning a description of the problem if the
/// update does not fit the document's shape.
pub(crate) fn apply_update(
    doc: &mut Value,
    update: &Update,
) -> Result<(), String> {
    let object = doc
        .as_object_mut()
        .ok_or_else(|| String::from("document is not an object"))?;
    match update {
        Update::Set { field, value } => {
            object.insert(field.to_string(), value.clone());
        }
        Update::AddToSet { field, values } | Update::Push { field, values } => {
            let slot = object
                .entry(field.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if slot.is_null() {
                *slot = Value::Array(Vec::new());
            }
            let array = slot.as_array_mut().ok_or_else(|| {
                format!("field {:?} is not an array", field)
            })?;
            let dedup = matches!(update, Update::AddToSet { .. });
            for value in values {
                if !dedup || !array.contains(value) {
                    array.push(value.clone());
                }
            }
        }
    }
    Ok(())
}
