// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transactional document store
//!
//! The control plane keeps its records as JSON documents grouped into named
//! collections.  The only way to change them is
//! [`DocStore::run_transaction()`]: a batch of [`Op`]s, each asserting
//! something about one document and proposing an effect on it.  Either every
//! assertion holds and every effect is applied, or nothing changes and the
//! caller gets [`Error::Aborted`] naming the first assertion that failed.
//! There are no locks; callers that lose a race re-read and recompute.

use async_trait::async_trait;
use serde_json::Value;

mod memory;
mod txn;

pub use memory::MemoryStore;
pub use txn::Assertion;
pub use txn::Effect;
pub use txn::FieldCondition;
pub use txn::Op;
pub use txn::Update;

/// Why an assertion failed
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AbortReason {
    /// The document was asserted missing but exists.
    DocExists,
    /// The document was asserted to exist but does not.
    DocMissing,
    /// The document exists but a field condition does not hold.
    ConditionFailed,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error(
        "transaction aborted: op {index} on {collection}/{id}: {reason}"
    )]
    Aborted {
        index: usize,
        collection: String,
        id: String,
        reason: AbortReason,
    },
    #[error("invalid op {index} on {collection}/{id}: {message}")]
    InvalidOp { index: usize, collection: String, id: String, message: String },
    #[error("document store unavailable: {0}")]
    Unavailable(String),
}

/// The document store primitive the control plane is built on
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Atomically applies `ops` if all of their assertions hold.
    async fn run_transaction(&self, ops: Vec<Op>) -> Result<(), Error>;

    /// Fetches one document.
    async fn get(
        &self,
        collection: &'static str,
        id: &str,
    ) -> Result<Option<Value>, Error>;

    /// Fetches every document in a collection, ordered by id.
    async fn list(
        &self,
        collection: &'static str,
    ) -> Result<Vec<Value>, Error>;

    /// Atomically increments the integer `field` of a document, creating the
    /// document with the field at zero if needed, and returns the value from
    /// before the increment.
    async fn increment(
        &self,
        collection: &'static str,
        id: &str,
        field: &'static str,
    ) -> Result<u64, Error>;
}
