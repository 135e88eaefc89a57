// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for machine state integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use fleet_common::constraints::Constraints;
use fleet_docstore::DocStore;
use fleet_docstore::MemoryStore;
use fleet_docstore::Op;
use fleet_state::config::QuorumConfig;
use fleet_state::Prechecker;
use fleet_state::State;
use futures::lock::Mutex;
use serde_json::Value;
use slog::Logger;
use std::sync::Arc;

/// Creates a new environment with the given constraints in a fresh
/// in-memory store.
pub async fn state_setup(log: &Logger, environ_constraints: &str) -> State {
    let store = Arc::new(MemoryStore::new(log));
    state_setup_with_store(log, store, environ_constraints).await
}

pub async fn state_setup_with_store(
    log: &Logger,
    store: Arc<dyn DocStore>,
    environ_constraints: &str,
) -> State {
    State::initialize(
        log,
        store,
        &QuorumConfig::default(),
        &environ_constraints.parse().unwrap(),
    )
    .await
    .unwrap()
}

/// A store that commits another writer's transaction just before the next
/// transaction it is asked to run
pub struct Interloper {
    inner: MemoryStore,
    pending: Mutex<Option<Vec<Op>>>,
}

impl Interloper {
    pub fn new(log: &Logger) -> Interloper {
        Interloper { inner: MemoryStore::new(log), pending: Mutex::new(None) }
    }

    /// Arranges for `ops` to be committed ahead of the next transaction.
    pub async fn arm(&self, ops: Vec<Op>) {
        *self.pending.lock().await = Some(ops);
    }
}

#[async_trait]
impl DocStore for Interloper {
    async fn run_transaction(
        &self,
        ops: Vec<Op>,
    ) -> Result<(), fleet_docstore::Error> {
        let pending = self.pending.lock().await.take();
        if let Some(pending) = pending {
            self.inner.run_transaction(pending).await?;
        }
        self.inner.run_transaction(ops).await
    }

    async fn get(
        &self,
        collection: &'static str,
        id: &str,
    ) -> Result<Option<Value>, fleet_docstore::Error> {
        self.inner.get(collection, id).await
    }

    async fn list(
        &self,
        collection: &'static str,
    ) -> Result<Vec<Value>, fleet_docstore::Error> {
        self.inner.list(collection).await
    }

    async fn increment(
        &self,
        collection: &'static str,
        id: &str,
        field: &'static str,
    ) -> Result<u64, fleet_docstore::Error> {
        self.inner.increment(collection, id, field).await
    }
}

/// A prechecker that records what it was asked and refuses series listed in
/// `refuse`
#[derive(Default)]
pub struct RecordingPrechecker {
    pub calls: Mutex<Vec<(String, Constraints)>>,
    pub refuse: Vec<String>,
}

#[async_trait]
impl Prechecker for RecordingPrechecker {
    async fn precheck_instance(
        &self,
        series: &str,
        cons: &Constraints,
    ) -> anyhow::Result<()> {
        self.calls.lock().await.push((series.to_string(), cons.clone()));
        if self.refuse.iter().any(|s| s == series) {
            anyhow::bail!("series {} is not available", series);
        }
        Ok(())
    }
}

/// A policy that always hands out the same prechecker
pub struct StaticPolicy(pub Arc<RecordingPrechecker>);

impl fleet_state::Policy for StaticPolicy {
    fn prechecker(&self) -> anyhow::Result<Option<Arc<dyn Prechecker>>> {
        let prechecker: Arc<dyn Prechecker> = self.0.clone();
        Ok(Some(prechecker))
    }
}

/// Counts the documents in `collection`.
pub async fn count(store: &dyn DocStore, collection: &'static str) -> usize {
    store.list(collection).await.unwrap().len()
}
