// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machine provisioning and state server quorum maintenance
//!
//! [`State`] is the entry point.  It turns caller-supplied
//! [`MachineTemplate`]s into machine records and keeps the set of state
//! servers (the replicated control-plane peers) consistent, using nothing but
//! the conditional, all-or-nothing transactions of a
//! [`fleet_docstore::DocStore`].
//!
//! Every mutating operation follows the same shape:
//!
//! 1. validate the request against environment policy (no store writes),
//! 2. allocate identifiers and build a list of [`fleet_docstore::Op`]s, each
//!    asserting the state it was computed from,
//! 3. commit those ops, together with an assertion that the environment is
//!    still alive, as one transaction.
//!
//! If a concurrent writer invalidates any assertion the whole transaction is
//! rejected and the caller gets [`Error::TransactionAborted`] (or
//! [`Error::EnvironmentNotAlive`] if that is why it failed).  Nothing here
//! retries on its own.

use fleet_common::constraints::Constraints;
use fleet_common::error::Error;
use fleet_common::error::LookupType;
use fleet_common::error::ResourceType;
use fleet_docstore::DocStore;
use fleet_docstore::Op;
use serde::de::DeserializeOwned;
use slog::{info, o, Logger};
use std::sync::Arc;

mod add_machine;
mod availability;
pub mod config;
mod environment;
mod machine;
mod policy;
mod sequence;
mod state_servers;
mod template;
mod topology;
mod transaction;

pub use environment::Environment;
pub use environment::Life;
pub use machine::InstanceData;
pub use machine::Machine;
pub use machine::MachineJob;
pub use machine::MachineStatus;
pub use policy::Policy;
pub use policy::Prechecker;
pub use state_servers::StateServerInfo;
pub use template::MachineTemplate;
pub use template::BOOTSTRAP_NONCE;

/// Names of the collections used by this crate
pub(crate) mod collections {
    pub const ENVIRONMENTS: &str = "environments";
    pub const MACHINES: &str = "machines";
    pub const CONTAINER_REFS: &str = "containerRefs";
    pub const CONSTRAINTS: &str = "constraints";
    pub const STATUSES: &str = "statuses";
    pub const INSTANCE_DATA: &str = "instanceData";
    pub const STATE_SERVERS: &str = "stateServers";
    pub const SEQUENCE: &str = "sequence";
}

/// Key of the environment document and of other per-environment singletons
pub(crate) const ENVIRON_GLOBAL_KEY: &str = "e";

/// Key under which per-machine sub-documents (constraints, status) are
/// stored
pub(crate) fn machine_global_key(id: &str) -> String {
    format!("m#{}", id)
}

/// Machine provisioning and state server maintenance for one environment
pub struct State {
    log: Logger,
    store: Arc<dyn DocStore>,
    max_peers: usize,
    policy: Option<Arc<dyn Policy>>,
}

impl State {
    /// Attaches to an environment that has already been initialized in
    /// `store`.
    ///
    /// Fails with [`Error::InvalidRequest`] if `quorum` is not usable.
    pub fn new(
        log: &Logger,
        store: Arc<dyn DocStore>,
        quorum: &config::QuorumConfig,
    ) -> Result<State, Error> {
        quorum.validate().map_err(|message| Error::invalid_request(&message))?;
        Ok(State {
            log: log.new(o!("component" => "State")),
            store,
            max_peers: quorum.max_peers,
            policy: None,
        })
    }

    /// Creates a new, empty environment in `store`.
    ///
    /// This inserts the environment document, the environment-wide
    /// constraints and an empty [`StateServerInfo`] in one transaction.  It
    /// fails with [`Error::ObjectAlreadyExists`] if the store already holds
    /// an environment.
    pub async fn initialize(
        log: &Logger,
        store: Arc<dyn DocStore>,
        quorum: &config::QuorumConfig,
        environ_constraints: &Constraints,
    ) -> Result<State, Error> {
        let state = State::new(log, store, quorum)?;
        let mut ops = vec![environment::insert_environment_op()?];
        ops.push(Op::insert(
            collections::CONSTRAINTS,
            ENVIRON_GLOBAL_KEY,
            environ_constraints,
        )?);
        ops.push(state_servers::insert_state_servers_op()?);
        state.store.run_transaction(ops).await.map_err(|error| {
            match error {
                fleet_docstore::Error::Aborted { .. } => {
                    Error::ObjectAlreadyExists {
                        type_name: ResourceType::Environment,
                        object_name: ENVIRON_GLOBAL_KEY.to_string(),
                    }
                }
                error => transaction::public_error_from_store(error),
            }
        })?;
        info!(state.log, "initialized environment";
            "constraints" => %environ_constraints);
        Ok(state)
    }

    /// Sets the policy consulted before new instances are provisioned.
    ///
    /// With no policy, every precheck succeeds.
    pub fn set_policy(&mut self, policy: Option<Arc<dyn Policy>>) {
        self.policy = policy;
    }

    /// Returns the replica-peer ceiling this `State` enforces.
    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Returns the environment-wide default constraints.
    pub async fn environ_constraints(&self) -> Result<Constraints, Error> {
        self.get_doc(
            collections::CONSTRAINTS,
            ENVIRON_GLOBAL_KEY,
            ResourceType::Constraints,
        )
        .await
    }

    /// Replaces the environment-wide default constraints.
    ///
    /// New machines pick these up for any constraint their template leaves
    /// unset; existing machines keep what they were created with.
    pub async fn set_environ_constraints(
        &self,
        cons: &Constraints,
    ) -> Result<(), Error> {
        let op = Op::update(
            collections::CONSTRAINTS,
            ENVIRON_GLOBAL_KEY,
            fleet_docstore::Assertion::DocExists,
            constraints_updates(cons)?,
        );
        self.commit(vec![op]).await?;
        info!(self.log, "set environment constraints";
            "constraints" => %cons);
        Ok(())
    }

    /// Fetches and deserializes one document, reporting a missing document as
    /// [`Error::ObjectNotFound`].
    pub(crate) async fn get_doc<T: DeserializeOwned>(
        &self,
        collection: &'static str,
        id: &str,
        type_name: ResourceType,
    ) -> Result<T, Error> {
        match self.get_doc_optional(collection, id).await? {
            Some(doc) => Ok(doc),
            None if id.starts_with("m#") || id == ENVIRON_GLOBAL_KEY => {
                Err(LookupType::ByGlobalKey(id.to_string())
                    .into_not_found(type_name))
            }
            None => Err(Error::not_found_by_id(type_name, id)),
        }
    }

    pub(crate) async fn get_doc_optional<T: DeserializeOwned>(
        &self,
        collection: &'static str,
        id: &str,
    ) -> Result<Option<T>, Error> {
        let doc = self
            .store
            .get(collection, id)
            .await
            .map_err(transaction::public_error_from_store)?;
        doc.map(|doc| serde_json::from_value(doc).map_err(Error::from))
            .transpose()
    }
}

/// Builds the updates that overwrite every field of a constraints document.
fn constraints_updates(
    cons: &Constraints,
) -> Result<Vec<fleet_docstore::Update>, Error> {
    const FIELDS: [&str; 7] = [
        "arch",
        "container",
        "cpu_cores",
        "cpu_power",
        "mem",
        "root_disk",
        "tags",
    ];
    let value = serde_json::to_value(cons)?;
    Ok(FIELDS
        .into_iter()
        .map(|field| fleet_docstore::Update::Set {
            field,
            value: value.get(field).cloned().unwrap_or_default(),
        })
        .collect())
}
