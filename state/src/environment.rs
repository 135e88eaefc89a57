// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The environment document and its lifecycle

use crate::collections;
use crate::transaction::public_error_from_store;
use crate::State;
use crate::ENVIRON_GLOBAL_KEY;
use fleet_common::error::Error;
use fleet_common::error::LookupType;
use fleet_common::error::ResourceType;
use fleet_docstore::Assertion;
use fleet_docstore::DocStore;
use fleet_docstore::FieldCondition;
use fleet_docstore::Op;
use fleet_docstore::Update;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle state shared by environments and machines
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    /// The stored form of this value, for use in field assertions
    pub(crate) fn as_value(self) -> serde_json::Value {
        serde_json::Value::String(self.to_string())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct EnvironmentDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub uuid: Uuid,
    pub life: Life,
}

pub(crate) fn insert_environment_op() -> Result<Op, Error> {
    let doc = EnvironmentDoc {
        id: ENVIRON_GLOBAL_KEY.to_string(),
        uuid: Uuid::new_v4(),
        life: Life::Alive,
    };
    Ok(Op::insert(collections::ENVIRONMENTS, ENVIRON_GLOBAL_KEY, &doc)?)
}

/// A snapshot of the environment document
///
/// The snapshot is not kept up to date; call [`Environment::refresh()`] to
/// re-read it.
pub struct Environment {
    store: Arc<dyn DocStore>,
    doc: EnvironmentDoc,
}

impl Environment {
    async fn load(store: Arc<dyn DocStore>) -> Result<Environment, Error> {
        let doc = read_doc(&*store).await?;
        Ok(Environment { store, doc })
    }

    pub fn uuid(&self) -> Uuid {
        self.doc.uuid
    }

    pub fn life(&self) -> Life {
        self.doc.life
    }

    /// Re-reads the environment document.
    pub async fn refresh(&mut self) -> Result<(), Error> {
        self.doc = read_doc(&*self.store).await?;
        Ok(())
    }

    /// Returns an op asserting that the environment is still alive.
    pub fn assert_alive_op(&self) -> Op {
        Op::assert(
            collections::ENVIRONMENTS,
            ENVIRON_GLOBAL_KEY,
            Assertion::Fields(vec![FieldCondition::Eq {
                field: "life",
                value: Life::Alive.as_value(),
            }]),
        )
    }
}

async fn read_doc(store: &dyn DocStore) -> Result<EnvironmentDoc, Error> {
    let doc = store
        .get(collections::ENVIRONMENTS, ENVIRON_GLOBAL_KEY)
        .await
        .map_err(public_error_from_store)?
        .ok_or_else(|| {
            LookupType::ByGlobalKey(ENVIRON_GLOBAL_KEY.to_string())
                .into_not_found(ResourceType::Environment)
        })?;
    Ok(serde_json::from_value(doc)?)
}

impl State {
    /// Loads the environment this `State` manages.
    pub async fn environment(&self) -> Result<Environment, Error> {
        Environment::load(Arc::clone(&self.store)).await
    }

    /// Fails with [`Error::EnvironmentNotAlive`] unless the environment is
    /// alive.
    pub(crate) async fn check_environment_alive(&self) -> Result<(), Error> {
        if self.environment().await?.life() != Life::Alive {
            return Err(Error::EnvironmentNotAlive);
        }
        Ok(())
    }

    /// Starts tearing the environment down.
    ///
    /// Once the environment is Dying no further machines can be added.
    /// Destroying an environment that is already Dying or Dead is a no-op.
    pub async fn destroy_environment(&self) -> Result<(), Error> {
        let env = self.environment().await?;
        if env.life() != Life::Alive {
            return Ok(());
        }
        let op = Op::update(
            collections::ENVIRONMENTS,
            ENVIRON_GLOBAL_KEY,
            Assertion::Fields(vec![FieldCondition::Eq {
                field: "life",
                value: Life::Alive.as_value(),
            }]),
            vec![Update::Set { field: "life", value: Life::Dying.as_value() }],
        );
        match self.store.run_transaction(vec![op]).await {
            Ok(()) => {
                info!(self.log, "environment is now dying";
                    "uuid" => %env.uuid());
                Ok(())
            }
            // Someone else got there first.
            Err(fleet_docstore::Error::Aborted { .. }) => Ok(()),
            Err(error) => Err(public_error_from_store(error)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::state_test;
    use fleet_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn test_destroy_environment() {
        let logctx = test_setup_log("test_destroy_environment");
        let state = state_test(&logctx.log, "").await;

        let mut env = state.environment().await.unwrap();
        assert_eq!(env.life(), Life::Alive);

        state.destroy_environment().await.unwrap();
        // The old snapshot is stale until refreshed.
        assert_eq!(env.life(), Life::Alive);
        env.refresh().await.unwrap();
        assert_eq!(env.life(), Life::Dying);

        // Destroying twice is fine.
        state.destroy_environment().await.unwrap();
        assert_eq!(state.environment().await.unwrap().uuid(), env.uuid());

        // The liveness assertion no longer holds.
        let error = state
            .store
            .run_transaction(vec![env.assert_alive_op()])
            .await
            .unwrap_err();
        assert!(matches!(error, fleet_docstore::Error::Aborted { .. }));

        logctx.cleanup_successful();
    }
}
