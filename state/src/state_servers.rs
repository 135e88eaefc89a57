// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracking which machines are state servers
//!
//! The single [`StateServerInfo`] document lists every state server and the
//! subset of them that vote.  It is never locked.  Writers read it, then
//! assert in their transaction that both lists still have the lengths they
//! read; since ids are only ever added, equal lengths mean nothing changed in
//! between.

use crate::collections;
use crate::machine::MachineDoc;
use crate::machine::MachineJob;
use crate::State;
use crate::ENVIRON_GLOBAL_KEY;
use fleet_common::error::Error;
use fleet_common::error::InternalContext;
use fleet_common::error::ResourceType;
use fleet_docstore::Assertion;
use fleet_docstore::FieldCondition;
use fleet_docstore::Op;
use fleet_docstore::Update;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// The machines running the state server role
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct StateServerInfo {
    /// Every machine with the state server job
    pub machine_ids: Vec<String>,
    /// The state servers that count towards the quorum; a subset of
    /// `machine_ids`
    pub voting_machine_ids: Vec<String>,
}

impl StateServerInfo {
    pub fn is_empty(&self) -> bool {
        self.machine_ids.is_empty() && self.voting_machine_ids.is_empty()
    }
}

#[derive(Deserialize, Serialize)]
struct StateServersDoc {
    #[serde(rename = "_id")]
    id: String,
    #[serde(flatten)]
    info: StateServerInfo,
}

pub(crate) fn insert_state_servers_op() -> Result<Op, Error> {
    let doc = StateServersDoc {
        id: ENVIRON_GLOBAL_KEY.to_string(),
        info: StateServerInfo::default(),
    };
    Ok(Op::insert(collections::STATE_SERVERS, ENVIRON_GLOBAL_KEY, &doc)?)
}

/// Returns the operation that adds the state servers among `mdocs` to the
/// document last read as `current`, failing if it has changed since.
///
/// Returns `None` if none of `mdocs` is a state server.
pub(crate) fn add_state_servers_op(
    mdocs: &[MachineDoc],
    current: &StateServerInfo,
) -> Option<Op> {
    let (new_ids, new_voting_ids) = new_state_servers(mdocs);
    if new_ids.is_empty() {
        return None;
    }
    Some(Op::update(
        collections::STATE_SERVERS,
        ENVIRON_GLOBAL_KEY,
        Assertion::Fields(vec![
            FieldCondition::Size {
                field: "machine_ids",
                len: current.machine_ids.len(),
            },
            FieldCondition::Size {
                field: "voting_machine_ids",
                len: current.voting_machine_ids.len(),
            },
        ]),
        vec![
            Update::AddToSet {
                field: "machine_ids",
                values: new_ids.into_iter().map(Value::String).collect(),
            },
            Update::AddToSet {
                field: "voting_machine_ids",
                values: new_voting_ids.into_iter().map(Value::String).collect(),
            },
        ],
    ))
}

/// Returns the ids of the state servers among `mdocs`, and of those that
/// vote.
fn new_state_servers(mdocs: &[MachineDoc]) -> (Vec<String>, Vec<String>) {
    let mut ids = Vec::new();
    let mut voting_ids = Vec::new();
    for mdoc in mdocs.iter().filter(|m| m.has_job(MachineJob::ManageEnviron))
    {
        ids.push(mdoc.id.clone());
        if !mdoc.no_vote {
            voting_ids.push(mdoc.id.clone());
        }
    }
    (ids, voting_ids)
}

impl State {
    /// Reads the current set of state servers.
    pub async fn state_server_info(&self) -> Result<StateServerInfo, Error> {
        let doc: StateServersDoc = self
            .get_doc(
                collections::STATE_SERVERS,
                ENVIRON_GLOBAL_KEY,
                ResourceType::StateServerInfo,
            )
            .await?;
        Ok(doc.info)
    }

    /// Returns the operations that keep [`StateServerInfo`] in step with the
    /// addition of `mdocs`.
    ///
    /// `current` is the state server info the caller has already read.  If
    /// it is `None` the only state server that may be added is the bootstrap
    /// machine "0", on its own, into an empty document.
    pub(crate) async fn maintain_state_servers_ops(
        &self,
        mdocs: &[MachineDoc],
        current: Option<&StateServerInfo>,
    ) -> Result<Vec<Op>, Error> {
        if !mdocs.iter().any(|m| m.has_job(MachineJob::ManageEnviron)) {
            return Ok(Vec::new());
        }
        let fetched;
        let current = match current {
            Some(current) => current,
            None => {
                if mdocs.len() != 1 || mdocs[0].id != "0" {
                    return Err(Error::StateServerNotAllowed);
                }
                fetched = self
                    .state_server_info()
                    .await
                    .internal_context("cannot get state server info")?;
                if !fetched.is_empty() {
                    return Err(Error::ObjectAlreadyExists {
                        type_name: ResourceType::StateServerInfo,
                        object_name: "state servers".to_string(),
                    });
                }
                &fetched
            }
        };
        Ok(add_state_servers_op(mdocs, current).into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::environment::Life;
    use crate::test_helpers::state_test;
    use assert_matches::assert_matches;
    use fleet_test_utils::dev::test_setup_log;

    fn mdoc(id: &str, jobs: &[MachineJob], no_vote: bool) -> MachineDoc {
        MachineDoc {
            id: id.to_string(),
            series: "jammy".to_string(),
            container_type: None,
            principals: vec![],
            life: Life::Alive,
            jobs: jobs.to_vec(),
            no_vote,
            clean: true,
            instance_id: None,
            nonce: None,
            addresses: vec![],
            supported_containers_known: false,
            supported_containers: vec![],
        }
    }

    const BOTH: &[MachineJob] =
        &[MachineJob::HostUnits, MachineJob::ManageEnviron];

    #[test]
    fn test_new_state_servers() {
        let mdocs = vec![
            mdoc("1", BOTH, false),
            mdoc("2", &[MachineJob::HostUnits], false),
            mdoc("3", BOTH, true),
        ];
        assert_eq!(
            new_state_servers(&mdocs),
            (
                vec!["1".to_string(), "3".to_string()],
                vec!["1".to_string()]
            )
        );
        let current = StateServerInfo::default();
        assert_eq!(add_state_servers_op(&mdocs[1..2], &current), None);
    }

    #[tokio::test]
    async fn test_bootstrap_rules() {
        let logctx = test_setup_log("test_bootstrap_rules");
        let state = state_test(&logctx.log, "").await;

        // Machines without the state server job need no bookkeeping.
        let hosts = vec![mdoc("5", &[MachineJob::HostUnits], false)];
        assert_eq!(
            state.maintain_state_servers_ops(&hosts, None).await,
            Ok(vec![])
        );

        let two = vec![mdoc("0", BOTH, false), mdoc("1", BOTH, false)];
        assert_eq!(
            state.maintain_state_servers_ops(&two, None).await,
            Err(Error::StateServerNotAllowed)
        );
        let not_zero = vec![mdoc("1", BOTH, false)];
        assert_eq!(
            state.maintain_state_servers_ops(&not_zero, None).await,
            Err(Error::StateServerNotAllowed)
        );

        let zero = vec![mdoc("0", BOTH, false)];
        let ops = state.maintain_state_servers_ops(&zero, None).await.unwrap();
        state.store.run_transaction(ops).await.unwrap();
        assert_eq!(
            state.state_server_info().await.unwrap(),
            StateServerInfo {
                machine_ids: vec!["0".to_string()],
                voting_machine_ids: vec!["0".to_string()],
            }
        );

        let error =
            state.maintain_state_servers_ops(&zero, None).await.unwrap_err();
        assert_matches!(error, Error::ObjectAlreadyExists { .. });

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_stale_plan_is_rejected() {
        let logctx = test_setup_log("test_stale_plan_is_rejected");
        let state = state_test(&logctx.log, "").await;

        let read = state.state_server_info().await.unwrap();
        let first = add_state_servers_op(&[mdoc("0", BOTH, false)], &read);
        let second = add_state_servers_op(&[mdoc("1", BOTH, false)], &read);

        state.store.run_transaction(first.into_iter().collect()).await.unwrap();
        // The second writer planned against the same, now outdated, read.
        let error = state
            .store
            .run_transaction(second.into_iter().collect())
            .await
            .unwrap_err();
        assert_matches!(error, fleet_docstore::Error::Aborted { .. });
        assert_eq!(
            state.state_server_info().await.unwrap().machine_ids,
            vec!["0".to_string()]
        );

        // Non-voting state servers only join the full list.
        let read = state.state_server_info().await.unwrap();
        let op = add_state_servers_op(&[mdoc("2", BOTH, true)], &read);
        state.store.run_transaction(op.into_iter().collect()).await.unwrap();
        let info = state.state_server_info().await.unwrap();
        assert_eq!(info.machine_ids, vec!["0".to_string(), "2".to_string()]);
        assert_eq!(info.voting_machine_ids, vec!["0".to_string()]);

        logctx.cleanup_successful();
    }
}
