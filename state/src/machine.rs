// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machine documents and the sub-documents created alongside them

use crate::collections;
use crate::environment::Life;
use crate::machine_global_key;
use crate::State;
use fleet_common::constraints::Constraints;
use fleet_common::error::Error;
use fleet_common::error::ResourceType;
use fleet_common::instance::Address;
use fleet_common::instance::ContainerType;
use fleet_common::instance::HardwareCharacteristics;
use fleet_common::instance::InstanceId;
use fleet_docstore::Assertion;
use fleet_docstore::FieldCondition;
use fleet_docstore::Op;
use fleet_docstore::Update;
use serde::Deserialize;
use serde::Serialize;
use slog::info;

/// A role a machine can run
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MachineJob {
    /// The machine runs workload units.
    HostUnits,
    /// The machine is a state server.
    ManageEnviron,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct MachineDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub series: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_type: Option<ContainerType>,
    pub principals: Vec<String>,
    pub life: Life,
    pub jobs: Vec<MachineJob>,
    pub no_vote: bool,
    pub clean: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub addresses: Vec<Address>,
    pub supported_containers_known: bool,
    pub supported_containers: Vec<ContainerType>,
}

impl MachineDoc {
    pub fn has_job(&self, job: MachineJob) -> bool {
        self.jobs.contains(&job)
    }

    /// Whether this machine may host containers of `ctype`
    ///
    /// A machine that has not yet reported what it supports is assumed to
    /// support everything.
    pub fn supports_container_type(&self, ctype: ContainerType) -> bool {
        !self.supported_containers_known
            || self.supported_containers.contains(&ctype)
    }
}

/// Adjacency list of the containers hosted directly on a machine
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct ContainerRefDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub children: Vec<String>,
}

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
pub enum MachineStatus {
    Pending,
    Started,
    Stopped,
    Error,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct StatusDoc {
    pub status: MachineStatus,
    pub info: String,
}

/// Instance metadata recorded for a machine that was added with an existing
/// instance
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceData {
    #[serde(rename = "_id")]
    pub machine_id: String,
    pub instance_id: InstanceId,
    #[serde(flatten)]
    pub hardware: HardwareCharacteristics,
}

/// A snapshot of one machine
#[derive(Clone, Debug)]
pub struct Machine {
    doc: MachineDoc,
}

impl Machine {
    pub(crate) fn new(doc: MachineDoc) -> Machine {
        Machine { doc }
    }

    pub fn id(&self) -> &str {
        &self.doc.id
    }

    pub fn series(&self) -> &str {
        &self.doc.series
    }

    pub fn jobs(&self) -> &[MachineJob] {
        &self.doc.jobs
    }

    pub fn life(&self) -> Life {
        self.doc.life
    }

    /// Whether the machine was created without prior use
    pub fn clean(&self) -> bool {
        self.doc.clean
    }

    /// The type of container this machine is, or `None` for a root machine
    pub fn container_type(&self) -> Option<ContainerType> {
        self.doc.container_type
    }

    /// The id of the machine hosting this container, if this is one
    pub fn parent_id(&self) -> Option<&str> {
        // "<parent>/<type>/<n>": strip the last two components.
        let (rest, _) = self.doc.id.rsplit_once('/')?;
        let (parent, _) = rest.rsplit_once('/')?;
        Some(parent)
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        self.doc.instance_id.as_ref()
    }

    pub fn nonce(&self) -> Option<&str> {
        self.doc.nonce.as_deref()
    }

    pub fn addresses(&self) -> &[Address] {
        &self.doc.addresses
    }

    pub fn principals(&self) -> &[String] {
        &self.doc.principals
    }

    pub fn no_vote(&self) -> bool {
        self.doc.no_vote
    }

    /// Whether this machine is a state server that counts towards the quorum
    pub fn has_vote(&self) -> bool {
        self.doc.has_job(MachineJob::ManageEnviron) && !self.doc.no_vote
    }

    /// The container types this machine supports, if it has reported them
    pub fn supported_containers(&self) -> Option<&[ContainerType]> {
        self.doc
            .supported_containers_known
            .then_some(self.doc.supported_containers.as_slice())
    }

    pub fn supports_container_type(&self, ctype: ContainerType) -> bool {
        self.doc.supports_container_type(ctype)
    }
}

impl State {
    pub(crate) async fn machine_doc(
        &self,
        id: &str,
    ) -> Result<MachineDoc, Error> {
        self.get_doc(collections::MACHINES, id, ResourceType::Machine).await
    }

    /// Looks up a machine by id.
    pub async fn machine(&self, id: &str) -> Result<Machine, Error> {
        Ok(Machine::new(self.machine_doc(id).await?))
    }

    /// Returns the ids of the containers hosted directly on machine `id`.
    pub async fn machine_containers(
        &self,
        id: &str,
    ) -> Result<Vec<String>, Error> {
        let doc: ContainerRefDoc = self
            .get_doc(
                collections::CONTAINER_REFS,
                id,
                ResourceType::ContainerRef,
            )
            .await?;
        Ok(doc.children)
    }

    /// Returns the constraints machine `id` was provisioned with.
    pub async fn machine_constraints(
        &self,
        id: &str,
    ) -> Result<Constraints, Error> {
        self.get_doc(
            collections::CONSTRAINTS,
            &machine_global_key(id),
            ResourceType::Constraints,
        )
        .await
    }

    /// Returns the agent-reported status of machine `id` and its message.
    pub async fn machine_status(
        &self,
        id: &str,
    ) -> Result<(MachineStatus, String), Error> {
        let doc: StatusDoc = self
            .get_doc(
                collections::STATUSES,
                &machine_global_key(id),
                ResourceType::Status,
            )
            .await?;
        Ok((doc.status, doc.info))
    }

    /// Returns the instance metadata of machine `id`.
    ///
    /// This only exists for machines whose instance is known, such as those
    /// added with an existing instance.
    pub async fn instance_data(&self, id: &str) -> Result<InstanceData, Error> {
        self.get_doc(collections::INSTANCE_DATA, id, ResourceType::InstanceData)
            .await
    }

    /// Records the container types machine `id` is able to host.
    ///
    /// Until this is called every container type is assumed to be supported.
    pub async fn set_supported_containers(
        &self,
        id: &str,
        types: &[ContainerType],
    ) -> Result<(), Error> {
        if types.contains(&ContainerType::None) {
            return Err(Error::invalid_request(
                "\"none\" is not a valid container type",
            ));
        }
        let mut types = types.to_vec();
        types.sort();
        types.dedup();

        let op = Op::update(
            collections::MACHINES,
            id,
            Assertion::Fields(vec![FieldCondition::Ne {
                field: "life",
                value: Life::Dead.as_value(),
            }]),
            vec![
                Update::Set {
                    field: "supported_containers",
                    value: serde_json::to_value(&types)?,
                },
                Update::Set {
                    field: "supported_containers_known",
                    value: serde_json::Value::Bool(true),
                },
            ],
        );
        if let Err(error) = self.commit(vec![op]).await {
            // Tell a missing machine apart from a dead one.
            return match self.machine_doc(id).await {
                Ok(doc) if doc.life == Life::Dead => {
                    Err(Error::invalid_request(&format!(
                        "machine {} is dead",
                        id
                    )))
                }
                Ok(_) => Err(error),
                Err(lookup_error) => Err(lookup_error),
            };
        }
        info!(self.log, "set supported containers";
            "machine_id" => id, "types" => ?types);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn doc(id: &str) -> MachineDoc {
        MachineDoc {
            id: id.to_string(),
            series: "jammy".to_string(),
            container_type: None,
            principals: vec![],
            life: Life::Alive,
            jobs: vec![MachineJob::HostUnits],
            no_vote: false,
            clean: true,
            instance_id: None,
            nonce: None,
            addresses: vec![],
            supported_containers_known: false,
            supported_containers: vec![],
        }
    }

    #[test]
    fn test_supports_container_type() {
        let mut doc = doc("0");
        assert!(doc.supports_container_type(ContainerType::Kvm));
        assert_eq!(Machine::new(doc.clone()).supported_containers(), None);

        doc.supported_containers_known = true;
        doc.supported_containers = vec![ContainerType::Lxc];
        assert!(doc.supports_container_type(ContainerType::Lxc));
        assert!(!doc.supports_container_type(ContainerType::Kvm));

        doc.supported_containers = vec![];
        assert!(!doc.supports_container_type(ContainerType::Lxc));
        assert_eq!(Machine::new(doc).supported_containers(), Some(&[][..]));
    }

    #[test]
    fn test_parent_id() {
        assert_eq!(Machine::new(doc("4")).parent_id(), None);
        assert_eq!(Machine::new(doc("4/lxc/0")).parent_id(), Some("4"));
        assert_eq!(
            Machine::new(doc("4/lxc/0/kvm/2")).parent_id(),
            Some("4/lxc/0")
        );
    }

    #[test]
    fn test_has_vote() {
        let mut doc = doc("0");
        assert!(!Machine::new(doc.clone()).has_vote());
        doc.jobs.push(MachineJob::ManageEnviron);
        assert!(Machine::new(doc.clone()).has_vote());
        doc.no_vote = true;
        assert!(!Machine::new(doc).has_vote());
    }

    #[test]
    fn test_document_layout() {
        let value = serde_json::to_value(doc("1/kvm/3")).unwrap();
        assert_eq!(value["_id"], "1/kvm/3");
        assert_eq!(value["life"], "alive");
        assert_eq!(value["jobs"], serde_json::json!(["host_units"]));
        assert!(value.get("instance_id").is_none());
    }
}
