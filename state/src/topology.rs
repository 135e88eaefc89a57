// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Building the operations that create machines
//!
//! Machines come in three arrangements: a root machine, a container on an
//! existing machine, and a container on a machine created in the same
//! transaction.  Each builder returns the new machine's document along with
//! the operations that insert it, its sub-documents and its container
//! reference document, and that link it to its parent.  Nothing is written
//! here other than sequence counters.

use crate::collections;
use crate::environment::Life;
use crate::machine::ContainerRefDoc;
use crate::machine::InstanceData;
use crate::machine::MachineDoc;
use crate::machine::MachineStatus;
use crate::machine::StatusDoc;
use crate::machine_global_key;
use crate::template::MachineTemplate;
use crate::State;
use fleet_common::error::Error;
use fleet_common::instance::ContainerType;
use fleet_docstore::Assertion;
use fleet_docstore::Op;
use fleet_docstore::Update;

impl State {
    /// Returns the operations that add a root machine.
    pub(crate) async fn add_machine_ops(
        &self,
        template: MachineTemplate,
    ) -> Result<(MachineDoc, Vec<Op>), Error> {
        let template = self.effective_template(template, true).await?;
        if template.known_instance_id().is_none() {
            self.precheck_instance(&template.series, &template.constraints)
                .await?;
        }
        let id = self.new_machine_id().await?;
        let mdoc = machine_doc_for_template(&template, id, None);

        let mut ops = insert_new_machine_ops(&mdoc, &template)?;
        ops.push(insert_container_ref_op(&mdoc.id, Vec::new())?);
        Ok((mdoc, ops))
    }

    /// Returns the operations that add a container of `container_type` to
    /// the existing machine `parent_id`.
    pub(crate) async fn add_machine_inside_machine_ops(
        &self,
        template: MachineTemplate,
        parent_id: &str,
        container_type: ContainerType,
    ) -> Result<(MachineDoc, Vec<Op>), Error> {
        if template.known_instance_id().is_some() {
            return Err(Error::invalid_request(
                "cannot specify instance id for a new container",
            ));
        }
        let template = self.effective_template(template, false).await?;
        check_container_type(container_type)?;

        let parent = self.machine_doc(parent_id).await?;
        if !parent.supports_container_type(container_type) {
            return Err(Error::UnsupportedContainer {
                machine_id: parent_id.to_string(),
                container_type: container_type.to_string(),
            });
        }
        let id = self.new_container_id(parent_id, container_type).await?;
        let mdoc =
            machine_doc_for_template(&template, id, Some(container_type));

        let mut ops = insert_new_machine_ops(&mdoc, &template)?;
        ops.push(add_child_to_container_ref_op(parent_id, &mdoc.id));
        ops.push(insert_container_ref_op(&mdoc.id, Vec::new())?);
        Ok((mdoc, ops))
    }

    /// Returns the operations that add a container of `container_type` to a
    /// new machine described by `parent_template`.
    ///
    /// The returned document is the container's.
    pub(crate) async fn add_machine_inside_new_machine_ops(
        &self,
        template: MachineTemplate,
        parent_template: MachineTemplate,
        container_type: ContainerType,
    ) -> Result<(MachineDoc, Vec<Op>), Error> {
        if template.known_instance_id().is_some()
            || parent_template.known_instance_id().is_some()
        {
            return Err(Error::invalid_request(
                "cannot specify instance id for a new container",
            ));
        }
        let parent_template =
            self.effective_template(parent_template, false).await?;
        check_container_type(container_type)?;
        let template = self.effective_template(template, false).await?;
        self.precheck_instance(
            &parent_template.series,
            &parent_template.constraints,
        )
        .await?;

        let parent_id = self.new_machine_id().await?;
        let id = self.new_container_id(&parent_id, container_type).await?;
        let parent_doc =
            machine_doc_for_template(&parent_template, parent_id, None);
        let mdoc =
            machine_doc_for_template(&template, id, Some(container_type));

        let mut ops = insert_new_machine_ops(&parent_doc, &parent_template)?;
        ops.extend(insert_new_machine_ops(&mdoc, &template)?);
        ops.push(insert_container_ref_op(&mdoc.id, Vec::new())?);
        ops.push(insert_container_ref_op(
            &parent_doc.id,
            vec![mdoc.id.clone()],
        )?);
        Ok((mdoc, ops))
    }
}

fn check_container_type(container_type: ContainerType) -> Result<(), Error> {
    if container_type == ContainerType::None {
        return Err(Error::invalid_request("no container type specified"));
    }
    Ok(())
}

fn machine_doc_for_template(
    template: &MachineTemplate,
    id: String,
    container_type: Option<ContainerType>,
) -> MachineDoc {
    MachineDoc {
        id,
        series: template.series.clone(),
        container_type,
        principals: template.principals.clone(),
        life: Life::Alive,
        jobs: template.jobs.clone(),
        no_vote: template.no_vote,
        clean: !template.dirty,
        instance_id: template.known_instance_id().cloned(),
        nonce: template.nonce.clone(),
        addresses: template.addresses.clone(),
        supported_containers_known: false,
        supported_containers: Vec::new(),
    }
}

/// Returns the operations that insert `mdoc` together with its constraints,
/// its initial status and, if its instance is already known, its instance
/// data.
fn insert_new_machine_ops(
    mdoc: &MachineDoc,
    template: &MachineTemplate,
) -> Result<Vec<Op>, Error> {
    let key = machine_global_key(&mdoc.id);
    let mut ops = vec![
        Op::insert(collections::MACHINES, &mdoc.id, mdoc)?,
        Op::insert(collections::CONSTRAINTS, &key, &template.constraints)?,
        Op::insert(
            collections::STATUSES,
            &key,
            &StatusDoc { status: MachineStatus::Pending, info: String::new() },
        )?,
    ];
    if let Some(instance_id) = &mdoc.instance_id {
        let data = InstanceData {
            machine_id: mdoc.id.clone(),
            instance_id: instance_id.clone(),
            hardware: template.hardware.clone().unwrap_or_default(),
        };
        ops.push(Op::insert(collections::INSTANCE_DATA, &mdoc.id, &data)?);
    }
    Ok(ops)
}

fn insert_container_ref_op(
    id: &str,
    children: Vec<String>,
) -> Result<Op, Error> {
    let doc = ContainerRefDoc { id: id.to_string(), children };
    Ok(Op::insert(collections::CONTAINER_REFS, id, &doc)?)
}

fn add_child_to_container_ref_op(parent_id: &str, child_id: &str) -> Op {
    Op::update(
        collections::CONTAINER_REFS,
        parent_id,
        Assertion::DocExists,
        vec![Update::AddToSet {
            field: "children",
            values: vec![serde_json::Value::String(child_id.to_string())],
        }],
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::machine::MachineJob;
    use crate::test_helpers::state_test;
    use assert_matches::assert_matches;
    use fleet_docstore::Effect;
    use fleet_test_utils::dev::test_setup_log;

    fn host() -> MachineTemplate {
        MachineTemplate::new("jammy", vec![MachineJob::HostUnits])
    }

    fn targets(ops: &[Op]) -> Vec<(&str, &str)> {
        ops.iter().map(|op| (op.collection, op.id.as_str())).collect()
    }

    #[tokio::test]
    async fn test_root_machine_ops() {
        let logctx = test_setup_log("test_root_machine_ops");
        let state = state_test(&logctx.log, "mem=4G").await;

        let template = host()
            .with_instance("i-7", "nonce", None)
            .with_principals(vec!["wordpress/0".to_string()]);
        let (mdoc, ops) = state.add_machine_ops(template).await.unwrap();
        assert_eq!(mdoc.id, "0");
        assert_eq!(mdoc.principals, vec!["wordpress/0".to_string()]);
        assert_eq!(
            targets(&ops),
            vec![
                ("machines", "0"),
                ("constraints", "m#0"),
                ("statuses", "m#0"),
                ("instanceData", "0"),
                ("containerRefs", "0"),
            ]
        );
        assert!(ops.iter().all(|op| op.assert == Assertion::DocMissing));

        // Without an instance there is no instance data.
        let (mdoc, ops) = state.add_machine_ops(host()).await.unwrap();
        assert_eq!(mdoc.id, "1");
        assert_eq!(ops.len(), 4);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_container_ops() {
        let logctx = test_setup_log("test_container_ops");
        let state = state_test(&logctx.log, "").await;

        let error = state
            .add_machine_inside_machine_ops(host(), "0", ContainerType::Lxc)
            .await
            .unwrap_err();
        assert_matches!(error, Error::ObjectNotFound { .. });

        let (parent, ops) = state.add_machine_ops(host()).await.unwrap();
        state.commit(ops).await.unwrap();

        let error = state
            .add_machine_inside_machine_ops(
                host(),
                &parent.id,
                ContainerType::None,
            )
            .await
            .unwrap_err();
        assert_eq!(
            error,
            Error::invalid_request("no container type specified")
        );

        let (mdoc, ops) = state
            .add_machine_inside_machine_ops(
                host(),
                &parent.id,
                ContainerType::Lxc,
            )
            .await
            .unwrap();
        assert_eq!(mdoc.id, "0/lxc/0");
        assert_eq!(mdoc.container_type, Some(ContainerType::Lxc));
        let link = ops
            .iter()
            .find(|op| op.id == "0" && op.collection == "containerRefs")
            .unwrap();
        assert_eq!(link.assert, Assertion::DocExists);
        assert_matches!(&link.effect, Effect::Update(_));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_container_on_new_machine_ops() {
        let logctx = test_setup_log("test_container_on_new_machine_ops");
        let state = state_test(&logctx.log, "").await;

        let error = state
            .add_machine_inside_new_machine_ops(
                host(),
                host().with_instance("i-1", "n", None),
                ContainerType::Kvm,
            )
            .await
            .unwrap_err();
        assert_matches!(error, Error::InvalidRequest { .. });

        let manager =
            MachineTemplate::new("jammy", vec![MachineJob::ManageEnviron]);
        let error = state
            .add_machine_inside_new_machine_ops(
                host(),
                manager,
                ContainerType::Kvm,
            )
            .await
            .unwrap_err();
        assert_matches!(error, Error::PermissionDenied { .. });
        // Rejected requests do not consume machine ids.
        assert_eq!(state.sequence("machine").await.unwrap(), 0);

        let (mdoc, ops) = state
            .add_machine_inside_new_machine_ops(
                host(),
                host(),
                ContainerType::Kvm,
            )
            .await
            .unwrap();
        assert_eq!(mdoc.id, "1/kvm/0");
        let parent_ref = ops
            .iter()
            .find(|op| op.id == "1" && op.collection == "containerRefs")
            .unwrap();
        assert_eq!(
            parent_ref.effect,
            Effect::Insert(serde_json::json!({
                "_id": "1",
                "children": ["1/kvm/0"],
            }))
        );

        logctx.cleanup_successful();
    }
}
