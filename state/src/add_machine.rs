// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Public entry points for adding machines

use crate::machine::Machine;
use crate::machine::MachineJob;
use crate::template::MachineTemplate;
use crate::State;
use fleet_common::error::Error;
use fleet_common::error::InternalContext;
use fleet_common::instance::ContainerType;
use slog::info;

impl State {
    /// Adds one machine for each of `templates`, all in one transaction.
    ///
    /// The state server job may only be requested here for the bootstrap
    /// machine; use [`State::ensure_availability()`] to add more.
    pub async fn add_machines(
        &self,
        templates: Vec<MachineTemplate>,
    ) -> Result<Vec<Machine>, Error> {
        self.add_machines_impl(templates)
            .await
            .internal_context("cannot add a new machine")
    }

    async fn add_machines_impl(
        &self,
        templates: Vec<MachineTemplate>,
    ) -> Result<Vec<Machine>, Error> {
        self.check_environment_alive().await?;
        let mut mdocs = Vec::with_capacity(templates.len());
        let mut ops = Vec::new();
        for template in templates {
            let (mdoc, add_ops) = self.add_machine_ops(template).await?;
            mdocs.push(mdoc);
            ops.extend(add_ops);
        }
        ops.extend(self.maintain_state_servers_ops(&mdocs, None).await?);
        self.commit(ops).await?;

        let ids: Vec<&str> = mdocs.iter().map(|m| m.id.as_str()).collect();
        info!(self.log, "added machines"; "machine_ids" => ?ids);
        Ok(mdocs.into_iter().map(Machine::new).collect())
    }

    /// Adds a single machine described by `template`.
    pub async fn add_one_machine(
        &self,
        template: MachineTemplate,
    ) -> Result<Machine, Error> {
        let mut machines = self.add_machines(vec![template]).await?;
        machines
            .pop()
            .ok_or_else(|| Error::internal_error("no machine was added"))
    }

    /// Adds a machine with the given series and jobs and default settings
    /// for everything else.
    pub async fn add_machine(
        &self,
        series: &str,
        jobs: Vec<MachineJob>,
    ) -> Result<Machine, Error> {
        self.add_one_machine(MachineTemplate::new(series, jobs)).await
    }

    /// Adds a container of `container_type`, described by `template`, to the
    /// existing machine `parent_id`.
    pub async fn add_machine_inside_machine(
        &self,
        template: MachineTemplate,
        parent_id: &str,
        container_type: ContainerType,
    ) -> Result<Machine, Error> {
        self.check_environment_alive().await?;
        let (mdoc, ops) = self
            .add_machine_inside_machine_ops(template, parent_id, container_type)
            .await?;
        self.commit(ops).await?;
        info!(self.log, "added container";
            "machine_id" => &mdoc.id, "parent_id" => parent_id);
        Ok(Machine::new(mdoc))
    }

    /// Adds a container of `container_type`, described by `template`, to a
    /// new machine described by `parent_template`.
    ///
    /// Both machines are created in one transaction.  The container is
    /// returned.
    pub async fn add_machine_inside_new_machine(
        &self,
        template: MachineTemplate,
        parent_template: MachineTemplate,
        container_type: ContainerType,
    ) -> Result<Machine, Error> {
        self.check_environment_alive().await?;
        let (mdoc, ops) = self
            .add_machine_inside_new_machine_ops(
                template,
                parent_template,
                container_type,
            )
            .await?;
        self.commit(ops).await?;
        let machine = Machine::new(mdoc);
        info!(self.log, "added container on new machine";
            "machine_id" => machine.id(),
            "parent_id" => machine.parent_id());
        Ok(machine)
    }
}
