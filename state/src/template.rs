// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Requests to create a machine and their validation

use crate::machine::MachineJob;
use crate::State;
use fleet_common::constraints::Constraints;
use fleet_common::error::Error;
use fleet_common::instance::Address;
use fleet_common::instance::HardwareCharacteristics;
use fleet_common::instance::InstanceId;
use std::collections::BTreeSet;

/// Nonce used when the bootstrap machine is injected with the instance it was
/// started on
pub const BOOTSTRAP_NONCE: &str = "user-admin:bootstrap";

/// Everything needed to create one machine
///
/// A template is consumed by a single call that adds machines.  Build one
/// with [`MachineTemplate::new()`] and the `with_*` methods.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MachineTemplate {
    /// OS series the machine runs
    pub series: String,
    /// Requested resources, layered over the environment defaults
    pub constraints: Constraints,
    /// Roles of the machine; must be non-empty and free of duplicates
    pub jobs: Vec<MachineJob>,
    /// If set, the machine will not count towards the state server quorum.
    pub no_vote: bool,
    /// Id of an instance that already exists for this machine
    pub instance_id: Option<InstanceId>,
    /// Nonce the machine agent will use; required with `instance_id`
    pub nonce: Option<String>,
    /// Hardware of the existing instance
    pub hardware: Option<HardwareCharacteristics>,
    pub addresses: Vec<Address>,
    /// If set, the machine may have been used before and is not a fresh
    /// instance.
    pub dirty: bool,
    /// Units assigned to the machine when it is created
    pub(crate) principals: Vec<String>,
}

impl MachineTemplate {
    pub fn new<S: Into<String>>(series: S, jobs: Vec<MachineJob>) -> Self {
        MachineTemplate { series: series.into(), jobs, ..Default::default() }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Records an already-provisioned instance for the machine.
    pub fn with_instance<I: Into<InstanceId>, N: Into<String>>(
        mut self,
        instance_id: I,
        nonce: N,
        hardware: Option<HardwareCharacteristics>,
    ) -> Self {
        self.instance_id = Some(instance_id.into());
        self.nonce = Some(nonce.into());
        self.hardware = hardware;
        self
    }

    pub fn with_no_vote(mut self) -> Self {
        self.no_vote = true;
        self
    }

    pub fn with_addresses(mut self, addresses: Vec<Address>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn with_dirty(mut self) -> Self {
        self.dirty = true;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_principals(mut self, principals: Vec<String>) -> Self {
        self.principals = principals;
        self
    }

    /// The explicit instance id, treating an empty one as absent
    pub(crate) fn known_instance_id(&self) -> Option<&InstanceId> {
        self.instance_id.as_ref().filter(|id| !id.is_empty())
    }
}

/// Checks `template` and layers its constraints over `environ_constraints`.
///
/// `allow_state_server` is false for containers, which may never run the
/// state server role.
pub(crate) fn validate(
    mut template: MachineTemplate,
    environ_constraints: &Constraints,
    allow_state_server: bool,
) -> Result<MachineTemplate, Error> {
    if template.series.is_empty() {
        return Err(Error::invalid_template("no series specified"));
    }

    let mut cons = template.constraints.with_fallbacks(environ_constraints);
    // Machines are provisioned without a container constraint; it only
    // guides where units are placed.
    cons.container = None;
    template.constraints = cons;

    if template.jobs.is_empty() {
        return Err(Error::invalid_template("no jobs specified"));
    }
    let mut seen = BTreeSet::new();
    for job in &template.jobs {
        if !seen.insert(*job) {
            return Err(Error::invalid_template(&format!(
                "duplicate job: {}",
                job
            )));
        }
    }
    if seen.contains(&MachineJob::ManageEnviron) && !allow_state_server {
        return Err(Error::permission_denied(&format!(
            "{} specified but not allowed",
            MachineJob::ManageEnviron
        )));
    }

    let has_instance = template.known_instance_id().is_some();
    let has_nonce = template.nonce.as_ref().is_some_and(|n| !n.is_empty());
    match (has_instance, has_nonce) {
        (true, false) => {
            return Err(Error::invalid_template(
                "cannot add a machine with an instance id and no nonce",
            ));
        }
        (false, true) => {
            return Err(Error::invalid_template(
                "cannot specify a nonce without an instance id",
            ));
        }
        _ => (),
    }
    if !has_instance {
        template.instance_id = None;
        template.nonce = None;
    }

    Ok(template)
}

impl State {
    /// Validates `template` against the current environment constraints.
    pub(crate) async fn effective_template(
        &self,
        template: MachineTemplate,
        allow_state_server: bool,
    ) -> Result<MachineTemplate, Error> {
        let environ_constraints = self.environ_constraints().await?;
        validate(template, &environ_constraints, allow_state_server)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use test_strategy::proptest;

    fn template(jobs: Vec<MachineJob>) -> MachineTemplate {
        MachineTemplate::new("jammy", jobs)
    }

    #[test]
    fn test_validate_merges_constraints() {
        let env: Constraints = "mem=4G container=lxc".parse().unwrap();
        let t = template(vec![MachineJob::HostUnits])
            .with_constraints("cpu-cores=4".parse().unwrap());
        let t = validate(t, &env, false).unwrap();
        assert_eq!(
            t.constraints,
            "mem=4G cpu-cores=4".parse::<Constraints>().unwrap()
        );
    }

    #[test]
    fn test_validate_errors() {
        let env = Constraints::default();
        let t = MachineTemplate::new("", vec![MachineJob::HostUnits]);
        assert_matches!(
            validate(t, &env, true),
            Err(Error::InvalidTemplate { .. })
        );

        assert_matches!(
            validate(template(vec![]), &env, true),
            Err(Error::InvalidTemplate { .. })
        );

        let t = template(vec![MachineJob::HostUnits, MachineJob::HostUnits]);
        assert_eq!(
            validate(t, &env, true),
            Err(Error::invalid_template("duplicate job: host_units"))
        );

        let t = template(vec![MachineJob::ManageEnviron]);
        assert_matches!(
            validate(t.clone(), &env, false),
            Err(Error::PermissionDenied { .. })
        );
        validate(t, &env, true).unwrap();

        let t = template(vec![MachineJob::HostUnits])
            .with_instance("i-1", "", None);
        assert_matches!(
            validate(t, &env, true),
            Err(Error::InvalidTemplate { .. })
        );

        let mut t = template(vec![MachineJob::HostUnits]);
        t.nonce = Some("abc".to_string());
        assert_matches!(
            validate(t, &env, true),
            Err(Error::InvalidTemplate { .. })
        );
    }

    #[test]
    fn test_validate_empty_instance_is_absent() {
        let t =
            template(vec![MachineJob::HostUnits]).with_instance("", "", None);
        let t = validate(t, &Constraints::default(), true).unwrap();
        assert_eq!(t.instance_id, None);
        assert_eq!(t.nonce, None);

        let t = template(vec![MachineJob::HostUnits]).with_instance(
            "i-1",
            BOOTSTRAP_NONCE,
            None,
        );
        let t = validate(t, &Constraints::default(), true).unwrap();
        assert_eq!(t.known_instance_id(), Some(&InstanceId::new("i-1")));
    }

    /// Whatever jobs are requested, a template that passes validation has a
    /// non-empty set of distinct jobs.
    #[proptest]
    fn validated_jobs_are_distinct(
        #[strategy(proptest::collection::vec(0..2u8, 0..5))] picks: Vec<u8>,
    ) {
        let jobs = picks
            .iter()
            .map(|p| {
                if *p == 0 {
                    MachineJob::HostUnits
                } else {
                    MachineJob::ManageEnviron
                }
            })
            .collect::<Vec<_>>();
        let result =
            validate(template(jobs.clone()), &Constraints::default(), true);
        let distinct = jobs.iter().collect::<BTreeSet<_>>().len();
        if let Ok(t) = result {
            assert!(!t.jobs.is_empty());
            assert_eq!(t.jobs.len(), distinct);
        } else {
            assert!(jobs.is_empty() || distinct < jobs.len());
        }
    }
}
