// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hooks that let the environment's provider veto new instances

use crate::State;
use async_trait::async_trait;
use fleet_common::constraints::Constraints;
use fleet_common::error::Error;
use std::sync::Arc;

/// Checks whether an instance could be provisioned before any records for it
/// are written
#[async_trait]
pub trait Prechecker: Send + Sync {
    /// Returns an error if an instance of `series` satisfying `cons` cannot
    /// be started.
    async fn precheck_instance(
        &self,
        series: &str,
        cons: &Constraints,
    ) -> anyhow::Result<()>;
}

/// Per-environment policy consulted while adding machines
pub trait Policy: Send + Sync {
    /// Returns the environment's prechecker, or `None` if it has none.
    fn prechecker(&self) -> anyhow::Result<Option<Arc<dyn Prechecker>>>;
}

impl State {
    /// Asks the configured prechecker, if any, whether an instance can be
    /// provisioned.
    pub(crate) async fn precheck_instance(
        &self,
        series: &str,
        cons: &Constraints,
    ) -> Result<(), Error> {
        let Some(policy) = &self.policy else {
            return Ok(());
        };
        let prechecker = policy.prechecker().map_err(|error| {
            Error::internal_error(&format!(
                "cannot get prechecker: {:#}",
                error
            ))
        })?;
        let Some(prechecker) = prechecker else {
            return Ok(());
        };
        prechecker.precheck_instance(series, cons).await.map_err(|error| {
            Error::ProvisioningRejected { message: format!("{:#}", error) }
        })
    }
}
