// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named counters used to allocate machine ids

use crate::collections;
use crate::transaction::public_error_from_store;
use crate::State;
use fleet_common::error::Error;
use fleet_common::error::InternalContext;
use fleet_common::instance::ContainerType;

/// Counter key for root machine ids
pub(crate) const MACHINE_SEQUENCE: &str = "machine";

/// Counter key for the ids of containers of one type inside one machine
pub(crate) fn container_sequence(
    parent_id: &str,
    container_type: ContainerType,
) -> String {
    format!("machine{}{}Container", parent_id, container_type)
}

impl State {
    /// Returns the next value of the counter `name`.
    ///
    /// Counters start at zero.  Concurrent callers never observe the same
    /// value and values are never reused, even if the transaction they were
    /// allocated for is later rejected.
    pub async fn sequence(&self, name: &str) -> Result<u64, Error> {
        self.store
            .increment(collections::SEQUENCE, name, "counter")
            .await
            .map_err(public_error_from_store)
            .with_internal_context(|| format!("cannot increment {:?}", name))
    }

    pub(crate) async fn new_machine_id(&self) -> Result<String, Error> {
        Ok(self.sequence(MACHINE_SEQUENCE).await?.to_string())
    }

    pub(crate) async fn new_container_id(
        &self,
        parent_id: &str,
        container_type: ContainerType,
    ) -> Result<String, Error> {
        let seq = self
            .sequence(&container_sequence(parent_id, container_type))
            .await?;
        Ok(format!("{}/{}/{}", parent_id, container_type, seq))
    }
}
