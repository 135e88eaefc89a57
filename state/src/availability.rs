// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scaling the number of voting state servers

use crate::machine::MachineJob;
use crate::state_servers::add_state_servers_op;
use crate::template::MachineTemplate;
use crate::State;
use fleet_common::bail_unless;
use fleet_common::constraints::Constraints;
use fleet_common::error::Error;
use fleet_common::error::InternalContext;
use slog::{debug, info};

/// Returns the number of new voting state servers needed to go from
/// `current_voters` to `target`.
///
/// Fails if `target` is not a usable quorum size, or if getting there would
/// mean removing voters.
pub(crate) fn state_servers_needed(
    target: usize,
    current_voters: usize,
    max_peers: usize,
) -> Result<usize, Error> {
    if target == 0 || target % 2 == 0 {
        return Err(Error::invalid_target(
            "number of state servers must be odd and greater than zero",
        ));
    }
    if target > max_peers {
        return Err(Error::invalid_target(&format!(
            "state server count is too large (allowed {})",
            max_peers
        )));
    }
    if current_voters > target {
        return Err(Error::CannotReduce {
            current: current_voters,
            requested: target,
        });
    }
    Ok(target - current_voters)
}

impl State {
    /// Adds state server machines until `num_state_servers` of them vote.
    ///
    /// New machines run both [`MachineJob::HostUnits`] and
    /// [`MachineJob::ManageEnviron`] and are created with `cons` and
    /// `series`.  They are all added in one transaction along with the
    /// update to [`crate::StateServerInfo`]; if that transaction is rejected
    /// no machine is created.  Calling this when the target has already been
    /// reached does nothing.
    pub async fn ensure_availability(
        &self,
        num_state_servers: usize,
        cons: Constraints,
        series: &str,
    ) -> Result<(), Error> {
        // Validate the target before touching the store.
        state_servers_needed(num_state_servers, 0, self.max_peers)?;
        self.check_environment_alive().await?;

        let info = self.state_server_info().await?;
        // Count voters rather than all state servers: non-voting ones do not
        // contribute to the quorum, so counting them would leave it short.
        let need = state_servers_needed(
            num_state_servers,
            info.voting_machine_ids.len(),
            self.max_peers,
        )?;
        if need == 0 {
            debug!(self.log, "state server count already satisfied";
                "count" => num_state_servers);
            return Ok(());
        }

        let mut mdocs = Vec::with_capacity(need);
        let mut ops = Vec::new();
        for _ in 0..need {
            let template = MachineTemplate::new(
                series,
                vec![MachineJob::HostUnits, MachineJob::ManageEnviron],
            )
            .with_constraints(cons.clone());
            let (mdoc, add_ops) = self.add_machine_ops(template).await?;
            mdocs.push(mdoc);
            ops.extend(add_ops);
        }

        let new_voters = mdocs.iter().filter(|m| !m.no_vote).count();
        let voters = info.voting_machine_ids.len() + new_voters;
        bail_unless!(
            voters == num_state_servers && voters % 2 == 1,
            "planned {} voting state servers, wanted {}",
            voters,
            num_state_servers
        );
        ops.extend(add_state_servers_op(&mdocs, &info));

        self.commit(ops)
            .await
            .internal_context("failed to create new state server machines")?;
        let ids: Vec<&str> = mdocs.iter().map(|m| m.id.as_str()).collect();
        info!(self.log, "added state servers";
            "machine_ids" => ?ids, "voting" => voters);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::MAX_PEERS;
    use crate::test_helpers::state_test;
    use assert_matches::assert_matches;
    use fleet_test_utils::dev::test_setup_log;

    #[test]
    fn test_state_servers_needed() {
        assert_eq!(state_servers_needed(3, 1, MAX_PEERS), Ok(2));
        assert_eq!(state_servers_needed(3, 3, MAX_PEERS), Ok(0));
        assert_eq!(state_servers_needed(7, 0, MAX_PEERS), Ok(7));
        for bad in [0, 2, 4, 9] {
            assert_matches!(
                state_servers_needed(bad, 0, MAX_PEERS),
                Err(Error::InvalidTarget { .. })
            );
        }
        assert_eq!(
            state_servers_needed(3, 5, MAX_PEERS),
            Err(Error::CannotReduce { current: 5, requested: 3 })
        );
    }

    #[tokio::test]
    async fn test_ensure_availability_from_scratch() {
        let logctx = test_setup_log("test_ensure_availability_from_scratch");
        let state = state_test(&logctx.log, "mem=2G").await;

        state
            .ensure_availability(3, "cpu-cores=2".parse().unwrap(), "jammy")
            .await
            .unwrap();
        let info = state.state_server_info().await.unwrap();
        assert_eq!(info.machine_ids, vec!["0", "1", "2"]);
        assert_eq!(info.voting_machine_ids, vec!["0", "1", "2"]);
        assert_eq!(
            state.machine_constraints("2").await.unwrap(),
            "mem=2G cpu-cores=2".parse::<Constraints>().unwrap()
        );

        // Asking again is a no-op.
        state
            .ensure_availability(3, Constraints::default(), "jammy")
            .await
            .unwrap();
        assert_eq!(state.sequence("machine").await.unwrap(), 3);

        logctx.cleanup_successful();
    }
}
