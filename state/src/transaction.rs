// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Committing compiled operations to the document store

use crate::environment::Life;
use crate::State;
use fleet_common::error::Error;
use fleet_docstore::Op;
use slog::{debug, warn};

/// Converts an error from the document store into a public error.
pub(crate) fn public_error_from_store(error: fleet_docstore::Error) -> Error {
    match error {
        fleet_docstore::Error::Aborted { .. } => {
            Error::TransactionAborted { internal_message: error.to_string() }
        }
        fleet_docstore::Error::InvalidOp { .. } => {
            Error::internal_error(&error.to_string())
        }
        fleet_docstore::Error::Unavailable(message) => Error::unavail(&message),
    }
}

impl State {
    /// Runs `ops` as one transaction, guarded by an assertion that the
    /// environment is alive.
    ///
    /// If the transaction is rejected, the environment is re-read to decide
    /// between [`Error::EnvironmentNotAlive`] and the store's own conflict
    /// error.  Nothing is retried here.
    pub(crate) async fn commit(&self, ops: Vec<Op>) -> Result<(), Error> {
        let mut env = self.environment().await?;
        if env.life() != Life::Alive {
            return Err(Error::EnvironmentNotAlive);
        }

        let mut batch = Vec::with_capacity(ops.len() + 1);
        batch.push(env.assert_alive_op());
        batch.extend(ops);
        debug!(self.log, "running transaction"; "ops" => batch.len());

        let error = match self.store.run_transaction(batch).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        match env.refresh().await {
            Ok(()) if env.life() == Life::Alive => {
                warn!(self.log, "transaction aborted";
                    "error" => %error, "environment_alive" => true);
                Err(public_error_from_store(error))
            }
            Ok(()) | Err(Error::ObjectNotFound { .. }) => {
                warn!(self.log, "transaction aborted";
                    "error" => %error, "environment_alive" => false);
                Err(Error::EnvironmentNotAlive)
            }
            Err(refresh_error) => Err(refresh_error),
        }
    }
}
