// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the fleet control plane

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

/// An error that can be generated within a control plane component
///
/// Every failure in machine provisioning and state server maintenance is
/// returned to the caller as one of these variants.  Nothing here is fatal to
/// the process; whether to retry is up to the caller, and
/// [`Error::retryable()`] says which variants are worth retrying.
///
/// General best practices for error design apply here.  Where possible, we want
/// to reuse existing variants rather than inventing new ones to distinguish
/// cases that no programmatic consumer needs to distinguish.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// The machine template supplied by the caller is malformed.
    #[error("Invalid Template: {message}")]
    InvalidTemplate { message: String },
    /// The request was well-formed, but the operation cannot be completed given
    /// the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// A job was requested in a context where it is not permitted.
    #[error("Permission Denied: {message}")]
    PermissionDenied { message: String },
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {type_name}) not found: {lookup_type}")]
    ObjectNotFound { type_name: ResourceType, lookup_type: LookupType },
    /// An object already exists with the specified name or identifier.
    #[error("Object (of type {type_name}) already exists: {object_name}")]
    ObjectAlreadyExists { type_name: ResourceType, object_name: String },
    /// The parent machine has declared that it cannot host this kind of
    /// container.
    #[error("machine {machine_id} cannot host {container_type} containers")]
    UnsupportedContainer { machine_id: String, container_type: String },
    /// The instance precheck refused to provision a new instance.
    #[error("Provisioning Rejected: {message}")]
    ProvisioningRejected { message: String },
    /// The environment is being torn down.
    #[error("environment is no longer alive")]
    EnvironmentNotAlive,
    /// State server jobs were requested outside of the bootstrap path and
    /// outside of `ensure_availability`.
    #[error("state server jobs specified without calling EnsureAvailability")]
    StateServerNotAllowed,
    /// Shrinking the set of voting state servers is not supported.
    #[error(
        "cannot reduce state server count (currently {current}, \
         requested {requested})"
    )]
    CannotReduce { current: usize, requested: usize },
    /// The requested number of state servers is not usable as a quorum.
    #[error("Invalid Target: {message}")]
    InvalidTarget { message: String },
    /// A concurrent writer changed a document this transaction asserted on.
    ///
    /// The caller may re-read state and recompute the transaction.
    #[error("Transaction Aborted: {internal_message}")]
    TransactionAborted { internal_message: String },

    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
    /// The system (or part of it) is unavailable.
    #[error("Service Unavailable: {internal_message}")]
    ServiceUnavailable { internal_message: String },
}

/// Identifies the kind of object named in an [`Error`]
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
#[strum(serialize_all = "kebab-case")]
pub enum ResourceType {
    Environment,
    Machine,
    ContainerRef,
    Constraints,
    Status,
    InstanceData,
    StateServerInfo,
    Sequence,
}

/// Indicates how an object was looked up (for an `ObjectNotFound` error)
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum LookupType {
    /// a specific id was requested
    ById(String),
    /// a document was requested by its global key (e.g. `"m#3"`)
    ByGlobalKey(String),
}

impl Display for LookupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupType::ById(id) => write!(f, "id \"{}\"", id),
            LookupType::ByGlobalKey(key) => write!(f, "key \"{}\"", key),
        }
    }
}

impl LookupType {
    /// Returns an ObjectNotFound error appropriate for the case where this
    /// lookup failed
    pub fn into_not_found(self, type_name: ResourceType) -> Error {
        Error::ObjectNotFound { type_name, lookup_type: self }
    }
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried
    pub fn retryable(&self) -> bool {
        match self {
            Error::TransactionAborted { .. }
            | Error::ServiceUnavailable { .. } => true,

            Error::InvalidTemplate { .. }
            | Error::InvalidRequest { .. }
            | Error::PermissionDenied { .. }
            | Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::UnsupportedContainer { .. }
            | Error::ProvisioningRejected { .. }
            | Error::EnvironmentNotAlive
            | Error::StateServerNotAllowed
            | Error::CannotReduce { .. }
            | Error::InvalidTarget { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by id.
    pub fn not_found_by_id(type_name: ResourceType, id: &str) -> Error {
        LookupType::ById(id.to_owned()).into_not_found(type_name)
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should not
    /// happen but that we cannot reasonably handle at runtime (e.g.,
    /// deserializing a stored document, or finding a document that is
    /// supposed to be a singleton missing).
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Generates an [`Error::InvalidTemplate`] error with the specific message
    pub fn invalid_template(message: &str) -> Error {
        Error::InvalidTemplate { message: message.to_owned() }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    ///
    /// This should be used for failures due possibly to invalid client input
    /// or malformed requests.
    pub fn invalid_request(message: &str) -> Error {
        Error::InvalidRequest { message: message.to_owned() }
    }

    pub fn permission_denied(message: &str) -> Error {
        Error::PermissionDenied { message: message.to_owned() }
    }

    pub fn invalid_target(message: &str) -> Error {
        Error::InvalidTarget { message: message.to_owned() }
    }

    /// Generates an [`Error::ServiceUnavailable`] error with the specific
    /// message
    ///
    /// This should be used for transient failures where the caller might be
    /// expected to retry.  Logic errors or other problems indicating that a
    /// retry would not work should probably be an InternalError (if it's a
    /// server problem) or InvalidRequest (if it's a client problem) instead.
    pub fn unavail(message: &str) -> Error {
        Error::ServiceUnavailable { internal_message: message.to_owned() }
    }

    /// Given an [`Error`] with an internal message, return the same error with
    /// `context` prepended to it to provide more context
    ///
    /// If the error has no internal message, then it is returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Error::InvalidTemplate { .. }
            | Error::InvalidRequest { .. }
            | Error::PermissionDenied { .. }
            | Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::UnsupportedContainer { .. }
            | Error::ProvisioningRejected { .. }
            | Error::EnvironmentNotAlive
            | Error::StateServerNotAllowed
            | Error::CannotReduce { .. }
            | Error::InvalidTarget { .. } => self,
            Error::TransactionAborted { internal_message } => {
                Error::TransactionAborted {
                    internal_message: format!(
                        "{}: {}",
                        context, internal_message
                    ),
                }
            }
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
            Error::ServiceUnavailable { internal_message } => {
                Error::ServiceUnavailable {
                    internal_message: format!(
                        "{}: {}",
                        context, internal_message
                    ),
                }
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::internal_error(&e.to_string())
    }
}

/// Like [`assert!`], except that instead of panicking, this function returns an
/// `Err(Error::InternalError)` with an appropriate message if the given
/// condition is not true.
#[macro_export]
macro_rules! bail_unless {
    ($cond:expr $(,)?) => {
        $crate::bail_unless!(
            $cond,
            "failed runtime check: {:?}",
            stringify!($cond)
        )
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            Err($crate::error::Error::internal_error(&format!(
                $($arg)*)))?;
        }
    };
}

/// Implements a pattern similar to `anyhow::Context` for providing extra
/// context for internal error messages
///
/// Unlike `anyhow::Context`, this does not add a new Error to the cause chain.
/// It replaces the given Error with one that has the modified
/// `internal_message`.
///
/// ## Example
///
/// ```
/// use fleet_common::error::Error;
/// use fleet_common::error::InternalContext;
///
/// let error: Result<(), Error> = Err(Error::internal_error("boom"));
/// assert_eq!(
///     error.internal_context("uh-oh").unwrap_err().to_string(),
///     "Internal Error: uh-oh: boom"
/// );
/// ```
pub trait InternalContext<T> {
    fn internal_context<C>(self, s: C) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    fn with_internal_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T> InternalContext<T> for Result<T, Error> {
    fn internal_context<C>(self, context: C) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        self.map_err(|error| error.internal_context(context))
    }

    fn with_internal_context<C, F>(self, make_context: F) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|error| error.internal_context(make_context()))
    }
}

#[cfg(test)]
mod test {
    use super::Error;
    use super::InternalContext;
    use super::ResourceType;

    #[test]
    fn test_bail_unless() {
        #![allow(clippy::eq_op)]
        // Success cases
        let no_bail = || -> Result<(), Error> {
            bail_unless!(1 + 1 == 2, "wrong answer: {}", 3);
            Ok(())
        };
        assert_eq!(Ok(()), no_bail());

        // Failure cases
        let do_bail = || {
            bail_unless!(1 + 1 == 3);
            Ok(())
        };
        let do_bail_label = || {
            bail_unless!(1 + 1 == 3, "uh-oh");
            Ok(())
        };
        let do_bail_label_args = || {
            bail_unless!(1 + 1 == 3, "wrong answer: {}", 3);
            Ok(())
        };

        let checks = [
            (do_bail(), "failed runtime check: \"1 + 1 == 3\""),
            (do_bail_label(), "uh-oh"),
            (do_bail_label_args(), "wrong answer: 3"),
        ];

        for (result, expected_message) in &checks {
            let error = result.as_ref().unwrap_err();
            if let Error::InternalError { internal_message } = error {
                assert_eq!(*expected_message, internal_message);
            } else {
                panic!("got something other than an InternalError");
            }
        }
    }

    #[test]
    fn test_context() {
        let error: Result<(), Error> = Err(Error::internal_error("boom"));
        match error.internal_context("uh-oh") {
            Err(Error::InternalError { internal_message }) => {
                assert_eq!(internal_message, "uh-oh: boom");
            }
            _ => panic!("returned wrong type"),
        };

        let error: Result<(), Error> =
            Err(Error::TransactionAborted { internal_message: "lost".into() });
        let error = error.with_internal_context(|| "adding machines");
        assert_eq!(
            error.unwrap_err().to_string(),
            "Transaction Aborted: adding machines: lost"
        );

        // Variants without an internal message come back unchanged.
        let error: Result<(), Error> = Err(Error::EnvironmentNotAlive);
        assert_eq!(
            error.internal_context("ignored"),
            Err(Error::EnvironmentNotAlive)
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::TransactionAborted { internal_message: "x".into() }
            .retryable());
        assert!(!Error::EnvironmentNotAlive.retryable());
        assert!(!Error::StateServerNotAllowed.retryable());
        assert!(
            !Error::not_found_by_id(ResourceType::Machine, "3").retryable()
        );
    }

    #[test]
    fn test_not_found_message() {
        let error = Error::not_found_by_id(ResourceType::Machine, "3/lxc/0");
        assert_eq!(
            error.to_string(),
            "Object (of type machine) not found: id \"3/lxc/0\""
        );
    }
}
