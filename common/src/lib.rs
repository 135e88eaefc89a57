// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common facilities used across the fleet control plane
//!
//! This crate holds the types shared between the document store and the
//! machine state layer: the public [`error::Error`] type, resource
//! [`constraints::Constraints`], and descriptions of provider instances.

pub mod constraints;
pub mod error;
pub mod instance;
