// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types describing the provider instance backing a machine

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// Provider-assigned identifier of the instance running a machine
#[derive(
    Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new<S: Into<String>>(id: S) -> InstanceId {
        InstanceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        InstanceId::new(id)
    }
}

/// The kind of container a machine may be nested in
///
/// `None` means "not a container"; asking for a container of that type is a
/// request error.
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
    strum::EnumIter,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ContainerType {
    None,
    Lxc,
    Kvm,
}

/// Hardware of an already-provisioned instance
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct HardwareCharacteristics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// memory, in MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    /// root disk size, in MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_disk: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_power: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Ipv4,
    Ipv6,
    Hostname,
}

/// How widely an address is reachable
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkScope {
    #[default]
    Unknown,
    Public,
    CloudLocal,
    MachineLocal,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Address {
    pub value: String,
    pub kind: AddressKind,
    pub scope: NetworkScope,
}

impl Address {
    /// Builds an address of unknown scope, inferring its kind from `value`.
    pub fn new<S: Into<String>>(value: S) -> Address {
        Address::new_scoped(value, NetworkScope::Unknown)
    }

    pub fn new_scoped<S: Into<String>>(
        value: S,
        scope: NetworkScope,
    ) -> Address {
        let value = value.into();
        let kind = match value.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => AddressKind::Ipv4,
            Ok(IpAddr::V6(_)) => AddressKind::Ipv6,
            Err(_) => AddressKind::Hostname,
        };
        Address { value, kind, scope }
    }
}
