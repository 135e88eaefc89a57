// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resource constraints used when choosing an instance for a machine
//!
//! A [`Constraints`] value records only the fields a user actually asked for;
//! every field is optional.  Machine constraints are layered over the
//! environment-wide defaults with [`Constraints::with_fallbacks()`].
//!
//! The textual form is a space-separated list of `key=value` pairs, e.g.
//! `"mem=4G cpu-cores=4 tags=ssd,fast"`.

use crate::instance::ContainerType;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_power: Option<u64>,
    /// memory, in MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    /// root disk size, in MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_disk: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConstraintsParseError {
    #[error("malformed constraint {0:?}")]
    Malformed(String),
    #[error("unknown constraint {0:?}")]
    Unknown(String),
    #[error("constraint {key:?} specified more than once")]
    Duplicate { key: String },
    #[error("bad {key:?} constraint: {message}")]
    BadValue { key: String, message: String },
}

impl Constraints {
    /// Returns a copy of `self` where every unset field is taken from
    /// `fallbacks`.
    pub fn with_fallbacks(&self, fallbacks: &Constraints) -> Constraints {
        Constraints {
            arch: self.arch.clone().or_else(|| fallbacks.arch.clone()),
            container: self.container.or(fallbacks.container),
            cpu_cores: self.cpu_cores.or(fallbacks.cpu_cores),
            cpu_power: self.cpu_power.or(fallbacks.cpu_power),
            mem: self.mem.or(fallbacks.mem),
            root_disk: self.root_disk.or(fallbacks.root_disk),
            tags: self.tags.clone().or_else(|| fallbacks.tags.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Constraints::default()
    }
}

impl FromStr for Constraints {
    type Err = ConstraintsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cons = Constraints::default();
        for word in s.split_whitespace() {
            let (key, value) = word
                .split_once('=')
                .ok_or_else(|| ConstraintsParseError::Malformed(word.into()))?;
            let bad_value = |message: String| ConstraintsParseError::BadValue {
                key: key.to_string(),
                message,
            };
            let duplicate =
                || ConstraintsParseError::Duplicate { key: key.to_string() };
            match key {
                "arch" => {
                    if cons.arch.is_some() {
                        return Err(duplicate());
                    }
                    if value.is_empty() {
                        return Err(bad_value("empty architecture".into()));
                    }
                    cons.arch = Some(value.to_string());
                }
                "container" => {
                    if cons.container.is_some() {
                        return Err(duplicate());
                    }
                    let ctype = ContainerType::from_str(value)
                        .map_err(|e| bad_value(e.to_string()))?;
                    cons.container = Some(ctype);
                }
                "cpu-cores" | "cpu-power" => {
                    let n = value
                        .parse::<u64>()
                        .map_err(|e| bad_value(e.to_string()))?;
                    let slot = if key == "cpu-cores" {
                        &mut cons.cpu_cores
                    } else {
                        &mut cons.cpu_power
                    };
                    if slot.is_some() {
                        return Err(duplicate());
                    }
                    *slot = Some(n);
                }
                "mem" | "root-disk" => {
                    let mib = parse_mib(value).map_err(bad_value)?;
                    let slot = if key == "mem" {
                        &mut cons.mem
                    } else {
                        &mut cons.root_disk
                    };
                    if slot.is_some() {
                        return Err(duplicate());
                    }
                    *slot = Some(mib);
                }
                "tags" => {
                    if cons.tags.is_some() {
                        return Err(duplicate());
                    }
                    cons.tags = Some(
                        value
                            .split(',')
                            .filter(|t| !t.is_empty())
                            .map(String::from)
                            .collect(),
                    );
                }
                _ => return Err(ConstraintsParseError::Unknown(key.into())),
            }
        }
        Ok(cons)
    }
}

/// Parses a size such as `512`, `512M`, `4G` or `1.5T` into MiB, rounding up.
fn parse_mib(value: &str) -> Result<u64, String> {
    let (number, multiplier) = match value.char_indices().last() {
        Some((i, 'M')) => (&value[..i], 1.0),
        Some((i, 'G')) => (&value[..i], 1024.0),
        Some((i, 'T')) => (&value[..i], 1024.0 * 1024.0),
        Some((i, 'P')) => (&value[..i], 1024.0 * 1024.0 * 1024.0),
        Some(_) => (value, 1.0),
        None => return Err("empty size".to_string()),
    };
    let n: f64 = number.parse().map_err(|_| {
        format!(
            "must be a non-negative float with optional M/G/T/P suffix, \
             got {:?}",
            value
        )
    })?;
    if n.is_nan() || n < 0.0 || !n.is_finite() {
        return Err(format!("must be non-negative, got {:?}", value));
    }
    let mib = (n * multiplier).ceil();
    if mib >= u64::MAX as f64 {
        return Err(format!("size is too large, got {:?}", value));
    }
    Ok(mib as u64)
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut words = Vec::new();
        if let Some(arch) = &self.arch {
            words.push(format!("arch={}", arch));
        }
        if let Some(container) = &self.container {
            words.push(format!("container={}", container));
        }
        if let Some(n) = self.cpu_cores {
            words.push(format!("cpu-cores={}", n));
        }
        if let Some(n) = self.cpu_power {
            words.push(format!("cpu-power={}", n));
        }
        if let Some(n) = self.mem {
            words.push(format!("mem={}M", n));
        }
        if let Some(n) = self.root_disk {
            words.push(format!("root-disk={}M", n));
        }
        if let Some(tags) = &self.tags {
            words.push(format!("tags={}", tags.join(",")));
        }
        f.write_str(&words.join(" "))
    }
}
