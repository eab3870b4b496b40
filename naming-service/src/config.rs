// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot-time topology: a small TOML file naming which task index
//! should be treated as already registered for a given service before
//! any task has had a chance to call `register` itself.
//!
//! This has no teacher counterpart (its app.toml describes interrupt
//! and peripheral ownership, not service names), but the pack's
//! `xous-core` reference material configures its name server the same
//! way: a static table read once at boot, with ordinary registration
//! layered on top for everything dynamic.

use std::fmt;
use std::path::Path;

use abi::{ServiceId, TaskId};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown service name {0:?}")]
    UnknownService(String),
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    reservation: Vec<RawReservation>,
}

#[derive(Debug, Deserialize)]
struct RawReservation {
    service: String,
    task: u16,
    #[serde(default)]
    clonable: bool,
}

/// One statically-assigned `ServiceId` -> provider-task pairing.
#[derive(Copy, Clone, Debug)]
pub struct Reservation {
    pub service: ServiceId,
    pub task: TaskId,
    /// Seeds the service straight into the clonable queue instead of
    /// the fixed-provider table (spec C4's second, clonable-service
    /// table).
    pub clonable: bool,
}

/// The naming service's boot-time configuration (spec C4's naming
/// service Non-goals exclude persistence, not static seeding).
#[derive(Debug, Default)]
pub struct BootConfig {
    pub reservations: Vec<Reservation>,
}

impl BootConfig {
    pub fn empty() -> Self {
        Self {
            reservations: Vec::new(),
        }
    }

    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: "<inline>".into(),
            source,
        })?;
        let mut reservations = Vec::with_capacity(raw.reservation.len());
        for r in raw.reservation {
            let service = parse_service(&r.service)?;
            reservations.push(Reservation {
                service,
                task: TaskId::for_index_and_gen(r.task as usize, abi::Generation::ZERO),
                clonable: r.clonable,
            });
        }
        Ok(Self { reservations })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        Self::from_str(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path_ref.display().to_string(),
                source,
            },
            other => other,
        })
    }
}

fn parse_service(name: &str) -> Result<ServiceId, ConfigError> {
    match name {
        "echo" => Ok(ServiceId::Echo),
        "clock" => Ok(ServiceId::Clock),
        "net" => Ok(ServiceId::Net),
        other => other
            .strip_prefix("custom:")
            .and_then(|n| n.parse::<u32>().ok())
            .map(ServiceId::Custom)
            .ok_or_else(|| ConfigError::UnknownService(other.to_string())),
    }
}

impl fmt::Display for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} -> {:?}", self.service, self.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_reservations() {
        let cfg = BootConfig::from_str(
            r#"
            [[reservation]]
            service = "clock"
            task = 2

            [[reservation]]
            service = "custom:7"
            task = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.reservations.len(), 2);
        assert_eq!(cfg.reservations[0].service, ServiceId::Clock);
        assert_eq!(cfg.reservations[1].service, ServiceId::Custom(7));
    }

    #[test]
    fn clonable_defaults_to_false_and_can_be_set() {
        let cfg = BootConfig::from_str(
            r#"
            [[reservation]]
            service = "echo"
            task = 1

            [[reservation]]
            service = "net"
            task = 4
            clonable = true
            "#,
        )
        .unwrap();
        assert!(!cfg.reservations[0].clonable);
        assert!(cfg.reservations[1].clonable);
    }

    #[test]
    fn rejects_unknown_service_name() {
        let err = BootConfig::from_str(
            r#"
            [[reservation]]
            service = "bogus"
            task = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownService(_)));
    }

    #[test]
    fn empty_file_yields_no_reservations() {
        let cfg = BootConfig::from_str("").unwrap();
        assert!(cfg.reservations.is_empty());
    }
}
