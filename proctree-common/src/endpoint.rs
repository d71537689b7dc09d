// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Endpoint value types, as named by §6: the address forms `Ports` binds
//! and the persisted port-set blob keys on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// A bindable address. `Endpoint` values are the keys of a `Ports` slot's
/// map and the entries of the persisted port-set blob (§6): `(kind,
/// address, port)` tuples, here represented as a tagged enum rather than a
/// raw tuple so serialization round-trips and `match` dispatch stay typed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// UNIX-socket-like endpoint: a directory plus a socket filename.
    Local { directory: PathBuf, filename: String },
    /// IPv4 endpoint.
    Ip4 { address: Ipv4Addr, port: u16 },
    /// IPv6 endpoint.
    Ip6 { address: Ipv6Addr, port: u16 },
    /// In-process logical interface, addressed by an id/port pair rather
    /// than a kernel socket. Used by `Mitre`/`Sockets` wiring that never
    /// leaves the process (e.g. `ProcessManager` fan-out to workers that
    /// share the parent's `Ports` device over coprocess addressing).
    Coprocess { id: u32, port: u16 },
}

impl Endpoint {
    pub fn local(directory: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Endpoint::Local {
            directory: directory.into(),
            filename: filename.into(),
        }
    }

    pub fn ip4(address: Ipv4Addr, port: u16) -> Self {
        Endpoint::Ip4 { address, port }
    }

    pub fn ip6(address: Ipv6Addr, port: u16) -> Self {
        Endpoint::Ip6 { address, port }
    }

    pub fn coprocess(id: u32, port: u16) -> Self {
        Endpoint::Coprocess { id, port }
    }

    /// Whether binding this endpoint means creating a filesystem path that
    /// must not already exist as a non-socket entry (§7 "Port-set
    /// conflict").
    pub fn is_filesystem_backed(&self) -> bool {
        matches!(self, Endpoint::Local { .. })
    }

    /// Resolved filesystem path for `Local` endpoints, used both to bind
    /// and to detect the pre-existing-non-socket conflict case.
    pub fn local_path(&self) -> Option<PathBuf> {
        match self {
            Endpoint::Local { directory, filename } => Some(directory.join(filename)),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local { directory, filename } => {
                write!(f, "local:{}", directory.join(filename).display())
            }
            Endpoint::Ip4 { address, port } => write!(f, "ip4:{address}:{port}"),
            Endpoint::Ip6 { address, port } => write!(f, "ip6:[{address}]:{port}"),
            Endpoint::Coprocess { id, port } => write!(f, "coprocess:{id}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_path_joins_directory_and_filename() {
        let e = Endpoint::local("/var/run/proctree", "control.sock");
        assert_eq!(
            e.local_path().as_deref(),
            Some(std::path::Path::new("/var/run/proctree/control.sock"))
        );
        assert!(e.is_filesystem_backed());
    }

    #[test]
    fn ip4_is_not_filesystem_backed() {
        let e = Endpoint::ip4(Ipv4Addr::LOCALHOST, 9090);
        assert!(!e.is_filesystem_backed());
        assert_eq!(e.to_string(), "ip4:127.0.0.1:9090");
    }

    #[test]
    fn endpoints_round_trip_through_bincode() {
        let e = Endpoint::coprocess(3, 1);
        let bytes = bincode::serialize(&e).expect("serialize");
        let back: Endpoint = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(e, back);
    }
}
