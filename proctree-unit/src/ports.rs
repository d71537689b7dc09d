// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `Ports` (§4.11, §6): the kernel descriptor table a unit binds listening
//! sockets into, keyed by slot name and then by [`Endpoint`]. A `Ports`
//! device outlives any one connection-accepting processor so a restarted
//! worker re-`acquire`s the same bound sockets rather than re-binding them.
//!
//! Handle transfer across a re-exec works in two steps:
//! [`Ports::prepare_for_exec`] clears `FD_CLOEXEC` on every live descriptor
//! so it survives the `exec`, and [`Ports::store`]/[`Ports::load`] persist
//! just the `slot -> endpoint -> descriptor number` table as a bincode blob
//! the child reads back — the sockets themselves cross the `exec` boundary
//! as inherited file descriptors, never serialized.

use std::collections::HashMap;
use std::fs;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Mutex;

use proctree_common::{Endpoint, MutexExt, Result, RuntimeError};
use tracing::{debug, warn};

/// One bound kernel socket. Variants other than `Synthetic` own the
/// listener so its descriptor stays open for the table's lifetime;
/// `Synthetic` covers `Endpoint::Coprocess` slots, which have no kernel
/// socket at all.
enum BoundSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
    Synthetic(RawFd),
}

impl BoundSocket {
    fn raw_fd(&self) -> RawFd {
        match self {
            BoundSocket::Tcp(l) => l.as_raw_fd(),
            BoundSocket::Unix(l) => l.as_raw_fd(),
            BoundSocket::Synthetic(fd) => *fd,
        }
    }
}

type Slot = HashMap<Endpoint, BoundSocket>;

/// The kernel descriptor table. Conventionally placed at `dev/ports`.
pub struct Ports {
    sets: Mutex<HashMap<String, Slot>>,
    synthetic_seq: Mutex<i32>,
}

impl Default for Ports {
    fn default() -> Self {
        Self::new()
    }
}

impl Ports {
    pub fn new() -> Self {
        Ports { sets: Mutex::new(HashMap::new()), synthetic_seq: Mutex::new(0) }
    }

    fn bind_one(&self, endpoint: &Endpoint) -> Result<BoundSocket> {
        if let Some(path) = endpoint.local_path() {
            if path.exists() && fs::metadata(&path).map(|m| !is_socket(&m)).unwrap_or(false) {
                return Err(RuntimeError::PortConflict {
                    slot: String::new(),
                    endpoint: endpoint.to_string(),
                });
            }
            if path.exists() {
                let _ = fs::remove_file(&path);
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(RuntimeError::Io)?;
            }
            let listener = UnixListener::bind(&path).map_err(RuntimeError::Io)?;
            listener.set_nonblocking(true).map_err(RuntimeError::Io)?;
            return Ok(BoundSocket::Unix(listener));
        }
        match endpoint {
            Endpoint::Ip4 { address, port } => {
                let listener = TcpListener::bind((*address, *port)).map_err(RuntimeError::Io)?;
                listener.set_nonblocking(true).map_err(RuntimeError::Io)?;
                Ok(BoundSocket::Tcp(listener))
            }
            Endpoint::Ip6 { address, port } => {
                let listener = TcpListener::bind((*address, *port)).map_err(RuntimeError::Io)?;
                listener.set_nonblocking(true).map_err(RuntimeError::Io)?;
                Ok(BoundSocket::Tcp(listener))
            }
            Endpoint::Coprocess { .. } => {
                let mut seq = self.synthetic_seq.lock_or_panic();
                *seq -= 1;
                Ok(BoundSocket::Synthetic(*seq))
            }
            Endpoint::Local { .. } => unreachable!("handled above via local_path"),
        }
    }

    /// §4.11 `bind`: binds every endpoint not already held by `slot`,
    /// leaving existing bindings for endpoints already present untouched.
    pub fn bind(&self, slot: &str, endpoints: &[Endpoint]) -> Result<()> {
        let mut sets = self.sets.lock_or_panic();
        let table = sets.entry(slot.to_string()).or_default();
        let mut bound = Vec::new();
        for endpoint in endpoints {
            if table.contains_key(endpoint) {
                continue;
            }
            match self.bind_one(endpoint) {
                Ok(socket) => bound.push((endpoint.clone(), socket)),
                Err(RuntimeError::PortConflict { endpoint: ep, .. }) => {
                    return Err(RuntimeError::PortConflict { slot: slot.to_string(), endpoint: ep });
                }
                Err(err) => return Err(err),
            }
        }
        for (endpoint, socket) in bound {
            table.insert(endpoint, socket);
        }
        Ok(())
    }

    /// Raw descriptors currently bound under `slot`, one per endpoint. The
    /// caller dups and wraps these for its own async runtime; `Ports`
    /// retains ownership so closing is always explicit via
    /// [`Ports::close`].
    pub fn acquire(&self, slot: &str) -> Vec<(Endpoint, RawFd)> {
        self.sets
            .lock_or_panic()
            .get(slot)
            .map(|table| table.iter().map(|(e, s)| (e.clone(), s.raw_fd())).collect())
            .unwrap_or_default()
    }

    pub fn endpoints(&self, slot: &str) -> Vec<Endpoint> {
        self.sets.lock_or_panic().get(slot).map(|t| t.keys().cloned().collect()).unwrap_or_default()
    }

    /// §4.11 `close`: drops the socket for one endpoint in `slot`, if any.
    pub fn close(&self, slot: &str, endpoint: &Endpoint) {
        if let Some(table) = self.sets.lock_or_panic().get_mut(slot) {
            if let Some(BoundSocket::Unix(_)) = table.get(endpoint) {
                if let Some(path) = endpoint.local_path() {
                    let _ = fs::remove_file(path);
                }
            }
            table.remove(endpoint);
        }
    }

    /// Closes every endpoint bound under `slot` and removes the slot
    /// itself, rather than leaving an empty table entry behind. For
    /// tearing down a whole worker's port set at once, where
    /// [`Ports::close`]'d per-endpoint loop would otherwise need the
    /// caller to enumerate `endpoints` itself first.
    pub fn discard(&self, slot: &str) {
        let table = self.sets.lock_or_panic().remove(slot);
        let Some(table) = table else { return };
        for (endpoint, socket) in table {
            if let BoundSocket::Unix(_) = socket {
                if let Some(path) = endpoint.local_path() {
                    let _ = fs::remove_file(path);
                }
            }
        }
    }

    /// §4.11 `replace`: symmetric-diff `slot` against `endpoints` — binds
    /// what's missing, closes what's no longer wanted.
    pub fn replace(&self, slot: &str, endpoints: &[Endpoint]) -> Result<()> {
        let current = self.endpoints(slot);
        let wanted: std::collections::HashSet<&Endpoint> = endpoints.iter().collect();
        for endpoint in current {
            if !wanted.contains(&endpoint) {
                self.close(slot, &endpoint);
            }
        }
        self.bind(slot, endpoints)
    }

    /// Clears `FD_CLOEXEC` on every bound descriptor so they survive an
    /// upcoming `exec`. Call immediately before re-exec'ing; the cleared
    /// flag is process-global state on the descriptor, not something
    /// `Ports` itself tracks.
    #[cfg(unix)]
    pub fn prepare_for_exec(&self) {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};
        let sets = self.sets.lock_or_panic();
        for (slot, table) in sets.iter() {
            for (endpoint, socket) in table.iter() {
                let fd = socket.raw_fd();
                if let Err(err) = fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())) {
                    warn!(%err, slot, %endpoint, "failed to clear FD_CLOEXEC before exec");
                }
            }
        }
    }

    /// §6: persists `slot -> endpoint -> descriptor number` as bincode.
    /// Must be called after [`Ports::prepare_for_exec`] and before the
    /// actual `exec`, so the numbers recorded here are still valid once the
    /// child reads them back with [`Ports::load`].
    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        let sets = self.sets.lock_or_panic();
        let table: HashMap<&String, HashMap<&Endpoint, RawFd>> = sets
            .iter()
            .map(|(slot, endpoints)| (slot, endpoints.iter().map(|(e, s)| (e, s.raw_fd())).collect()))
            .collect();
        let bytes = bincode::serialize(&table).map_err(|err| RuntimeError::fault_msg("dev/ports", err))?;
        fs::write(path, bytes).map_err(RuntimeError::Io)
    }

    /// Reconstructs a `Ports` table from a blob written by [`Ports::store`]
    /// in the parent before re-exec. The descriptors named in the blob must
    /// already be open in this process (inherited across the `exec`); they
    /// are adopted, not re-bound.
    ///
    /// # Safety
    /// Every descriptor number in `path`'s blob must refer to a socket this
    /// process actually inherited and does not otherwise own, matching the
    /// kind implied by its `Endpoint` (`Local` -> Unix, `Ip4`/`Ip6` -> TCP,
    /// `Coprocess` -> synthetic). Passing a blob from an unrelated process
    /// or one already consumed is undefined behavior.
    pub unsafe fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path).map_err(RuntimeError::Io)?;
        let table: HashMap<String, HashMap<Endpoint, RawFd>> =
            bincode::deserialize(&bytes).map_err(|err| RuntimeError::fault_msg("dev/ports", err))?;
        let mut sets = HashMap::new();
        for (slot, endpoints) in table {
            let mut resolved = Slot::new();
            for (endpoint, fd) in endpoints {
                let socket = match &endpoint {
                    Endpoint::Local { .. } => BoundSocket::Unix(UnixListener::from_raw_fd(fd)),
                    Endpoint::Ip4 { .. } | Endpoint::Ip6 { .. } => BoundSocket::Tcp(TcpListener::from_raw_fd(fd)),
                    Endpoint::Coprocess { .. } => BoundSocket::Synthetic(fd),
                };
                resolved.insert(endpoint, socket);
            }
            sets.insert(slot, resolved);
        }
        debug!(slots = sets.len(), "restored port set from inherited descriptors");
        Ok(Ports { sets: Mutex::new(sets), synthetic_seq: Mutex::new(0) })
    }
}

fn is_socket(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_socket()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn binding_an_ip_endpoint_makes_it_acquirable() {
        let ports = Ports::new();
        let endpoint = Endpoint::ip4(Ipv4Addr::LOCALHOST, 0);
        ports.bind("dev/ports/control", &[endpoint.clone()]).unwrap();
        let acquired = ports.acquire("dev/ports/control");
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].0, endpoint);
    }

    #[test]
    fn binding_the_same_endpoint_twice_is_idempotent() {
        let ports = Ports::new();
        let endpoint = Endpoint::ip4(Ipv4Addr::LOCALHOST, 0);
        ports.bind("slot", &[endpoint.clone()]).unwrap();
        let first = ports.acquire("slot")[0].1;
        ports.bind("slot", &[endpoint]).unwrap();
        let second = ports.acquire("slot")[0].1;
        assert_eq!(first, second);
    }

    #[test]
    fn replace_closes_dropped_endpoints_and_binds_new_ones() {
        let ports = Ports::new();
        let a = Endpoint::ip4(Ipv4Addr::LOCALHOST, 0);
        let b = Endpoint::coprocess(1, 1);
        ports.bind("slot", &[a.clone()]).unwrap();
        ports.replace("slot", &[b.clone()]).unwrap();
        let remaining = ports.endpoints("slot");
        assert_eq!(remaining, vec![b]);
    }

    #[test]
    fn discard_closes_every_endpoint_and_drops_the_slot() {
        let ports = Ports::new();
        let a = Endpoint::ip4(Ipv4Addr::LOCALHOST, 0);
        let b = Endpoint::coprocess(1, 1);
        ports.bind("slot", &[a, b]).unwrap();
        ports.discard("slot");
        assert!(ports.endpoints("slot").is_empty());
        assert!(ports.acquire("slot").is_empty());
    }

    #[test]
    fn local_endpoint_conflicting_with_a_non_socket_file_is_rejected() {
        let dir = std::env::temp_dir().join(format!("proctree-ports-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("not-a-socket");
        fs::write(&path, b"not a socket").unwrap();
        let ports = Ports::new();
        let endpoint = Endpoint::local(dir.clone(), "not-a-socket");
        let err = ports.bind("slot", &[endpoint]).unwrap_err();
        assert!(matches!(err, RuntimeError::PortConflict { .. }));
        fs::remove_dir_all(&dir).unwrap();
    }
}
