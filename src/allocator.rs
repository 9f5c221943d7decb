//! Identifier and port allocation for one cluster run.
//!
//! The allocators are thin strategies over [`Allocations`], the run-wide
//! bookkeeping owned by the cluster. The app-id counter and the claimed-port
//! registry are the only state shared between app constructions.

use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};

use tracing::{debug, trace};
use uuid::Uuid;

use crate::errors::AllocationError;

/// Identifier of an App within a cluster run.
pub type AppId = u32;

/// Default number of probes before port allocation gives up.
pub const PORT_ALLOCATION_ATTEMPTS: u32 = 100;

/// Run-wide allocation state.
#[derive(Debug)]
pub struct Allocations {
    next_id: AppId,
    tcp_ports: HashMap<u16, AppId>,
}

impl Default for Allocations {
    fn default() -> Self {
        Self {
            next_id: 1,
            tcp_ports: HashMap::new(),
        }
    }
}

impl Allocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// The app that claimed `port` in this run, if any.
    pub fn port_owner(&self, port: u16) -> Option<AppId> {
        self.tcp_ports.get(&port).copied()
    }

    pub fn claimed_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.tcp_ports.keys().copied()
    }

    /// Record `port` as claimed by `app` without probing it.
    pub fn claim(&mut self, port: u16, app: AppId) {
        self.tcp_ports.insert(port, app);
    }
}

/// Monotonic integer ids.
pub struct IdAllocator<'a> {
    state: &'a mut Allocations,
}

impl<'a> IdAllocator<'a> {
    pub fn new(state: &'a mut Allocations) -> Self {
        Self { state }
    }

    pub fn next(&mut self) -> AppId {
        let id = self.state.next_id;
        self.state.next_id += 1;
        id
    }
}

/// TCP ports that are free according to the kernel and unique within the run.
///
/// The kernel is asked by binding a throwaway listener on the wildcard
/// address; the listener is closed straight away. Two probes can still hand
/// back the same just-released port, so every port returned is also recorded
/// in the run registry and never handed out again.
pub struct TcpPortAllocator<'a> {
    state: &'a mut Allocations,
    attempts: u32,
}

impl<'a> TcpPortAllocator<'a> {
    pub fn new(state: &'a mut Allocations) -> Self {
        Self {
            state,
            attempts: PORT_ALLOCATION_ATTEMPTS,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Allocate a port for `app`.
    ///
    /// With `preferred`, the preferred port is tried first and then each
    /// following port number in turn. Without it the kernel picks.
    pub fn next(&mut self, app: AppId, preferred: Option<u16>) -> Result<u16, AllocationError> {
        let preferred = preferred.filter(|p| *p != 0);
        let mut port = preferred.unwrap_or(0);

        for _ in 0..self.attempts {
            match probe(port) {
                Ok(bound) => {
                    if let Some(owner) = self.state.port_owner(bound) {
                        trace!(port = bound, owner, "port already claimed in this run");
                        if preferred.is_some() {
                            match bound.checked_add(1) {
                                Some(next) => port = next,
                                None => break,
                            }
                        }
                        continue;
                    }
                    self.state.claim(bound, app);
                    debug!(port = bound, app, "allocated tcp port");
                    return Ok(bound);
                }
                Err(e) if preferred.is_some() => {
                    trace!(port, error = %e, "preferred port not bindable");
                    match port.checked_add(1) {
                        Some(next) => port = next,
                        None => break,
                    }
                }
                Err(e) => return Err(AllocationError::Probe(e)),
            }
        }

        Err(AllocationError::Exhausted {
            preferred,
            attempts: self.attempts,
        })
    }
}

fn probe(port: u16) -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
    let bound = listener.local_addr()?.port();
    drop(listener);
    Ok(bound)
}

/// Random tokens for unique path suffixes and container names.
pub struct UuidAllocator;

impl UuidAllocator {
    /// A new v4 UUID, truncated to at most `trunc` characters.
    pub fn next(trunc: usize) -> String {
        let mut id = Uuid::new_v4().to_string();
        id.truncate(trunc);
        id
    }
}
