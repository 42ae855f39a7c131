//! In-memory `ProcessApi` for tests.
//!
//! Simulates a process table, per-process module lists and mapped memory,
//! and counts live snapshots and capabilities so release discipline can be
//! asserted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SnapshotKind;
use crate::process::api::{ModuleInfo, Pid, ProcessApi, ProcessEntry};
use crate::process::ProcessAccess;
use crate::{memop_err, MemOpError, MemOpResult};

#[derive(Default)]
struct MockState {
    processes: Vec<ProcessEntry>,
    modules: HashMap<Pid, Vec<Result<ModuleInfo, String>>>,
    regions: HashMap<Pid, Vec<(usize, Vec<u8>)>>,
    denied: HashSet<Pid>,
    revoked: HashSet<Pid>,
    fail_process_snapshots: bool,
    fail_module_snapshots: bool,
    fail_duplicate: bool,
    transfer_limit: Option<usize>,
    live_snapshots: usize,
    live_capabilities: usize,
    next_id: u64,
}

impl MockState {
    fn region_mut(&mut self, pid: Pid, address: usize) -> Option<(&mut Vec<u8>, usize)> {
        self.regions
            .get_mut(&pid)?
            .iter_mut()
            .find(|(base, bytes)| address >= *base && address - *base < bytes.len())
            .map(|(base, bytes)| {
                let start = address - *base;
                (bytes, start)
            })
    }

    fn transfer_len(&self, requested: usize, available: usize) -> usize {
        let len = requested.min(available);
        match self.transfer_limit {
            Some(limit) => len.min(limit),
            None => len,
        }
    }
}

/// Cheap to clone; clones share one simulated system.
#[derive(Clone, Default)]
pub struct MockApi {
    state: Arc<Mutex<MockState>>,
}

pub struct MockCapability {
    id: u64,
    pid: Pid,
    access: ProcessAccess,
    state: Arc<Mutex<MockState>>,
}

impl MockCapability {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn access(&self) -> ProcessAccess {
        self.access
    }
}

impl Drop for MockCapability {
    fn drop(&mut self) {
        self.state.lock().live_capabilities -= 1;
    }
}

pub struct MockSnapshot<T> {
    items: std::vec::IntoIter<T>,
    state: Arc<Mutex<MockState>>,
}

impl<T> Iterator for MockSnapshot<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.items.next()
    }
}

impl<T> Drop for MockSnapshot<T> {
    fn drop(&mut self) {
        self.state.lock().live_snapshots -= 1;
    }
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a running process.
    pub fn spawn(&self, pid: Pid, name: &str) {
        self.state.lock().processes.push(ProcessEntry {
            pid,
            name: name.to_string(),
        });
    }

    /// Removes a process and its memory. Open capabilities stay valid but
    /// transfers through them fail.
    pub fn kill(&self, pid: Pid) {
        let mut state = self.state.lock();
        state.processes.retain(|p| p.pid != pid);
        state.regions.remove(&pid);
        state.modules.remove(&pid);
    }

    pub fn add_module(&self, pid: Pid, name: &str, base: usize, size: usize) {
        self.state.lock().modules.entry(pid).or_default().push(Ok(ModuleInfo {
            name: name.to_string(),
            base,
            size,
        }));
    }

    /// Adds a module row the snapshot reports as unreadable.
    pub fn add_broken_module(&self, pid: Pid, name: &str) {
        self.state
            .lock()
            .modules
            .entry(pid)
            .or_default()
            .push(Err(name.to_string()));
    }

    /// Maps `bytes` at `base` in the address space of `pid`.
    pub fn map(&self, pid: Pid, base: usize, bytes: Vec<u8>) {
        self.state.lock().regions.entry(pid).or_default().push((base, bytes));
    }

    /// Adds a module and maps its image in one step.
    pub fn load_module(&self, pid: Pid, name: &str, base: usize, image: Vec<u8>) {
        self.add_module(pid, name, base, image.len());
        self.map(pid, base, image);
    }

    /// Reads simulated memory directly, bypassing capabilities.
    pub fn peek(&self, pid: Pid, address: usize, len: usize) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let (bytes, start) = state.region_mut(pid, address)?;
        bytes.get(start..start + len).map(|b| b.to_vec())
    }

    /// Makes `open` fail for this pid.
    pub fn deny_access(&self, pid: Pid) {
        self.state.lock().denied.insert(pid);
    }

    /// Makes every capability for this pid report itself invalid.
    pub fn revoke(&self, pid: Pid) {
        self.state.lock().revoked.insert(pid);
    }

    pub fn fail_process_snapshots(&self, fail: bool) {
        self.state.lock().fail_process_snapshots = fail;
    }

    pub fn fail_module_snapshots(&self, fail: bool) {
        self.state.lock().fail_module_snapshots = fail;
    }

    pub fn fail_duplicate(&self, fail: bool) {
        self.state.lock().fail_duplicate = fail;
    }

    /// Caps every read and write at `limit` bytes, producing short transfers.
    pub fn limit_transfers(&self, limit: Option<usize>) {
        self.state.lock().transfer_limit = limit;
    }

    pub fn live_snapshots(&self) -> usize {
        self.state.lock().live_snapshots
    }

    pub fn live_capabilities(&self) -> usize {
        self.state.lock().live_capabilities
    }

    fn snapshot<T>(&self, state: &mut MockState, items: Vec<T>) -> MockSnapshot<T> {
        state.live_snapshots += 1;
        MockSnapshot {
            items: items.into_iter(),
            state: Arc::clone(&self.state),
        }
    }

    fn capability(&self, state: &mut MockState, pid: Pid, access: ProcessAccess) -> MockCapability {
        state.live_capabilities += 1;
        state.next_id += 1;
        MockCapability {
            id: state.next_id,
            pid,
            access,
            state: Arc::clone(&self.state),
        }
    }
}

impl ProcessApi for MockApi {
    type Capability = MockCapability;
    type Processes = MockSnapshot<ProcessEntry>;
    type Modules = MockSnapshot<MemOpResult<ModuleInfo>>;

    fn processes(&self) -> MemOpResult<Self::Processes> {
        let mut state = self.state.lock();
        if state.fail_process_snapshots {
            return Err(MemOpError::SnapshotFailed((SnapshotKind::Processes, None)));
        }

        let items = state.processes.clone();
        Ok(self.snapshot(&mut state, items))
    }

    fn modules(&self, pid: Pid) -> MemOpResult<Self::Modules> {
        let mut state = self.state.lock();
        if state.fail_module_snapshots || !state.processes.iter().any(|p| p.pid == pid) {
            return Err(MemOpError::SnapshotFailed((SnapshotKind::Modules, None)));
        }

        let items = state
            .modules
            .get(&pid)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|row| row.map_err(|name| memop_err!("malformed module entry \"{}\"", name)))
            .collect();
        Ok(self.snapshot(&mut state, items))
    }

    fn open(&self, pid: Pid, access: ProcessAccess) -> MemOpResult<Self::Capability> {
        let mut state = self.state.lock();
        if !state.processes.iter().any(|p| p.pid == pid) {
            return Err(MemOpError::OpenFailed((pid, Some(anyhow::anyhow!("no such process")))));
        }
        if state.denied.contains(&pid) {
            return Err(MemOpError::OpenFailed((pid, Some(anyhow::anyhow!("access denied")))));
        }

        Ok(self.capability(&mut state, pid, access))
    }

    fn duplicate(&self, capability: &Self::Capability) -> MemOpResult<Self::Capability> {
        let mut state = self.state.lock();
        if state.fail_duplicate || !capability.access.contains(ProcessAccess::DUP_HANDLE) {
            return Err(memop_err!("duplicating capability {} denied", capability.id));
        }

        Ok(self.capability(&mut state, capability.pid, capability.access))
    }

    fn is_valid(&self, capability: &Self::Capability) -> bool {
        !self.state.lock().revoked.contains(&capability.pid)
    }

    fn read(
        &self,
        capability: &Self::Capability,
        address: usize,
        buf: &mut [u8],
    ) -> MemOpResult<usize> {
        if !capability.access.can_read() {
            return Err(memop_err!("capability {} lacks read access", capability.id));
        }

        let mut state = self.state.lock();
        let (available, start) = match state.region_mut(capability.pid, address) {
            Some((bytes, start)) => (bytes.len() - start, start),
            None => return Err(memop_err!("{:#x} is not mapped", address)),
        };
        let len = state.transfer_len(buf.len(), available);
        if let Some((bytes, _)) = state.region_mut(capability.pid, address) {
            buf[..len].copy_from_slice(&bytes[start..start + len]);
        }
        Ok(len)
    }

    fn write(
        &self,
        capability: &Self::Capability,
        address: usize,
        data: &[u8],
    ) -> MemOpResult<usize> {
        if !capability.access.can_write() {
            return Err(memop_err!("capability {} lacks write access", capability.id));
        }

        let mut state = self.state.lock();
        let (available, start) = match state.region_mut(capability.pid, address) {
            Some((bytes, start)) => (bytes.len() - start, start),
            None => return Err(memop_err!("{:#x} is not mapped", address)),
        };
        let len = state.transfer_len(data.len(), available);
        if let Some((bytes, _)) = state.region_mut(capability.pid, address) {
            bytes[start..start + len].copy_from_slice(&data[..len]);
        }
        Ok(len)
    }
}
