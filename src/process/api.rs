use crate::process::ProcessAccess;
use crate::{MemOpError, MemOpResult};

/// OS process identifier.
pub type Pid = u32;

/// One row of a process snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: Pid,
    /// Image name as reported by the OS, e.g. `"csgo.exe"`.
    pub name: String,
}

/// One row of a module snapshot, as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub base: usize,
    pub size: usize,
}

/// The host facilities this crate is built on: process and module
/// enumeration, process capabilities, and foreign-memory transfer.
///
/// Snapshots are iterators that own the underlying OS snapshot, so it is
/// released when the iterator is dropped no matter how iteration ends.
/// Capabilities are released by dropping them.
pub trait ProcessApi {
    type Capability;
    type Processes: Iterator<Item = ProcessEntry>;
    /// Per-module failures come back as `Err` items instead of ending the snapshot.
    type Modules: Iterator<Item = MemOpResult<ModuleInfo>>;

    fn processes(&self) -> MemOpResult<Self::Processes>;

    fn modules(&self, pid: Pid) -> MemOpResult<Self::Modules>;

    fn open(&self, pid: Pid, access: ProcessAccess) -> MemOpResult<Self::Capability>;

    /// Produces an independent capability with the same target and rights.
    fn duplicate(&self, capability: &Self::Capability) -> MemOpResult<Self::Capability>;

    /// False for every sentinel the platform uses to mean "no capability".
    fn is_valid(&self, capability: &Self::Capability) -> bool;

    /// Reads into `buf`, returning how many bytes were transferred.
    fn read(&self, capability: &Self::Capability, address: usize, buf: &mut [u8])
        -> MemOpResult<usize>;

    /// Writes `bytes`, returning how many bytes were transferred.
    fn write(&self, capability: &Self::Capability, address: usize, bytes: &[u8])
        -> MemOpResult<usize>;
}

/// Returns the pid of the first running process whose image name equals
/// `name` exactly (case-sensitive).
pub fn find_process_id<A: ProcessApi>(api: &A, name: &str) -> MemOpResult<Pid> {
    api.processes()?
        .find(|entry| entry.name == name)
        .map(|entry| entry.pid)
        .ok_or_else(|| MemOpError::ProcessNotFound(name.to_string()))
}
