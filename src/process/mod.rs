pub mod api;
pub mod handle;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod module;
pub mod pattern;

use std::ops::BitOr;

use log::warn;

use crate::memory::{self, RemoteTyped};
use crate::process::api::{Pid, ProcessApi, ProcessEntry};
use crate::process::handle::{AttachTarget, ProcessHandle};
use crate::process::module::{ModuleCatalog, ModuleEntry};
use crate::process::pattern::SigMatch;
use crate::{MemOpError, MemOpResult};

/// Runs `$block` with the handle's capability bound to `$cap`, or fails
/// with `MemOpError::NotAttached` when there is none.
///
/// # Example
/// ```rust,ignore
/// let n = with_handle!(&handle, |cap| -> usize, {
///     handle.api().read(cap, address, &mut buf)
/// })?;
/// ```
#[macro_export]
macro_rules! with_handle {
    ($handle:expr, |$cap:ident| -> $ret:ty, $block:expr) => {{
        let result: $crate::MemOpResult<$ret> = match $handle.capability() {
            Some($cap) => $block,
            None => Err($crate::MemOpError::NotAttached),
        };
        result
    }};
}

/// Process access rights, using the Win32 `PROCESS_*` bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessAccess(u32);

impl ProcessAccess {
    pub const VM_OPERATION: Self = Self(0x0008);
    pub const VM_READ: Self = Self(0x0010);
    pub const VM_WRITE: Self = Self(0x0020);
    pub const DUP_HANDLE: Self = Self(0x0040);
    pub const FULL: Self = Self(0x001F_FFFF);

    pub const READ_ONLY: Self = Self(Self::VM_OPERATION.0 | Self::VM_READ.0);
    pub const WRITE_ONLY: Self = Self(Self::VM_OPERATION.0 | Self::VM_WRITE.0);
    pub const READ_WRITE: Self = Self(Self::READ_ONLY.0 | Self::WRITE_ONLY.0);

    /// Wraps a raw capability mask.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn can_read(self) -> bool {
        self.contains(Self::VM_READ)
    }

    pub const fn can_write(self) -> bool {
        self.contains(Self::VM_WRITE)
    }
}

impl Default for ProcessAccess {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

impl BitOr for ProcessAccess {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Top-level object: one process attachment plus the catalog of its modules.
///
/// Single-threaded by contract; every call blocks on the OS.
pub struct RemoteProcess<A: ProcessApi> {
    handle: ProcessHandle<A>,
    modules: ModuleCatalog,
}

#[cfg(any(windows, target_os = "linux"))]
impl RemoteProcess<crate::os::NativeApi> {
    /// Uses the platform's native backend.
    pub fn native() -> Self {
        Self::new(crate::os::NativeApi::default())
    }
}

impl<A: ProcessApi> RemoteProcess<A> {
    pub fn new(api: A) -> Self {
        Self {
            handle: ProcessHandle::new(api),
            modules: ModuleCatalog::default(),
        }
    }

    /// Attaches by pid or exact image name, then builds the module catalog.
    ///
    /// A catalog failure is logged and leaves the attachment in place with
    /// an empty catalog.
    pub fn attach(
        &mut self,
        target: impl Into<AttachTarget>,
        access: ProcessAccess,
    ) -> MemOpResult<Pid> {
        let pid = self.handle.attach(target, access)?;

        if let Err(e) = self.modules.rebuild(&self.handle) {
            warn!("attached to {pid} but module catalog rebuild failed: {e}");
        }

        Ok(pid)
    }

    /// Clears the catalog and releases the capability. Safe when unattached.
    pub fn detach(&mut self) {
        self.modules.clear();
        self.handle.detach();
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_attached()
    }

    pub fn pid(&self) -> Option<Pid> {
        self.handle.pid()
    }

    pub fn handle(&self) -> &ProcessHandle<A> {
        &self.handle
    }

    /// Lists running processes.
    pub fn processes(&self) -> MemOpResult<Vec<ProcessEntry>> {
        Ok(self.handle.api().processes()?.collect())
    }

    pub fn modules(&self) -> &ModuleCatalog {
        &self.modules
    }

    /// Case-insensitive module lookup.
    pub fn module(&self, name: &str) -> Option<&ModuleEntry> {
        self.modules.get(name)
    }

    /// Rebuilds the module catalog, returning the number of modules.
    pub fn refresh_modules(&mut self) -> MemOpResult<usize> {
        self.modules.rebuild(&self.handle)
    }

    /// Scans the named module's image for `pattern`; `'x'` in `mask` marks
    /// bytes that must match, anything else is a wildcard.
    pub fn scan(
        &self,
        module_name: &str,
        pattern: &[u8],
        mask: &str,
        start_offset: usize,
    ) -> MemOpResult<SigMatch> {
        let module = self
            .modules
            .get(module_name)
            .ok_or_else(|| MemOpError::ModuleNotFound(module_name.to_string()))?;

        pattern::scan_module(&self.handle, module, pattern, mask, start_offset)
    }

    pub fn read<T: RemoteTyped>(&self, address: usize) -> MemOpResult<T> {
        memory::read::read_value(&self.handle, address)
    }

    /// Lenient read: the zero value on any failure.
    pub fn read_or_default<T: RemoteTyped>(&self, address: usize) -> T {
        memory::read::read_or_default(&self.handle, address)
    }

    /// Fills `value` only when all of its bytes were read.
    pub fn read_into<T: RemoteTyped>(&self, address: usize, value: &mut T) -> MemOpResult<()> {
        memory::read::read_into(&self.handle, address, value)
    }

    pub fn read_bytes(&self, address: usize, size: usize) -> MemOpResult<Vec<u8>> {
        memory::read::read_bytes(&self.handle, address, size)
    }

    pub fn read_pointer_chain<T: RemoteTyped>(&self, address: usize, offsets: &[usize]) -> T {
        memory::read::read_pointer_chain(&self.handle, address, offsets)
    }

    pub fn try_read_pointer_chain<T: RemoteTyped>(
        &self,
        address: usize,
        offsets: &[usize],
    ) -> MemOpResult<T> {
        memory::read::try_read_pointer_chain(&self.handle, address, offsets)
    }

    pub fn write<T: RemoteTyped>(&self, address: usize, value: T) -> MemOpResult<()> {
        memory::write::write_value(&self.handle, address, value)
    }

    pub fn write_bytes(&self, address: usize, bytes: &[u8]) -> MemOpResult<()> {
        memory::write::write_bytes(&self.handle, address, bytes)
    }
}

impl<A: ProcessApi + Clone> Clone for RemoteProcess<A> {
    /// The copy holds its own duplicated capability and a copy of the catalog.
    fn clone(&self) -> Self {
        let handle = self.handle.clone();
        let modules = match handle.is_attached() {
            true => self.modules.clone(),
            false => ModuleCatalog::default(),
        };

        Self { handle, modules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mock::MockApi;

    const CLIENT_BASE: usize = 0x1000_0000;

    fn target() -> MockApi {
        let api = MockApi::new();
        api.spawn(42, "game.exe");

        let mut image = vec![0u8; 0x100];
        image[0x40..0x44].copy_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        api.load_module(42, "client.dll", CLIENT_BASE, image);
        api.load_module(42, "Engine.DLL", 0x2000_0000, vec![0xCC; 0x80]);
        api.map(42, 0x5000, vec![0u8; 0x40]);
        api
    }

    #[test]
    fn test_access_presets() {
        assert_eq!(ProcessAccess::READ_ONLY.bits(), 0x18);
        assert_eq!(ProcessAccess::WRITE_ONLY.bits(), 0x28);
        assert_eq!(ProcessAccess::READ_WRITE.bits(), 0x38);
        assert!(ProcessAccess::FULL.contains(ProcessAccess::READ_WRITE));
        assert!(ProcessAccess::FULL.contains(ProcessAccess::DUP_HANDLE));
        assert!(!ProcessAccess::READ_ONLY.can_write());
        assert!(!ProcessAccess::WRITE_ONLY.can_read());
        assert_eq!(
            ProcessAccess::READ_ONLY | ProcessAccess::WRITE_ONLY,
            ProcessAccess::READ_WRITE
        );
    }

    #[test]
    fn test_attach_by_name_builds_catalog() {
        let mut process = RemoteProcess::new(target());
        assert_eq!(process.attach("game.exe", ProcessAccess::READ_WRITE).unwrap(), 42);

        assert_eq!(process.modules().len(), 2);
        assert_eq!(process.module("CLIENT.DLL").unwrap().base, CLIENT_BASE);
        assert_eq!(process.module("engine.dll").unwrap().size, 0x80);
    }

    #[test]
    fn test_attach_survives_catalog_failure() {
        let api = target();
        api.fail_module_snapshots(true);
        let mut process = RemoteProcess::new(api);

        assert!(process.attach(42u32, ProcessAccess::READ_ONLY).is_ok());
        assert!(process.is_attached());
        assert!(process.modules().is_empty());
    }

    #[test]
    fn test_detach_clears_everything() {
        let api = target();
        let mut process = RemoteProcess::new(api.clone());
        process.attach(42u32, ProcessAccess::READ_WRITE).unwrap();

        process.detach();
        assert!(!process.is_attached());
        assert!(process.modules().is_empty());
        assert_eq!(api.live_capabilities(), 0);

        process.detach();
        assert!(!process.is_attached());
    }

    #[test]
    fn test_scan_by_module_name() {
        let mut process = RemoteProcess::new(target());
        process.attach(42u32, ProcessAccess::READ_ONLY).unwrap();

        let found = process
            .scan("Client.dll", &[0x11, 0x22, 0x00, 0x44], "xx?x", 0)
            .unwrap();
        assert_eq!(found.offset, 0x40);
        assert_eq!(found.address(), CLIENT_BASE + 0x40);
        assert_eq!(found.bytes(), &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_scan_unknown_module() {
        let mut process = RemoteProcess::new(target());
        process.attach(42u32, ProcessAccess::READ_ONLY).unwrap();

        let err = process.scan("server.dll", &[0x90], "x", 0).unwrap_err();
        assert!(matches!(err, MemOpError::ModuleNotFound(ref n) if n == "server.dll"));
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut process = RemoteProcess::new(target());
        process.attach(42u32, ProcessAccess::READ_WRITE).unwrap();

        process.write::<i32>(0x5010, -1337).unwrap();
        assert_eq!(process.read::<i32>(0x5010).unwrap(), -1337);
        assert_eq!(process.read_or_default::<i32>(0x5010), -1337);
    }

    #[test]
    fn test_clone_outlives_original() {
        let api = target();
        let mut original = RemoteProcess::new(api.clone());
        original.attach(42u32, ProcessAccess::READ_WRITE).unwrap();

        let copy = original.clone();
        original.detach();

        assert!(copy.is_attached());
        assert_eq!(copy.pid(), Some(42));
        assert!(copy.module("client.dll").is_some());
        copy.write::<u32>(0x5000, 7).unwrap();
        assert_eq!(copy.read::<u32>(0x5000).unwrap(), 7);
        assert_eq!(api.live_capabilities(), 1);
    }

    #[test]
    fn test_processes_listing() {
        let process = RemoteProcess::new(target());
        let list = process.processes().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "game.exe");
    }
}
