//! Win32 backend: Toolhelp snapshots, `OpenProcess` handles and
//! `ReadProcessMemory`/`WriteProcessMemory` transfers.

use std::ffi::c_void;
use std::mem::size_of;

use anyhow::anyhow;
use log::warn;
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE, INVALID_HANDLE_VALUE,
};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, Process32FirstW, Process32NextW,
    MODULEENTRY32W, PROCESSENTRY32W, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcess, PROCESS_ACCESS_RIGHTS};

use crate::error::{FromWindowsResult, SnapshotKind};
use crate::process::api::{ModuleInfo, Pid, ProcessApi, ProcessEntry};
use crate::process::ProcessAccess;
use crate::{MemOpError, MemOpResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct WinApi;

/// A kernel handle closed on drop.
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if handle_is_valid(self.0) {
            if let Err(e) = unsafe { CloseHandle(self.0) } {
                warn!("CloseHandle({:?}) failed: {e}", self.0);
            }
        }
    }
}

fn handle_is_valid(handle: HANDLE) -> bool {
    !handle.0.is_null() && handle != INVALID_HANDLE_VALUE
}

/// The part of a fixed-size wide string field before its first NUL.
fn wide_chars(raw: &[u16]) -> &[u16] {
    let len = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    &raw[..len]
}

fn wide_str(raw: &[u16]) -> Result<String, std::string::FromUtf16Error> {
    String::from_utf16(wide_chars(raw))
}

/// A running Toolhelp process snapshot.
pub struct ProcessSnapshot {
    snapshot: OwnedHandle,
    entry: PROCESSENTRY32W,
    started: bool,
    done: bool,
}

impl Iterator for ProcessSnapshot {
    type Item = ProcessEntry;

    fn next(&mut self) -> Option<ProcessEntry> {
        if self.done {
            return None;
        }

        let step = if self.started {
            unsafe { Process32NextW(self.snapshot.raw(), &mut self.entry) }
        } else {
            self.started = true;
            unsafe { Process32FirstW(self.snapshot.raw(), &mut self.entry) }
        };
        if step.is_err() {
            self.done = true;
            return None;
        }

        Some(ProcessEntry {
            pid: self.entry.th32ProcessID,
            name: String::from_utf16_lossy(wide_chars(&self.entry.szExeFile)),
        })
    }
}

/// A running Toolhelp module snapshot.
pub struct ModuleSnapshot {
    snapshot: OwnedHandle,
    entry: MODULEENTRY32W,
    started: bool,
    done: bool,
}

impl Iterator for ModuleSnapshot {
    type Item = MemOpResult<ModuleInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let step = if self.started {
            unsafe { Module32NextW(self.snapshot.raw(), &mut self.entry) }
        } else {
            self.started = true;
            unsafe { Module32FirstW(self.snapshot.raw(), &mut self.entry) }
        };
        if step.is_err() {
            self.done = true;
            return None;
        }

        let base = self.entry.modBaseAddr as usize;
        Some(
            wide_str(&self.entry.szModule)
                .map(|name| ModuleInfo {
                    name,
                    base,
                    size: self.entry.modBaseSize as usize,
                })
                .map_err(|e| MemOpError::Other(anyhow!("module at {base:#x} has a bad name: {e}"))),
        )
    }
}

impl ProcessApi for WinApi {
    type Capability = OwnedHandle;
    type Processes = ProcessSnapshot;
    type Modules = ModuleSnapshot;

    fn processes(&self) -> MemOpResult<Self::Processes> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }.map_err(|e| {
            MemOpError::SnapshotFailed((SnapshotKind::Processes, Some(anyhow::Error::new(e))))
        })?;

        let mut entry = PROCESSENTRY32W::default();
        entry.dwSize = size_of::<PROCESSENTRY32W>() as u32;
        Ok(ProcessSnapshot {
            snapshot: OwnedHandle(snapshot),
            entry,
            started: false,
            done: false,
        })
    }

    fn modules(&self, pid: Pid) -> MemOpResult<Self::Modules> {
        let snapshot =
            unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) }
                .map_err(|e| {
                    MemOpError::SnapshotFailed((SnapshotKind::Modules, Some(anyhow::Error::new(e))))
                })?;

        let mut entry = MODULEENTRY32W::default();
        entry.dwSize = size_of::<MODULEENTRY32W>() as u32;
        Ok(ModuleSnapshot {
            snapshot: OwnedHandle(snapshot),
            entry,
            started: false,
            done: false,
        })
    }

    fn open(&self, pid: Pid, access: ProcessAccess) -> MemOpResult<Self::Capability> {
        let handle = unsafe { OpenProcess(PROCESS_ACCESS_RIGHTS(access.bits()), false, pid) }
            .map_err(|e| MemOpError::OpenFailed((pid, Some(anyhow::Error::new(e)))))?;

        Ok(OwnedHandle(handle))
    }

    fn duplicate(&self, capability: &Self::Capability) -> MemOpResult<Self::Capability> {
        let mut duplicated = HANDLE::default();
        unsafe {
            let current = GetCurrentProcess();
            DuplicateHandle(
                current,
                capability.raw(),
                current,
                &mut duplicated,
                0,
                false,
                DUPLICATE_SAME_ACCESS,
            )
        }
        .into_memop_result(Some(anyhow!("DuplicateHandle in duplicate()")))?;

        Ok(OwnedHandle(duplicated))
    }

    fn is_valid(&self, capability: &Self::Capability) -> bool {
        handle_is_valid(capability.raw())
    }

    fn read(
        &self,
        capability: &Self::Capability,
        address: usize,
        buf: &mut [u8],
    ) -> MemOpResult<usize> {
        let mut bytes_read = 0usize;
        let result = unsafe {
            ReadProcessMemory(
                capability.raw(),
                address as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                Some(&mut bytes_read),
            )
        };

        // ERROR_PARTIAL_COPY still reports how much arrived.
        match result {
            Err(_) if bytes_read > 0 => Ok(bytes_read),
            other => other
                .into_memop_result(Some(anyhow!("ReadProcessMemory at {address:#x}")))
                .map(|_| bytes_read),
        }
    }

    fn write(
        &self,
        capability: &Self::Capability,
        address: usize,
        bytes: &[u8],
    ) -> MemOpResult<usize> {
        let mut bytes_written = 0usize;
        let result = unsafe {
            WriteProcessMemory(
                capability.raw(),
                address as *const c_void,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                Some(&mut bytes_written),
            )
        };

        match result {
            Err(_) if bytes_written > 0 => Ok(bytes_written),
            other => other
                .into_memop_result(Some(anyhow!("WriteProcessMemory at {address:#x}")))
                .map(|_| bytes_written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RemoteProcess;

    #[test]
    fn test_sentinel_handles_are_invalid() {
        assert!(!handle_is_valid(HANDLE::default()));
        assert!(!handle_is_valid(INVALID_HANDLE_VALUE));
    }

    #[test]
    fn test_wide_str_stops_at_nul() {
        let mut raw = [0u16; 16];
        for (slot, c) in raw.iter_mut().zip("game.exe".encode_utf16()) {
            *slot = c;
        }
        assert_eq!(wide_str(&raw).unwrap(), "game.exe");
    }

    #[test]
    fn test_self_attach_round_trip() {
        let mut process = RemoteProcess::new(WinApi);
        process.attach(std::process::id(), ProcessAccess::READ_WRITE).unwrap();
        assert!(!process.modules().is_empty());

        let value = Box::new(0x1122_3344u32);
        let address = &*value as *const u32 as usize;
        assert_eq!(process.read::<u32>(address).unwrap(), 0x1122_3344);
    }
}
