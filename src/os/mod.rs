//! Native `ProcessApi` backends.

#[cfg(target_os = "linux")]
pub mod procfs;
#[cfg(windows)]
pub mod win32;

#[cfg(target_os = "linux")]
pub type NativeApi = procfs::ProcfsApi;
#[cfg(windows)]
pub type NativeApi = win32::WinApi;
