//! `/proc` backend for Linux.
//!
//! Processes are the numeric directories under the proc root, modules are
//! the file-backed mappings listed in `maps`, and the process capability is
//! an open handle on `mem`.

use std::fs::{self, File, OpenOptions, ReadDir};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::anyhow;

use crate::error::SnapshotKind;
use crate::process::api::{ModuleInfo, Pid, ProcessApi, ProcessEntry};
use crate::process::ProcessAccess;
use crate::{memop_err, MemOpError, MemOpResult};

const DELETED_SUFFIX: &str = " (deleted)";

#[derive(Debug, Clone)]
pub struct ProcfsApi {
    root: PathBuf,
}

impl Default for ProcfsApi {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcfsApi {
    /// Reads process information from `root` instead of `/proc`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn process_dir(&self, pid: Pid) -> PathBuf {
        self.root.join(pid.to_string())
    }
}

/// An open `/proc/<pid>/mem`.
#[derive(Debug)]
pub struct ProcfsCapability {
    pid: Pid,
    file: File,
}

impl ProcfsCapability {
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

/// Lazily walks the proc root; the directory handle closes on drop.
pub struct ProcessSnapshot {
    entries: ReadDir,
}

impl Iterator for ProcessSnapshot {
    type Item = ProcessEntry;

    fn next(&mut self) -> Option<ProcessEntry> {
        for entry in self.entries.by_ref() {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<Pid>().ok()) else {
                continue;
            };
            // The process may exit between listing and lookup.
            if let Some(name) = image_name(&entry.path()) {
                return Some(ProcessEntry { pid, name });
            }
        }

        None
    }
}

/// File name of the `exe` link, or `comm` when the link is unreadable.
fn image_name(dir: &Path) -> Option<String> {
    if let Ok(target) = fs::read_link(dir.join("exe")) {
        let target = target.to_string_lossy();
        let target = target.strip_suffix(DELETED_SUFFIX).unwrap_or(&target);
        if let Some(name) = Path::new(target).file_name() {
            return Some(name.to_string_lossy().into_owned());
        }
    }

    fs::read_to_string(dir.join("comm"))
        .ok()
        .map(|comm| comm.trim_end_matches('\n').to_string())
}

/// One mapping of a `maps` file. `Ok(None)` for anonymous and pseudo
/// mappings (`[heap]`, `[stack]`, ...).
fn parse_maps_line(line: &str) -> MemOpResult<Option<(String, usize, usize)>> {
    let range = line
        .split_whitespace()
        .next()
        .ok_or_else(|| memop_err!("empty maps line"))?;
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| memop_err!("malformed address range \"{}\"", range))?;
    let start = usize::from_str_radix(start, 16)
        .map_err(|e| memop_err!("bad start address in \"{}\": {}", range, e))?;
    let end = usize::from_str_radix(end, 16)
        .map_err(|e| memop_err!("bad end address in \"{}\": {}", range, e))?;
    if end < start {
        return Err(memop_err!("inverted address range \"{}\"", range));
    }

    let Some(path_start) = line.find('/') else {
        return Ok(None);
    };
    let path = line[path_start..].trim_end();
    let path = path.strip_suffix(DELETED_SUFFIX).unwrap_or(path);

    Ok(Some((path.to_string(), start, end)))
}

/// Groups the mappings of a `maps` file by backing file, in first-seen
/// order. Each module spans from its lowest start to its highest end.
pub fn parse_maps(maps: &str) -> Vec<MemOpResult<ModuleInfo>> {
    let mut spans: Vec<(String, usize, usize)> = Vec::new();
    let mut rows: Vec<MemOpResult<usize>> = Vec::new();

    for line in maps.lines().filter(|l| !l.trim().is_empty()) {
        match parse_maps_line(line) {
            Ok(Some((path, start, end))) => {
                match spans.iter_mut().position(|(p, _, _)| *p == path) {
                    Some(i) => {
                        spans[i].1 = spans[i].1.min(start);
                        spans[i].2 = spans[i].2.max(end);
                    }
                    None => {
                        rows.push(Ok(spans.len()));
                        spans.push((path, start, end));
                    }
                }
            }
            Ok(None) => {}
            Err(e) => rows.push(Err(e)),
        }
    }

    rows.into_iter()
        .map(|row| {
            row.map(|i| {
                let (path, base, end) = &spans[i];
                let name = Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone());
                ModuleInfo {
                    name,
                    base: *base,
                    size: end - base,
                }
            })
        })
        .collect()
}

impl ProcessApi for ProcfsApi {
    type Capability = ProcfsCapability;
    type Processes = ProcessSnapshot;
    type Modules = std::vec::IntoIter<MemOpResult<ModuleInfo>>;

    fn processes(&self) -> MemOpResult<Self::Processes> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            MemOpError::SnapshotFailed((SnapshotKind::Processes, Some(anyhow::Error::new(e))))
        })?;

        Ok(ProcessSnapshot { entries })
    }

    fn modules(&self, pid: Pid) -> MemOpResult<Self::Modules> {
        let maps = fs::read_to_string(self.process_dir(pid).join("maps")).map_err(|e| {
            MemOpError::SnapshotFailed((SnapshotKind::Modules, Some(anyhow::Error::new(e))))
        })?;

        Ok(parse_maps(&maps).into_iter())
    }

    fn open(&self, pid: Pid, access: ProcessAccess) -> MemOpResult<Self::Capability> {
        if !access.can_read() && !access.can_write() {
            return Err(MemOpError::OpenFailed((
                pid,
                Some(anyhow!("access mask {:#x} grants neither read nor write", access.bits())),
            )));
        }

        let path = self.process_dir(pid).join("mem");
        let file = OpenOptions::new()
            .read(access.can_read())
            .write(access.can_write())
            .open(&path)
            .map_err(|e| {
                MemOpError::OpenFailed((pid, Some(anyhow::Error::new(e).context(path.display().to_string()))))
            })?;

        Ok(ProcfsCapability { pid, file })
    }

    fn duplicate(&self, capability: &Self::Capability) -> MemOpResult<Self::Capability> {
        Ok(ProcfsCapability {
            pid: capability.pid,
            file: capability.file.try_clone()?,
        })
    }

    fn is_valid(&self, _capability: &Self::Capability) -> bool {
        // A `File` always owns an open descriptor.
        true
    }

    fn read(
        &self,
        capability: &Self::Capability,
        address: usize,
        buf: &mut [u8],
    ) -> MemOpResult<usize> {
        Ok(capability.file.read_at(buf, address as u64)?)
    }

    fn write(
        &self,
        capability: &Self::Capability,
        address: usize,
        bytes: &[u8],
    ) -> MemOpResult<usize> {
        Ok(capability.file.write_at(bytes, address as u64)?)
    }
}
