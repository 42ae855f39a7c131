use std::collections::HashMap;

use log::{debug, warn};

use crate::process::api::{ModuleInfo, ProcessApi};
use crate::process::handle::ProcessHandle;
use crate::{memop_err, MemOpError, MemOpResult};

/// A loaded module's location in the target's address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    /// Name as the OS reported it, before normalization.
    pub name: String,
    pub base: usize,
    pub size: usize,
}

impl ModuleEntry {
    /// One past the last byte of the image.
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

impl TryFrom<ModuleInfo> for ModuleEntry {
    type Error = MemOpError;

    /// Every reported row becomes an entry, empty ones included; only a
    /// range that wraps the address space is refused.
    fn try_from(info: ModuleInfo) -> MemOpResult<Self> {
        if info.base.checked_add(info.size).is_none() {
            return Err(memop_err!(
                "module \"{}\" at {:#x} overflows the address space",
                info.name,
                info.base
            ));
        }

        Ok(ModuleEntry {
            name: info.name,
            base: info.base,
            size: info.size,
        })
    }
}

/// Lower-cases a module name for catalog keys.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
}

/// Modules of the attached process, keyed by lower-cased name.
#[derive(Debug, Clone, Default)]
pub struct ModuleCatalog {
    modules: HashMap<String, ModuleEntry>,
}

impl ModuleCatalog {
    /// Re-enumerates the modules of the handle's process.
    ///
    /// The new table is built off to the side and swapped in once the
    /// snapshot has been walked. Rows that fail to parse are logged and
    /// skipped; when a name repeats, the first row wins. If the snapshot
    /// cannot be opened the catalog is left empty.
    pub fn rebuild<A: ProcessApi>(&mut self, handle: &ProcessHandle<A>) -> MemOpResult<usize> {
        let pid = match (handle.is_attached(), handle.pid()) {
            (true, Some(pid)) => pid,
            _ => return Err(MemOpError::NotAttached),
        };

        let snapshot = match handle.api().modules(pid) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.modules.clear();
                return Err(e);
            }
        };

        let mut modules = HashMap::new();
        for row in snapshot {
            match row.and_then(ModuleEntry::try_from) {
                Ok(entry) => {
                    modules.entry(normalize_name(&entry.name)).or_insert(entry);
                }
                Err(e) => warn!("skipping module of process {pid}: {e}"),
            }
        }

        debug!("catalogued {} modules of process {pid}", modules.len());
        self.modules = modules;

        Ok(self.modules.len())
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&ModuleEntry> {
        self.modules.get(&normalize_name(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModuleEntry)> {
        self.modules.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn clear(&mut self) {
        self.modules.clear();
    }
}
