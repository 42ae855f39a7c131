use log::{debug, warn};

use crate::process::api::{find_process_id, Pid, ProcessApi};
use crate::process::ProcessAccess;
use crate::{MemOpError, MemOpResult, MemOpResultExt};

/// What to attach to: a pid, or an exact image name resolved through a
/// process snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    Pid(Pid),
    Name(String),
}

impl From<Pid> for AttachTarget {
    fn from(pid: Pid) -> Self {
        AttachTarget::Pid(pid)
    }
}

impl From<&str> for AttachTarget {
    fn from(name: &str) -> Self {
        AttachTarget::Name(name.to_string())
    }
}

impl From<String> for AttachTarget {
    fn from(name: String) -> Self {
        AttachTarget::Name(name)
    }
}

/// Owns at most one capability on one target process.
///
/// Cloning duplicates the capability, so every copy is released on its own.
/// Dropping the handle releases its capability.
pub struct ProcessHandle<A: ProcessApi> {
    api: A,
    pid: Option<Pid>,
    access: ProcessAccess,
    capability: Option<A::Capability>,
}

impl<A: ProcessApi> ProcessHandle<A> {
    /// Creates an unattached handle.
    pub fn new(api: A) -> Self {
        Self {
            api,
            pid: None,
            access: ProcessAccess::default(),
            capability: None,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// The rights requested at attach time, without the implicit `DUP_HANDLE`.
    pub fn access(&self) -> ProcessAccess {
        self.access
    }

    /// The held capability, if it is present and valid.
    pub fn capability(&self) -> Option<&A::Capability> {
        self.capability
            .as_ref()
            .filter(|capability| self.api.is_valid(capability))
    }

    pub fn is_attached(&self) -> bool {
        self.capability().is_some()
    }

    /// Opens a capability on the target.
    ///
    /// Fails without touching the current state when already attached.
    /// `DUP_HANDLE` is always requested on top of `access` so the handle can
    /// be cloned later.
    pub fn attach(
        &mut self,
        target: impl Into<AttachTarget>,
        access: ProcessAccess,
    ) -> MemOpResult<Pid> {
        if let (true, Some(pid)) = (self.is_attached(), self.pid) {
            return Err(MemOpError::AlreadyAttached(pid));
        }

        let pid = match target.into() {
            AttachTarget::Pid(pid) => pid,
            AttachTarget::Name(name) => find_process_id(&self.api, &name)?,
        };

        let capability = self
            .api
            .open(pid, access | ProcessAccess::DUP_HANDLE)
            .with_context(|| format!("attach with access {:#x}", access.bits()))?;

        self.capability = Some(capability);
        self.pid = Some(pid);
        self.access = access;
        debug!("attached to process {pid} with access {:#x}", access.bits());

        Ok(pid)
    }

    /// Releases the capability. A no-op when nothing is held.
    pub fn detach(&mut self) {
        if let Some(capability) = self.capability.take() {
            drop(capability);
            debug!("detached from process {:?}", self.pid);
        }
        self.pid = None;
    }
}

impl<A: ProcessApi + Clone> ProcessHandle<A> {
    /// Duplicates the capability into an independent handle.
    pub fn try_clone(&self) -> MemOpResult<Self> {
        let capability = match self.capability() {
            Some(capability) => Some(self.api.duplicate(capability)?),
            None => None,
        };

        Ok(Self {
            api: self.api.clone(),
            pid: capability.as_ref().and(self.pid),
            access: self.access,
            capability,
        })
    }
}

impl<A: ProcessApi + Clone> Clone for ProcessHandle<A> {
    /// Falls back to an unattached handle when duplication fails.
    fn clone(&self) -> Self {
        self.try_clone().unwrap_or_else(|e| {
            warn!("duplicating handle for process {:?} failed: {e}", self.pid);
            Self::new(self.api.clone())
        })
    }
}

impl<A: ProcessApi> Drop for ProcessHandle<A> {
    fn drop(&mut self) {
        self.detach();
    }
}
