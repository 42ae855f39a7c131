use std::fmt;

use crate::process::api::Pid;

/// Which kind of OS snapshot failed to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Processes,
    Modules,
}

/// Represents errors that can occur during a given memory operation
#[derive(Debug)]
pub enum MemOpError {
    /// The handle holds no valid process capability
    NotAttached,
    /// A second attach was attempted while a capability is held
    AlreadyAttached(Pid),
    /// No running process reported the requested image name
    ProcessNotFound(String),
    /// The OS refused to hand out a capability for the process
    OpenFailed((Pid, Option<anyhow::Error>)),
    /// A process or module snapshot could not be opened
    SnapshotFailed((SnapshotKind, Option<anyhow::Error>)),
    /// No module with this (normalized) name is in the catalog
    ModuleNotFound(String),
    /// Scan request rejected before touching the target
    InvalidScan(String),
    PatternNotFound,
    /// Fewer bytes than requested were transferred: (address, expected, actual)
    ShortTransfer((usize, usize, usize)),
    /// A pointer chain step failed: (step index, address that could not be read)
    BrokenChain((usize, usize)),
    /// WinAPI errors
    #[cfg(windows)]
    WinAPI((windows_result::Error, Option<anyhow::Error>)),
    /// Generic error that wraps an anyhow::Error
    Other(anyhow::Error),
}

impl MemOpError {
    /// Creates a new `MemOpError::Other` from anything that implements `std::error::Error`
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        MemOpError::Other(anyhow::Error::new(error))
    }

    /// Returns true if the operation failed because no capability is held
    pub fn is_not_attached(&self) -> bool {
        matches!(self, MemOpError::NotAttached)
    }

    /// Returns true if fewer bytes than requested were transferred
    pub fn is_short_transfer(&self) -> bool {
        matches!(self, MemOpError::ShortTransfer(_))
    }

    /// Returns true for scan requests that were rejected or had no match
    pub fn is_scan_failure(&self) -> bool {
        matches!(
            self,
            MemOpError::InvalidScan(_) | MemOpError::PatternNotFound | MemOpError::ModuleNotFound(_)
        )
    }

    /// Converts this error to its underlying root cause string
    pub fn root_cause_string(&self) -> String {
        match self {
            MemOpError::NotAttached => "Not attached to a process".to_string(),
            MemOpError::AlreadyAttached(pid) => {
                format!("Already attached to process {pid}; detach first")
            }
            MemOpError::ProcessNotFound(name) => format!("No process named \"{name}\""),
            MemOpError::OpenFailed((pid, err)) => match err {
                Some(e) => format!("Opening process {pid} failed with: \"{e:#}\""),
                None => format!("Opening process {pid} failed"),
            },
            MemOpError::SnapshotFailed((kind, err)) => {
                let what = match kind {
                    SnapshotKind::Processes => "process",
                    SnapshotKind::Modules => "module",
                };
                match err {
                    Some(e) => format!("Opening {what} snapshot failed with: \"{e:#}\""),
                    None => format!("Opening {what} snapshot failed"),
                }
            }
            MemOpError::ModuleNotFound(name) => format!("No module named \"{name}\""),
            MemOpError::InvalidScan(reason) => format!("Scan rejected: {reason}"),
            MemOpError::PatternNotFound => "Pattern not found".to_string(),
            MemOpError::ShortTransfer((addr, expected, actual)) => format!(
                "Transferred {actual} of {expected} bytes at {addr:#x}"
            ),
            MemOpError::BrokenChain((depth, addr)) => {
                format!("Pointer chain broke at step {depth} reading {addr:#x}")
            }
            #[cfg(windows)]
            MemOpError::WinAPI((api_err, err)) => {
                let code = api_err.code().0;
                match err {
                    Some(e) => format!("Windows API call with context \"{e}\" failed with: \"Windows Error: {:08X} - {}\"", code, api_err),
                    None => format!("Windows API call failed with: \"Windows Error: {:08X} - {}\"", code, api_err)
                }
            }
            MemOpError::Other(err) => format!("{:#}", err),
        }
    }
}

impl fmt::Display for MemOpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemOpError: \"{}\"", &self.root_cause_string())
    }
}

impl std::error::Error for MemOpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemOpError::Other(err) => err.source(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for MemOpError {
    fn from(err: anyhow::Error) -> Self {
        MemOpError::Other(err)
    }
}

impl From<std::io::Error> for MemOpError {
    fn from(err: std::io::Error) -> Self {
        MemOpError::Other(anyhow::Error::new(err))
    }
}

#[cfg(windows)]
impl From<windows_result::Error> for MemOpError {
    fn from(err: windows_result::Error) -> Self {
        MemOpError::WinAPI((err, None))
    }
}

pub type MemOpResult<T> = Result<T, MemOpError>;

/// Tags a failed Windows call with what the crate was doing at the time.
#[cfg(windows)]
pub trait FromWindowsResult<T> {
    fn into_memop_result(self, context: Option<anyhow::Error>) -> MemOpResult<T>;
}

#[cfg(windows)]
impl<T> FromWindowsResult<T> for windows_result::Result<T> {
    fn into_memop_result(self, context: Option<anyhow::Error>) -> MemOpResult<T> {
        self.map_err(|e| MemOpError::WinAPI((e, context)))
    }
}

/// Extension trait to add anyhow-like methods to MemOpResult
pub trait MemOpResultExt<T> {
    /// Add context to an error
    fn context<C>(self, context: C) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static;

    /// Add context to an error with a lazy closure
    fn with_context<C, F>(self, f: F) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T> MemOpResultExt<T> for MemOpResult<T> {
    fn context<C>(self, context: C) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        self.with_context(|| context)
    }

    fn with_context<C, F>(self, f: F) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        // Typed variants are kept so callers can still match on them.
        self.map_err(|err| match err {
            MemOpError::Other(inner) => MemOpError::Other(inner.context(f())),
            MemOpError::OpenFailed((pid, ctx)) => MemOpError::OpenFailed((
                pid,
                Some(match ctx {
                    Some(e) => e.context(f()),
                    None => anyhow::anyhow!("{}", f()),
                }),
            )),
            other => other,
        })
    }
}

impl<T> MemOpResultExt<T> for Option<T> {
    fn context<C>(self, context: C) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        self.ok_or_else(|| MemOpError::Other(anyhow::anyhow!("{}", context)))
    }

    fn with_context<C, F>(self, f: F) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| MemOpError::Other(anyhow::anyhow!("{}", f())))
    }
}

// Allow macro-based error creation, similar to anyhow::anyhow!
#[macro_export]
macro_rules! memop_err {
    ($msg:literal $(,)?) => {
        $crate::MemOpError::Other(anyhow::anyhow!($msg))
    };
    ($err:expr $(,)?) => {
        $crate::MemOpError::Other(anyhow::anyhow!($err))
    };
    ($fmt:literal, $($arg:tt)*) => {
        $crate::MemOpError::Other(anyhow::anyhow!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_wraps_root_cause() {
        let err = MemOpError::ShortTransfer((0x1000, 4, 2));
        assert_eq!(
            err.to_string(),
            "MemOpError: \"Transferred 2 of 4 bytes at 0x1000\""
        );
    }

    #[test]
    fn test_context_keeps_typed_variants() {
        let res: MemOpResult<()> = Err(MemOpError::PatternNotFound);
        let res = res.context("scanning client.dll");
        assert!(matches!(res, Err(MemOpError::PatternNotFound)));
    }

    #[test]
    fn test_context_on_other_chains() {
        let res: MemOpResult<()> = Err(memop_err!("inner"));
        let err = res.context("outer").unwrap_err();
        let text = err.root_cause_string();
        assert!(text.contains("outer"));
        assert!(text.contains("inner"));
    }

    #[test]
    fn test_option_context() {
        let none: Option<u8> = None;
        let err = none.context("missing").unwrap_err();
        assert_eq!(err.root_cause_string(), "missing");
    }

    #[test]
    fn test_scan_failure_classification() {
        assert!(MemOpError::InvalidScan("empty mask".into()).is_scan_failure());
        assert!(MemOpError::PatternNotFound.is_scan_failure());
        assert!(!MemOpError::NotAttached.is_scan_failure());
        assert!(MemOpError::NotAttached.is_not_attached());
    }
}
