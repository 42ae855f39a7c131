pub mod error;
pub mod memory;
pub mod os;
pub mod process;

pub use error::{MemOpError, MemOpResult, MemOpResultExt};
pub use memory::RemoteTyped;
pub use process::api::{ModuleInfo, Pid, ProcessApi, ProcessEntry};
pub use process::handle::{AttachTarget, ProcessHandle};
pub use process::module::{ModuleCatalog, ModuleEntry};
pub use process::pattern::{SigMatch, Signature};
pub use process::{ProcessAccess, RemoteProcess};
