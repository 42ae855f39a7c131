use crate::process::api::ProcessApi;
use crate::process::handle::ProcessHandle;
use crate::{with_handle, MemOpError, MemOpResult};

use super::transmute::{to_bytes, RemoteTyped};

/// Writes `bytes` at `addr`, failing unless every byte was transferred.
pub fn write_bytes<A: ProcessApi>(
    handle: &ProcessHandle<A>,
    addr: usize,
    bytes: &[u8],
) -> MemOpResult<()> {
    let bytes_written = with_handle!(handle, |cap| -> usize, {
        handle.api().write(cap, addr, bytes)
    })?;

    if bytes_written != bytes.len() {
        return Err(MemOpError::ShortTransfer((addr, bytes.len(), bytes_written)));
    }

    Ok(())
}

/// Writes the in-memory representation of `value` at `address`.
pub fn write_value<T: RemoteTyped>(
    handle: &ProcessHandle<impl ProcessApi>,
    address: usize,
    value: T,
) -> MemOpResult<()> {
    write_bytes(handle, address, to_bytes(&value))
}
