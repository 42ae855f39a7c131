use std::any::type_name;

use log::trace;

use crate::memory::offset_address;
use crate::process::api::ProcessApi;
use crate::process::handle::ProcessHandle;
use crate::{with_handle, MemOpError, MemOpResult};

use super::transmute::RemoteTyped;

/// Fills `buf` from `addr`, failing unless every byte was transferred.
pub fn read_exact<A: ProcessApi>(
    handle: &ProcessHandle<A>,
    addr: usize,
    buf: &mut [u8],
) -> MemOpResult<()> {
    let bytes_read = with_handle!(handle, |cap| -> usize, {
        handle.api().read(cap, addr, buf)
    })?;

    if bytes_read != buf.len() {
        return Err(MemOpError::ShortTransfer((addr, buf.len(), bytes_read)));
    }

    Ok(())
}

/// Copies `size` bytes from `addr` in one transfer.
pub fn read_bytes<A: ProcessApi>(
    handle: &ProcessHandle<A>,
    addr: usize,
    size: usize,
) -> MemOpResult<Vec<u8>> {
    let mut buffer = vec![0u8; size];
    read_exact(handle, addr, &mut buffer)?;

    Ok(buffer)
}

/// Reads a `T` at `address`.
pub fn read_value<T: RemoteTyped>(handle: &ProcessHandle<impl ProcessApi>, address: usize) -> MemOpResult<T> {
    let mut value = T::zeroed();
    read_exact(handle, address, bytemuck::bytes_of_mut(&mut value))?;

    Ok(value)
}

/// Lenient read: `T`'s zero value when unattached or on a failed or short read.
pub fn read_or_default<T: RemoteTyped>(handle: &ProcessHandle<impl ProcessApi>, address: usize) -> T {
    read_value(handle, address).unwrap_or_else(|e| {
        trace!("read of {} at {address:#x} defaulted: {e}", type_name::<T>());
        T::zeroed()
    })
}

/// Stores the `T` at `address` into `value`; `value` is untouched on failure.
pub fn read_into<T: RemoteTyped>(
    handle: &ProcessHandle<impl ProcessApi>,
    address: usize,
    value: &mut T,
) -> MemOpResult<()> {
    *value = read_value(handle, address)?;
    Ok(())
}

/// Follows `offsets` from `address` and reads a `T` at the end.
///
/// Every offset but the last is added to the current address and a pointer
/// is loaded from there; the last offset locates the value itself. A
/// failed step yields a null pointer and the walk carries on from it, so a
/// broken chain ends in a read near address 0 and, usually, the zero
/// value. An empty chain or an unattached handle gives the zero value.
pub fn read_pointer_chain<T: RemoteTyped>(
    handle: &ProcessHandle<impl ProcessApi>,
    address: usize,
    offsets: &[usize],
) -> T {
    let Some((last, steps)) = offsets.split_last() else {
        return T::zeroed();
    };
    if !handle.is_attached() {
        return T::zeroed();
    }

    let address = steps.iter().fold(address, |current, &offset| {
        read_or_default::<usize>(handle, offset_address(current, offset))
    });

    read_or_default(handle, offset_address(address, *last))
}

/// Like `read_pointer_chain`, but stops at the first failed step.
///
/// The error is `BrokenChain((step, address))` naming the step that failed
/// and the address it tried to read. An empty chain is `Ok` with the zero
/// value.
pub fn try_read_pointer_chain<T: RemoteTyped>(
    handle: &ProcessHandle<impl ProcessApi>,
    address: usize,
    offsets: &[usize],
) -> MemOpResult<T> {
    let Some((last, steps)) = offsets.split_last() else {
        return Ok(T::zeroed());
    };
    if !handle.is_attached() {
        return Err(MemOpError::NotAttached);
    }

    let mut current = address;
    for (depth, &offset) in steps.iter().enumerate() {
        let target = offset_address(current, offset);
        current = read_value::<usize>(handle, target)
            .map_err(|_| MemOpError::BrokenChain((depth, target)))?;
    }

    let target = offset_address(current, *last);
    read_value(handle, target).map_err(|_| MemOpError::BrokenChain((steps.len(), target)))
}
