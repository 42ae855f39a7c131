pub mod read;
pub mod transmute;
pub mod write;

pub use transmute::RemoteTyped;

/// Adds a chain offset to an address the way the target's own pointer
/// arithmetic would, wrapping on overflow.
pub(crate) fn offset_address(address: usize, offset: usize) -> usize {
    address.wrapping_add(offset)
}
