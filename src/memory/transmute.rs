/// Types that can be copied in and out of another process byte for byte.
///
/// # Info
/// This is bytemuck's `Pod` under another name: fixed size, no padding, no
/// pointers the target could not make sense of, and every bit pattern
/// valid. Anything owning heap memory (`String`, `Vec`, `Box`) is rejected
/// at compile time.
///
/// Implement `Pod` for your own `#[repr(C)]` structs with
/// `#[derive(Pod, Zeroable, Clone, Copy)]` and they become `RemoteTyped`.
pub trait RemoteTyped: bytemuck::Pod {}

impl<T: bytemuck::Pod> RemoteTyped for T {}

/// Reinterprets `bytes` as a `T`. `None` unless exactly `size_of::<T>()`
/// bytes are given.
pub fn from_bytes<T: RemoteTyped>(bytes: &[u8]) -> Option<T> {
    bytemuck::try_pod_read_unaligned::<T>(bytes).ok()
}

/// The in-memory representation of `value`.
pub fn to_bytes<T: RemoteTyped>(value: &T) -> &[u8] {
    bytemuck::bytes_of::<T>(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    struct Vec3 {
        x: f32,
        y: f32,
        z: f32,
    }

    #[test]
    fn test_struct_bytes() {
        let v = Vec3 { x: 1.0, y: -2.0, z: 0.5 };
        let bytes = to_bytes(&v).to_vec();
        assert_eq!(bytes.len(), 12);
        assert_eq!(from_bytes::<Vec3>(&bytes), Some(v));
    }

    #[test]
    fn test_wrong_length() {
        assert_eq!(from_bytes::<u32>(&[1, 2, 3]), None);
        assert_eq!(from_bytes::<u32>(&[1, 0, 0, 0]), Some(u32::from_ne_bytes([1, 0, 0, 0])));
    }
}
