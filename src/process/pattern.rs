use log::trace;

use crate::memory::read::read_bytes;
use crate::memory::RemoteTyped;
use crate::process::api::ProcessApi;
use crate::process::handle::ProcessHandle;
use crate::process::module::ModuleEntry;
use crate::{MemOpError, MemOpResult};

/// Mask character for a byte that must match; anything else is a wildcard.
pub const MATCH: u8 = b'x';

/// An owned pattern + mask pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub pattern: Vec<u8>,
    pub mask: String,
}

impl Signature {
    /// Parses an IDA-style pattern such as `"48 8B 05 ?? ?? ?? ?? C3"`.
    ///
    /// `?` and `??` are wildcards. Returns `None` for an empty pattern or a
    /// token that is not a hex byte.
    pub fn parse(ida: &str) -> Option<Self> {
        let mut pattern = Vec::new();
        let mut mask = String::new();

        for token in ida.split_whitespace() {
            match token {
                "?" | "??" => {
                    pattern.push(0);
                    mask.push('?');
                }
                hex if hex.len() == 2 => {
                    pattern.push(u8::from_str_radix(hex, 16).ok()?);
                    mask.push(MATCH as char);
                }
                _ => return None,
            }
        }

        if pattern.is_empty() {
            return None;
        }

        Some(Signature { pattern, mask })
    }
}

/// A successful scan: where the pattern starts and a copy of the bytes it
/// matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigMatch {
    /// Offset from the module base.
    pub offset: usize,
    pub module_base: usize,
    bytes: Vec<u8>,
}

impl SigMatch {
    /// Absolute address of the match in the target.
    pub fn address(&self) -> usize {
        self.module_base + self.offset
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decodes a `T` from the matched bytes at `index`, e.g. the rel32 of a
    /// `mov` the signature anchors on.
    pub fn read<T: RemoteTyped>(&self, index: usize) -> Option<T> {
        let end = index.checked_add(std::mem::size_of::<T>())?;
        let bytes = self.bytes.get(index..end)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }
}

/// First offset in `bytes[start..]` where every `'x'` position of `mask`
/// equals the pattern byte at the same position.
///
/// Candidates run up to, but not including, `bytes.len() - mask.len()`, so
/// a pattern that only fits the final window is never reported. `pattern`
/// must be at least as long as `mask`.
pub fn find_pattern_in_bytes(bytes: &[u8], pattern: &[u8], mask: &str, start: usize) -> Option<usize> {
    let mask = mask.as_bytes();
    let last = bytes.len().checked_sub(mask.len())?;

    (start..last).find(|&i| {
        mask.iter()
            .zip(pattern)
            .enumerate()
            .all(|(j, (&m, &p))| m != MATCH || bytes[i + j] == p)
    })
}

/// Copies `module`'s whole image out of the target and searches it.
///
/// Rejected up front, in order: an empty mask, `start_offset` at or past the
/// end of the image, a window that would run past the end, and a pattern
/// shorter than its mask.
pub fn scan_module<A: ProcessApi>(
    handle: &ProcessHandle<A>,
    module: &ModuleEntry,
    pattern: &[u8],
    mask: &str,
    start_offset: usize,
) -> MemOpResult<SigMatch> {
    let window = mask.len();

    if window == 0 {
        return Err(MemOpError::InvalidScan("empty mask".to_string()));
    }
    if start_offset >= module.size {
        return Err(MemOpError::InvalidScan(format!(
            "start offset {start_offset:#x} is outside \"{}\" ({:#x} bytes)",
            module.name, module.size
        )));
    }
    if module.size < window || start_offset > module.size - window {
        return Err(MemOpError::InvalidScan(format!(
            "{window}-byte mask starting at {start_offset:#x} runs past the end of \"{}\"",
            module.name
        )));
    }
    if pattern.len() < window {
        return Err(MemOpError::InvalidScan(format!(
            "pattern has {} bytes but the mask needs {window}",
            pattern.len()
        )));
    }

    trace!(
        "scanning \"{}\" [{:#x}, {:#x}) from offset {start_offset:#x} with mask \"{mask}\"",
        module.name,
        module.base,
        module.end()
    );

    let image = read_bytes(handle, module.base, module.size)?;
    let offset = find_pattern_in_bytes(&image, pattern, mask, start_offset)
        .ok_or(MemOpError::PatternNotFound)?;

    trace!("pattern matched \"{}\" at offset {offset:#x}", module.name);

    Ok(SigMatch {
        offset,
        module_base: module.base,
        bytes: image[offset..offset + window].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mock::MockApi;
    use crate::process::ProcessAccess;

    const BASE: usize = 0x40_0000;

    fn module(size: usize) -> ModuleEntry {
        ModuleEntry {
            name: "game.exe".into(),
            base: BASE,
            size,
        }
    }

    fn attached(image: Vec<u8>) -> (MockApi, ProcessHandle<MockApi>) {
        let api = MockApi::new();
        api.spawn(1, "game.exe");
        api.load_module(1, "game.exe", BASE, image);

        let mut handle = ProcessHandle::new(api.clone());
        handle.attach(1u32, ProcessAccess::READ_ONLY).unwrap();
        (api, handle)
    }

    #[test]
    fn test_wildcard_match() {
        let mut image = vec![0u8; 64];
        image[20..24].copy_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        let (_api, handle) = attached(image);

        let found = scan_module(&handle, &module(64), &[0x11, 0x22, 0x00, 0x44], "xx?x", 0).unwrap();
        assert_eq!(found.offset, 20);
        assert_eq!(found.len(), 4);
        assert_eq!(found.bytes(), &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(found.address(), BASE + 20);
    }

    #[test]
    fn test_empty_mask_always_fails() {
        let (_api, handle) = attached(vec![0u8; 16]);

        for start in [0, 1, 15, 16, 100] {
            let err = scan_module(&handle, &module(16), &[0x00], "", start).unwrap_err();
            assert!(matches!(err, MemOpError::InvalidScan(_)));
        }
    }

    #[test]
    fn test_start_offset_at_size_fails() {
        let (_api, handle) = attached(vec![0u8; 16]);

        let err = scan_module(&handle, &module(16), &[0x00], "x", 16).unwrap_err();
        assert!(matches!(err, MemOpError::InvalidScan(_)));
    }

    #[test]
    fn test_last_start_offset_is_accepted_but_never_matches() {
        let mut image = vec![0u8; 16];
        image[12..16].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let (_api, handle) = attached(image);
        let pattern = [0xDE, 0xAD, 0xBE, 0xEF];

        // 12 == size - mask length: past the up-front checks, but no candidate is left.
        let err = scan_module(&handle, &module(16), &pattern, "xxxx", 12).unwrap_err();
        assert!(matches!(err, MemOpError::PatternNotFound));

        let err = scan_module(&handle, &module(16), &pattern, "xxxx", 13).unwrap_err();
        assert!(matches!(err, MemOpError::InvalidScan(_)));
    }

    #[test]
    fn test_final_window_is_not_searched() {
        let mut image = vec![0u8; 16];
        image[12..16].copy_from_slice(&[1, 2, 3, 4]);
        let (_api, handle) = attached(image.clone());

        assert_eq!(find_pattern_in_bytes(&image, &[1, 2, 3, 4], "xxxx", 0), None);
        assert_eq!(find_pattern_in_bytes(&image, &[1, 2, 3, 4], "xxxx", 12), None);
        let err = scan_module(&handle, &module(16), &[1, 2, 3, 4], "xxxx", 0).unwrap_err();
        assert!(matches!(err, MemOpError::PatternNotFound));

        // One byte earlier it is found.
        image[11..15].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(find_pattern_in_bytes(&image, &[1, 2, 3, 4], "xxxx", 0), Some(11));
    }

    #[test]
    fn test_mask_longer_than_module() {
        let (_api, handle) = attached(vec![0u8; 2]);

        let err = scan_module(&handle, &module(2), &[0, 0, 0], "xxx", 0).unwrap_err();
        assert!(matches!(err, MemOpError::InvalidScan(_)));
    }

    #[test]
    fn test_pattern_shorter_than_mask() {
        let (_api, handle) = attached(vec![0u8; 16]);

        let err = scan_module(&handle, &module(16), &[0x00], "xx", 0).unwrap_err();
        assert!(matches!(err, MemOpError::InvalidScan(_)));
    }

    #[test]
    fn test_start_offset_skips_earlier_match() {
        let mut image = vec![0u8; 32];
        image[4] = 0xAA;
        image[20] = 0xAA;
        let (_api, handle) = attached(image);

        let first = scan_module(&handle, &module(32), &[0xAA], "x", 0).unwrap();
        let second = scan_module(&handle, &module(32), &[0xAA], "x", first.offset + 1).unwrap();
        assert_eq!(first.offset, 4);
        assert_eq!(second.offset, 20);
    }

    #[test]
    fn test_no_match() {
        let (_api, handle) = attached(vec![0u8; 32]);

        let err = scan_module(&handle, &module(32), &[0xFF, 0xFF], "xx", 0).unwrap_err();
        assert!(matches!(err, MemOpError::PatternNotFound));
    }

    #[test]
    fn test_short_image_read_fails() {
        let (api, handle) = attached(vec![0x90u8; 64]);
        api.limit_transfers(Some(32));

        let err = scan_module(&handle, &module(64), &[0x90], "x", 0).unwrap_err();
        assert!(err.is_short_transfer());
    }

    #[test]
    fn test_unattached_scan_fails() {
        let (api, _) = attached(vec![0u8; 8]);
        let handle = ProcessHandle::new(api);

        let err = scan_module(&handle, &module(8), &[0x00], "x", 0).unwrap_err();
        assert!(err.is_not_attached());
    }

    #[test]
    fn test_find_pattern_in_bytes_wildcards_only() {
        let bytes = [1u8, 2, 3];
        assert_eq!(find_pattern_in_bytes(&bytes, &[0, 0], "??", 0), Some(0));
        assert_eq!(find_pattern_in_bytes(&bytes, &[0, 0], "??", 1), None);
        assert_eq!(find_pattern_in_bytes(&[1u8, 2, 3, 4], &[0, 0], "??", 1), Some(1));
    }

    #[test]
    fn test_signature_parse() {
        let sig = Signature::parse("48 8B 05 ?? ? C3").unwrap();
        assert_eq!(sig.pattern, vec![0x48, 0x8B, 0x05, 0x00, 0x00, 0xC3]);
        assert_eq!(sig.mask, "xxx??x");

        assert!(Signature::parse("").is_none());
        assert!(Signature::parse("48 GG").is_none());
        assert!(Signature::parse("488B").is_none());
    }

    #[test]
    fn test_parsed_signature_scans() {
        let mut image = vec![0u8; 48];
        image[8..14].copy_from_slice(&[0x48, 0x8B, 0x05, 0x10, 0x20, 0xC3]);
        let (_api, handle) = attached(image);
        let sig = Signature::parse("48 8B 05 ?? ?? C3").unwrap();

        let found = scan_module(&handle, &module(48), &sig.pattern, &sig.mask, 0).unwrap();
        assert_eq!(found.offset, 8);
        assert_eq!(found.read::<u16>(3), Some(0x2010));
        assert_eq!(found.read::<u8>(5), Some(0xC3));
        assert_eq!(found.read::<u16>(5), None);
    }

    #[test]
    fn test_match_copies_are_independent() {
        let mut image = vec![0u8; 8];
        image[0] = 0x55;
        let (_api, handle) = attached(image);

        let found = scan_module(&handle, &module(8), &[0x55], "x", 0).unwrap();
        let copy = found.clone();
        drop(found);
        assert_eq!(copy.bytes(), &[0x55]);
    }
}
