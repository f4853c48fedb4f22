use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Window used by the legacy (V3) digest recipe: only the first megabyte of
/// content participates in the hash.
pub const V3_DIGEST_WINDOW: usize = 1 << 20;

const V3_EDGE: usize = 128 * 1024;

/// A 16-byte content address computed as MD5 over the full uncompressed
/// contents of a blob. Also used as the identity of serialized attribute
/// containers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 16]);

impl Digest {
    /// Compute the content address of a complete buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        Digest(hasher.finalize().into())
    }

    /// Compute the legacy (V3) digest: MD5 seeded with the uncompressed
    /// length, then fed the buffered first-megabyte window — the whole
    /// window when the content fits in it, first and last 128 KiB of the
    /// window otherwise.
    ///
    /// `window` must hold `min(len, V3_DIGEST_WINDOW)` bytes of content.
    pub fn v3_of(len: u64, window: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(len.to_le_bytes());
        if len <= V3_DIGEST_WINDOW as u64 {
            hasher.update(window);
        } else {
            hasher.update(&window[..V3_EDGE]);
            hasher.update(&window[window.len() - V3_EDGE..]);
        }
        Digest(hasher.finalize().into())
    }

    /// Hex-encode the full digest, as used in `attrib_<hex>` file names and
    /// pool paths.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 32-char hex string back into a digest.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Digest(arr))
    }

    /// First byte as a two-char hex string, used for the top shard directory.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Second byte as a two-char hex string, used for the inner shard
    /// directory.
    pub fn shard_suffix(&self) -> String {
        hex::encode(&self.0[1..2])
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn of_deterministic() {
        let a = Digest::of(b"hello world");
        let b = Digest::of(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, Digest::of(b"hello worlds"));
    }

    #[test]
    fn hex_roundtrip() {
        let d = Digest::of(b"roundtrip");
        assert_eq!(d.to_hex().len(), 32);
        assert_eq!(Digest::from_hex(&d.to_hex()), Some(d));
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert_eq!(Digest::from_hex("xyz"), None);
        assert_eq!(Digest::from_hex("abcd"), None);
        assert_eq!(Digest::from_hex(""), None);
    }

    #[test]
    fn shard_prefixes_come_from_leading_bytes() {
        let d = Digest([0xAB; 16]);
        assert_eq!(d.shard_prefix(), "ab");
        assert_eq!(d.shard_suffix(), "ab");
    }

    #[test]
    fn v3_small_file_uses_whole_window() {
        let data = vec![0x42u8; 1000];
        let a = Digest::v3_of(1000, &data);
        let b = Digest::v3_of(1000, &data);
        assert_eq!(a, b);
        // Length participates in the hash.
        assert_ne!(a, Digest::v3_of(1001, &data));
    }

    #[test]
    fn v3_mid_sized_file_uses_whole_window() {
        // 512 KiB: larger than both edges combined, but the content still
        // fits in the window, so every byte participates.
        let len = 512 * 1024;
        let mut a = vec![0u8; len];
        let mut b = vec![0u8; len];
        a[len / 2] = 1;
        b[len / 2] = 2;
        assert_ne!(
            Digest::v3_of(len as u64, &a),
            Digest::v3_of(len as u64, &b),
        );
    }

    #[test]
    fn v3_large_window_ignores_middle() {
        let mut a = vec![0u8; V3_DIGEST_WINDOW];
        let mut b = vec![0u8; V3_DIGEST_WINDOW];
        a[V3_DIGEST_WINDOW / 2] = 1;
        b[V3_DIGEST_WINDOW / 2] = 2;
        assert_eq!(
            Digest::v3_of(1 << 21, &a),
            Digest::v3_of(1 << 21, &b),
        );
        // But the edges do matter.
        b[0] = 0xFF;
        assert_ne!(
            Digest::v3_of(1 << 21, &a),
            Digest::v3_of(1 << 21, &b),
        );
    }

    #[test]
    fn serde_roundtrip() {
        let d = Digest::of(b"serde");
        let bytes = rmp_serde::to_vec(&d).unwrap();
        let back: Digest = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(d, back);
    }
}
