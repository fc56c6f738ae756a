#![forbid(unsafe_code)]

/// Incremental checksum over byte slices.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// CRC-32 (IEEE) backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a page body bound to its identity, so a page image written
/// to the wrong location never validates.
pub fn page_crc32(space: u32, page_no: u32, body: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&space.to_be_bytes());
    hasher.update(&page_no.to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}
