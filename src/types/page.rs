//! On-disk page layout shared with whatever validates pages on read-in.
//!
//! Every page starts with a fixed header and ends with an eight byte
//! trailer. The header carries the checksum, identity, sibling links and
//! the page LSN; the trailer repeats the checksum and the low 32 bits of
//! the LSN so a torn write is detectable. All integers are big-endian.

use core::ops::Range;

use super::{checksum::page_crc32, Lsn, PageKey};

/// Smallest supported uncompressed page.
pub const MIN_PAGE_SIZE: usize = 4096;
/// Largest supported uncompressed page.
pub const MAX_PAGE_SIZE: usize = 65536;
/// Smallest compressed page.
pub const MIN_ZIP_SIZE: usize = 1024;
/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 16384;
/// Length of the fixed header.
pub const PAGE_HDR_LEN: usize = 38;
/// Length of the trailer.
pub const PAGE_TRAILER_LEN: usize = 8;
/// Stored in place of a checksum when checksums are disabled.
pub const NO_CHECKSUM_MAGIC: u32 = 0xDEAD_BEEF;
/// Sibling link value meaning "no page".
pub const FIL_NULL: u32 = u32::MAX;

/// Byte offsets for fixed header fields.
pub mod header {
    use core::ops::Range;

    /// Page checksum.
    pub const CHECKSUM: Range<usize> = 0..4;
    /// Page number the image belongs to.
    pub const PAGE_NO: Range<usize> = 4..8;
    /// Previous sibling at the same index level.
    pub const PREV: Range<usize> = 8..12;
    /// Next sibling at the same index level.
    pub const NEXT: Range<usize> = 12..16;
    /// LSN of the newest modification written with this image.
    pub const LSN: Range<usize> = 16..24;
    /// Page kind tag.
    pub const KIND: Range<usize> = 24..26;
    /// Base-two log of the block size the image was written at.
    pub const BLOCK_SHIFT: usize = 26;
    /// Tablespace the image belongs to.
    pub const SPACE_ID: Range<usize> = 34..38;
}

/// Range of the trailer checksum copy for a page of `page_size` bytes.
pub const fn trailer_checksum(page_size: usize) -> Range<usize> {
    page_size - PAGE_TRAILER_LEN..page_size - 4
}

/// Range of the trailer LSN tail for a page of `page_size` bytes.
pub const fn trailer_lsn_tail(page_size: usize) -> Range<usize> {
    page_size - 4..page_size
}

/// Kind tag stored in the page header.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Freshly allocated, no content yet.
    Allocated = 0,
    /// Index (B-tree) page.
    Index = 1,
    /// Tablespace header.
    SpaceHeader = 2,
    /// Change-buffer bitmap.
    ChangeBitmap = 3,
    /// Undo log page.
    Undo = 4,
    /// Externally stored column data.
    Blob = 5,
}

/// Outcome of validating a page image read from disk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageCheck {
    /// Image is consistent.
    Valid,
    /// Image is all zeroes: never written.
    Fresh,
    /// Image failed validation.
    Corrupt(&'static str),
}

/// Pages the read engine must treat as low-level metadata: the tablespace
/// header and the change-buffer bitmap page that opens each descriptor
/// interval. `interval` is the number of pages one bitmap page describes.
pub fn is_metadata_page(page_no: u32, interval: u32) -> bool {
    page_no == 0 || (interval > 1 && page_no % interval == 1)
}

fn read_u32(buf: &[u8], range: Range<usize>) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[range]);
    u32::from_be_bytes(raw)
}

fn write_u32(buf: &mut [u8], range: Range<usize>, value: u32) {
    buf[range].copy_from_slice(&value.to_be_bytes());
}

/// Page number recorded in the header.
pub fn page_no(buf: &[u8]) -> u32 {
    read_u32(buf, header::PAGE_NO)
}

/// Tablespace id recorded in the header.
pub fn space_id(buf: &[u8]) -> u32 {
    read_u32(buf, header::SPACE_ID)
}

/// Previous sibling link, if any.
pub fn prev_page(buf: &[u8]) -> Option<u32> {
    match read_u32(buf, header::PREV) {
        FIL_NULL => None,
        n => Some(n),
    }
}

/// Next sibling link, if any.
pub fn next_page(buf: &[u8]) -> Option<u32> {
    match read_u32(buf, header::NEXT) {
        FIL_NULL => None,
        n => Some(n),
    }
}

/// LSN stamped in the header.
pub fn page_lsn(buf: &[u8]) -> Lsn {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[header::LSN]);
    Lsn(u64::from_be_bytes(raw))
}

/// Block size recorded by the last write-back, if it is a plausible one.
pub fn block_len(buf: &[u8]) -> Option<usize> {
    let shift = u32::from(*buf.get(header::BLOCK_SHIFT)?);
    let len = 1usize.checked_shl(shift)?;
    (MIN_ZIP_SIZE..=MAX_PAGE_SIZE).contains(&len).then_some(len)
}

/// Stored header checksum.
pub fn stored_checksum(buf: &[u8]) -> u32 {
    read_u32(buf, header::CHECKSUM)
}

/// Zeroes `buf` and writes a fresh header for `key`.
pub fn init_page(buf: &mut [u8], key: PageKey, kind: PageKind) {
    buf.fill(0);
    write_u32(buf, header::PAGE_NO, key.page_no.0);
    write_u32(buf, header::SPACE_ID, key.space.0);
    write_u32(buf, header::PREV, FIL_NULL);
    write_u32(buf, header::NEXT, FIL_NULL);
    buf[header::KIND].copy_from_slice(&(kind as u16).to_be_bytes());
}

/// Writes the sibling links used by linear read-ahead.
pub fn set_siblings(buf: &mut [u8], prev: Option<u32>, next: Option<u32>) {
    write_u32(buf, header::PREV, prev.unwrap_or(FIL_NULL));
    write_u32(buf, header::NEXT, next.unwrap_or(FIL_NULL));
}

/// Checksum of the page body: everything between the header checksum and
/// the trailer.
pub fn compute_checksum(buf: &[u8], key: PageKey) -> u32 {
    let len = buf.len();
    page_crc32(key.space.0, key.page_no.0, &buf[header::CHECKSUM.end..len - PAGE_TRAILER_LEN])
}

/// Stamps `lsn` into header and trailer and recomputes the checksum.
///
/// Called on every write-back, so the image always matches its newest
/// modification.
pub fn stamp_for_write(buf: &mut [u8], key: PageKey, lsn: Lsn, checksums: bool) {
    let len = buf.len();
    buf[header::BLOCK_SHIFT] = len.trailing_zeros() as u8;
    buf[header::LSN].copy_from_slice(&lsn.0.to_be_bytes());
    write_u32(buf, trailer_lsn_tail(len), lsn.0 as u32);
    let checksum = if checksums {
        compute_checksum(buf, key)
    } else {
        NO_CHECKSUM_MAGIC
    };
    write_u32(buf, header::CHECKSUM, checksum);
    write_u32(buf, trailer_checksum(len), checksum);
}

/// Validates an image against the identity it is expected to carry.
pub fn verify(buf: &[u8], key: PageKey) -> PageCheck {
    let len = buf.len();
    if len < PAGE_HDR_LEN + PAGE_TRAILER_LEN {
        return PageCheck::Corrupt("page shorter than header and trailer");
    }
    if buf.iter().all(|&b| b == 0) {
        return PageCheck::Fresh;
    }
    let lsn = page_lsn(buf);
    if read_u32(buf, trailer_lsn_tail(len)) != lsn.0 as u32 {
        return PageCheck::Corrupt("lsn tail mismatch");
    }
    let stored = stored_checksum(buf);
    if read_u32(buf, trailer_checksum(len)) != stored {
        return PageCheck::Corrupt("trailer checksum mismatch");
    }
    if stored != NO_CHECKSUM_MAGIC && stored != compute_checksum(buf, key) {
        return PageCheck::Corrupt("page checksum mismatch");
    }
    if page_no(buf) != key.page_no.0 || space_id(buf) != key.space.0 {
        return PageCheck::Corrupt("page identity mismatch");
    }
    PageCheck::Valid
}
