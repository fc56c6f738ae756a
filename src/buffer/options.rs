use serde::{Deserialize, Serialize};

use crate::types::{page, BufferError, Result};

/// What to do when a page image fails validation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionPolicy {
    /// Refuse to serve or persist a corrupt image. Write-path corruption
    /// aborts the process.
    #[default]
    Abort,
    /// Flag the page as corrupt, log, and carry on.
    Tolerate,
}

impl CorruptionPolicy {
    /// Returns the string representation used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            CorruptionPolicy::Abort => "abort",
            CorruptionPolicy::Tolerate => "tolerate",
        }
    }
}

/// Configuration options for the buffer pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolOptions {
    /// Size of each uncompressed page in bytes.
    pub page_size: usize,
    /// Number of independently locked pool instances.
    pub instances: usize,
    /// Frames owned by each instance.
    pub pages_per_instance: usize,
    /// Pages per read-ahead area; a power of two.
    pub read_ahead_area: u32,
    /// Whether random read-ahead runs on a cache miss.
    pub random_read_ahead: bool,
    /// Linear read-ahead tolerates `64 - factor` out-of-order pages.
    pub linear_read_ahead_factor: u32,
    /// Whether flushing a page also flushes dirty pages around it.
    pub flush_neighbors: bool,
    /// Stage writes through the double-write buffer.
    pub doublewrite: bool,
    /// Pages per double-write block; the buffer holds two blocks.
    pub doublewrite_pages: u32,
    /// Tablespace holding the double-write blocks.
    pub doublewrite_space: u32,
    /// First page of the first double-write block.
    pub doublewrite_block1: u32,
    /// Reaction to corrupt page images.
    pub corruption_policy: CorruptionPolicy,
    /// Compute page checksums on write-back.
    pub checksums: bool,
    /// Share of the LRU list kept in the old sublist, in percent.
    pub lru_old_pct: u32,
    /// Below this LRU length no old sublist is maintained and neighbor
    /// flushing is skipped.
    pub lru_old_min_len: usize,
    /// An old page is promoted only if accessed again this long after its
    /// first access.
    pub lru_old_threshold_ms: u64,
    /// How many LRU tail entries a victim search inspects.
    pub lru_scan_depth: usize,
    /// Upper bound of each throttling wait in bulk reads.
    pub bulk_read_wait_ms: u64,
    /// Free frames recovery may use; recovery reads throttle at half.
    pub recovery_free_frames: usize,
    /// Sampling intervals kept by the flush-rate controller.
    pub flush_rate_window: usize,
}

impl Default for BufferPoolOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            instances: 1,
            pages_per_instance: 1024,
            read_ahead_area: 64,
            random_read_ahead: false,
            linear_read_ahead_factor: 56,
            flush_neighbors: true,
            doublewrite: true,
            doublewrite_pages: 64,
            doublewrite_space: 0,
            doublewrite_block1: 64,
            corruption_policy: CorruptionPolicy::Abort,
            checksums: true,
            lru_old_pct: 37,
            lru_old_min_len: 64,
            lru_old_threshold_ms: 1000,
            lru_scan_depth: 100,
            bulk_read_wait_ms: 500,
            recovery_free_frames: 256,
            flush_rate_window: 20,
        }
    }
}

impl BufferPoolOptions {
    /// Rejects combinations the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < page::MIN_PAGE_SIZE
            || self.page_size > page::MAX_PAGE_SIZE
        {
            return Err(BufferError::Invalid(
                "page_size must be a power of two between 4096 and 65536",
            ));
        }
        if self.instances == 0 || self.pages_per_instance == 0 {
            return Err(BufferError::Invalid("pool must own at least one frame"));
        }
        if !self.read_ahead_area.is_power_of_two() || self.read_ahead_area > 256 {
            return Err(BufferError::Invalid(
                "read_ahead_area must be a power of two no larger than 256",
            ));
        }
        if self.linear_read_ahead_factor > 64 {
            return Err(BufferError::Invalid("linear_read_ahead_factor exceeds 64"));
        }
        if self.lru_old_pct == 0 || self.lru_old_pct >= 100 {
            return Err(BufferError::Invalid("lru_old_pct must be within 1..100"));
        }
        if self.doublewrite && self.doublewrite_pages == 0 {
            return Err(BufferError::Invalid("doublewrite_pages must be positive"));
        }
        if self.flush_rate_window == 0 {
            return Err(BufferError::Invalid("flush_rate_window must be positive"));
        }
        Ok(())
    }

    /// Total frames across instances.
    pub fn capacity(&self) -> usize {
        self.instances * self.pages_per_instance
    }

    /// Pages covered by one change-buffer bitmap page for the given
    /// compressed size (0 for uncompressed).
    pub fn bitmap_interval(&self, zip_size: u32) -> u32 {
        if zip_size > 0 {
            zip_size
        } else {
            self.page_size as u32
        }
    }

    /// Rejects a compressed size that is neither 0 nor a power of two
    /// between the smallest compressed page and `page_size`.
    pub fn check_zip_size(&self, zip_size: u32) -> Result<()> {
        let size = zip_size as usize;
        if zip_size != 0
            && (!zip_size.is_power_of_two() || size < page::MIN_ZIP_SIZE || size > self.page_size)
        {
            return Err(BufferError::Invalid(
                "zip_size must be 0 or a power of two between 1024 and page_size",
            ));
        }
        Ok(())
    }

    /// Block size of a page with the given compressed size.
    pub fn block_size(&self, zip_size: u32) -> usize {
        if zip_size > 0 {
            zip_size as usize
        } else {
            self.page_size
        }
    }
}
