//! Log configuration.

/// Configuration for the log's segments.
///
/// The defaults are deliberately tiny (1 KiB) so tests exercise rotation;
/// production deployments set both limits orders of magnitude higher.
#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    /// Rotation threshold on the store file size in bytes.
    pub max_store_bytes: u64,
    /// Size the index file is pre-allocated to; also the rotation
    /// threshold once no further entry fits.
    pub max_index_bytes: u64,
    /// Base offset of the first segment when the directory is empty.
    pub initial_offset: u64,
}

impl LogConfig {
    /// Creates a configuration with the default thresholds.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }

    /// Sets the store rotation threshold.
    #[must_use]
    pub const fn with_max_store_bytes(mut self, bytes: u64) -> Self {
        self.max_store_bytes = bytes;
        self
    }

    /// Sets the index pre-allocation size.
    #[must_use]
    pub const fn with_max_index_bytes(mut self, bytes: u64) -> Self {
        self.max_index_bytes = bytes;
        self
    }

    /// Sets the first segment's base offset for empty directories.
    #[must_use]
    pub const fn with_initial_offset(mut self, offset: u64) -> Self {
        self.initial_offset = offset;
        self
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}
