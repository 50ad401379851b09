//! # Arena Configuration
//!
//! The arena is sized once at startup. The size and the debug switches can
//! come from code or from a TOML file:
//!
//! ```toml
//! total_size = 268435456
//! verify_every_change = false
//! debug_fill = false
//! track_origins = true
//! ```

use crate::error::{MemoryError, MemoryResult};
use crate::header::{align_down, ALIGN, HEADER_SIZE, MIN_ALLOC_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Converts kibibytes to bytes.
#[inline]
#[must_use]
pub const fn kilobytes(k: usize) -> usize {
    k * 1024
}

/// Converts mebibytes to bytes.
#[inline]
#[must_use]
pub const fn megabytes(m: usize) -> usize {
    kilobytes(m) * 1024
}

/// Configuration for an [`Arena`](crate::Arena).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Size of the arena in bytes, headers included.
    ///
    /// Rounded down to a multiple of [`ALIGN`].
    pub total_size: usize,
    /// Run the full integrity check before and after every mutation.
    pub verify_every_change: bool,
    /// Paint allocated, released and split regions with marker bytes.
    pub debug_fill: bool,
    /// Remember the caller location of the last change to each block.
    pub track_origins: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            total_size: megabytes(64),
            verify_every_change: cfg!(debug_assertions),
            debug_fill: false,
            track_origins: true,
        }
    }
}

impl ArenaConfig {
    /// Smallest arena that can hold one header and one minimum block.
    pub const MIN_TOTAL_SIZE: usize = HEADER_SIZE + MIN_ALLOC_SIZE;

    /// Returns this configuration with a different arena size.
    #[must_use]
    pub fn with_total_size(mut self, total_size: usize) -> Self {
        self.total_size = total_size;
        self
    }

    /// Parses a configuration from TOML text and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] on malformed TOML and
    /// [`MemoryError::ArenaTooSmall`] if the size is unusable.
    pub fn from_toml_str(text: &str) -> MemoryResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| MemoryError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Same as [`ArenaConfig::from_toml_str`], plus an
    /// [`MemoryError::InvalidConfig`] if the file cannot be read.
    pub fn load(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MemoryError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Serializes the configuration back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] if serialization fails.
    pub fn to_toml_string(&self) -> MemoryResult<String> {
        toml::to_string(self).map_err(|e| MemoryError::InvalidConfig(e.to_string()))
    }

    /// Checks that the arena can hold at least one block.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ArenaTooSmall`] otherwise.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.aligned_total_size() < Self::MIN_TOTAL_SIZE {
            return Err(MemoryError::ArenaTooSmall {
                size: self.total_size,
                minimum: Self::MIN_TOTAL_SIZE,
            });
        }
        Ok(())
    }

    /// The usable arena size: `total_size` rounded down to [`ALIGN`].
    #[inline]
    #[must_use]
    pub const fn aligned_total_size(&self) -> usize {
        align_down(self.total_size)
    }

    /// Number of aligned chunks backing the arena.
    #[inline]
    #[must_use]
    pub(crate) const fn chunk_count(&self) -> usize {
        self.aligned_total_size() / ALIGN
    }
}
