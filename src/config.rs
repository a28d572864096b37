use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::persistence::RECOVERY_FILE_NAME;

/// Entry buffer configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Size estimate above which a flush is triggered; 0 disables buffering
    pub capacity_bytes: usize,
    /// Where undelivered entries are written at shutdown
    pub recovery_path: PathBuf,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            // 32MB
            capacity_bytes: 32 * 1024 * 1024,
            recovery_path: PathBuf::from(RECOVERY_FILE_NAME),
        }
    }
}

/// Capacity presets for different crawl sizes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushProfile {
    Small,
    Balanced,
    Large,
    Disabled,
}

impl FlushProfile {
    /// Get the flush threshold for this profile
    pub fn capacity_bytes(&self) -> usize {
        match self {
            FlushProfile::Small => 4 * 1024 * 1024,
            FlushProfile::Balanced => 32 * 1024 * 1024,
            FlushProfile::Large => 128 * 1024 * 1024,
            FlushProfile::Disabled => 0,
        }
    }

    /// Apply this profile to a BufferConfig
    pub fn apply_to(&self, config: &mut BufferConfig) {
        config.capacity_bytes = self.capacity_bytes();
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "small" => Some(FlushProfile::Small),
            "balanced" => Some(FlushProfile::Balanced),
            "large" => Some(FlushProfile::Large),
            "disabled" | "off" => Some(FlushProfile::Disabled),
            _ => None,
        }
    }
}

impl BufferConfig {
    /// Create a configuration with the given flush threshold
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            ..Default::default()
        }
    }

    /// A configuration that never flushes automatically
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn with_profile(mut self, profile: FlushProfile) -> Self {
        profile.apply_to(&mut self);
        self
    }

    pub fn with_capacity(mut self, capacity_bytes: usize) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    pub fn with_recovery_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.recovery_path = path.into();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity_bytes != 0
    }
}
