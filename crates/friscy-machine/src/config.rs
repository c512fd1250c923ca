use friscy_hypercall::DispatcherConfig;

use crate::error::MachineError;

#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    /// Size of the flat guest memory arena in bytes. Must be a whole number of pages.
    pub arena_size: usize,
    /// Granularity of page permissions. Must be a power of two.
    pub page_size: u64,
    pub hypercalls: DispatcherConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            arena_size: 64 * 1024 * 1024,
            page_size: 4096,
            hypercalls: DispatcherConfig::default(),
        }
    }
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), MachineError> {
        if !self.page_size.is_power_of_two() {
            return Err(MachineError::InvalidConfig("page_size must be a power of two"));
        }
        if self.arena_size == 0 {
            return Err(MachineError::InvalidConfig("arena_size must be non-zero"));
        }
        if self.arena_size as u64 % self.page_size != 0 {
            return Err(MachineError::InvalidConfig(
                "arena_size must be a multiple of page_size",
            ));
        }
        Ok(())
    }
}
