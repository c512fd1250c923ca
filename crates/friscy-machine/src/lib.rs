//! Reference embedding of the checkpoint and hypercall layers: a RISC-V machine over one flat
//! memory arena.
//!
//! The instruction interpreter lives elsewhere; it drives a [`Machine`] by fetching through
//! [`Memory::fetch`] and handing every `ecall` to [`Machine::ecall`]. When that reports
//! [`Ecall::Suspended`] the interpreter must not step the machine again until
//! [`Machine::resume`] has completed.

mod config;
mod error;
mod machine;
mod memory;

pub use crate::config::MachineConfig;
pub use crate::error::{MachineError, Result};
pub use crate::machine::{Ecall, Machine, REG_A0, REG_A7};
pub use crate::memory::{DecoderCache, Memory, PageAttributes};
