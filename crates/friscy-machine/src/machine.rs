use friscy_checkpoint::{
    CheckpointSource, CheckpointTarget, CpuState, EmulatedKernelState, ExecContext, ExecPageSet,
    LoadStats, MemoryManagementState, SaveOptions,
};
use friscy_hypercall::{Dispatch, Dispatcher, Guest, HostBridge};
use tracing::{debug, info};

use crate::config::MachineConfig;
use crate::error::Result;
use crate::memory::{Memory, PageAttributes};

/// `a0`: first argument and result register.
pub const REG_A0: usize = 10;
/// `a7`: syscall / hypercall number.
pub const REG_A7: usize = 17;

/// `a0..a7`.
const ARG_REGS: usize = 8;
const ECALL_LEN: u64 = 4;

/// What the execution core should do after an `ecall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ecall {
    /// Not a hypercall; the native syscall emulation owns it. The program counter is unchanged.
    Native(u64),
    /// Handled; `a0` holds the result and the program counter is past the `ecall`.
    Completed(i64),
    /// Parked until [`Machine::resume`] finishes. The program counter stays on the `ecall`.
    Suspended,
}

/// The hypercall-visible slice of a machine, borrowed apart from its dispatcher.
struct GuestView<'a> {
    cpu: &'a mut CpuState,
    memory: &'a mut Memory,
    kernel: &'a mut EmulatedKernelState,
}

impl Guest for GuestView<'_> {
    fn sysarg(&self, index: usize) -> u64 {
        if index < ARG_REGS {
            self.cpu.x[REG_A0 + index]
        } else {
            0
        }
    }

    fn set_result(&mut self, value: i64) {
        self.cpu.x[REG_A0] = value as u64;
    }

    fn memory(&self) -> &[u8] {
        self.memory.arena()
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.arena_mut()
    }

    fn kernel_mut(&mut self) -> &mut EmulatedKernelState {
        self.kernel
    }
}

pub struct Machine {
    config: MachineConfig,
    cpu: CpuState,
    mm: MemoryManagementState,
    exec: ExecContext,
    kernel: EmulatedKernelState,
    memory: Memory,
    hypercalls: Dispatcher,
    resumed: bool,
}

impl Machine {
    pub fn new(config: MachineConfig, host: HostBridge) -> Result<Self> {
        let hypercalls = Dispatcher::with_default_handlers(host, config.hypercalls);
        Self::with_dispatcher(config, hypercalls)
    }

    pub fn with_dispatcher(config: MachineConfig, hypercalls: Dispatcher) -> Result<Self> {
        config.validate()?;
        let memory = Memory::new(config.arena_size, config.page_size)?;
        debug!(
            arena_size = config.arena_size,
            page_size = config.page_size,
            "machine created"
        );
        Ok(Self {
            config,
            cpu: CpuState::default(),
            mm: MemoryManagementState::default(),
            exec: ExecContext::default(),
            kernel: EmulatedKernelState::default(),
            memory,
            hypercalls,
            resumed: false,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn kernel(&self) -> &EmulatedKernelState {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut EmulatedKernelState {
        &mut self.kernel
    }

    pub fn memory_state(&self) -> MemoryManagementState {
        self.mm
    }

    pub fn set_memory_state(&mut self, mm: MemoryManagementState) {
        self.mm = mm;
    }

    pub fn exec_context(&self) -> ExecContext {
        self.exec
    }

    pub fn set_exec_context(&mut self, exec: ExecContext) {
        self.exec = exec;
    }

    pub fn hypercalls(&self) -> &Dispatcher {
        &self.hypercalls
    }

    pub fn hypercalls_mut(&mut self) -> &mut Dispatcher {
        &mut self.hypercalls
    }

    pub fn is_suspended(&self) -> bool {
        self.hypercalls.is_suspended()
    }

    /// Returns `true` once after the machine was restored from a checkpoint.
    pub fn take_resumed(&mut self) -> bool {
        std::mem::take(&mut self.resumed)
    }

    /// Handle an `ecall` at the current program counter.
    pub fn ecall(&mut self) -> Result<Ecall> {
        let number = self.cpu.x[REG_A7];
        let mut guest = GuestView {
            cpu: &mut self.cpu,
            memory: &mut self.memory,
            kernel: &mut self.kernel,
        };
        match self.hypercalls.dispatch(number, &mut guest)? {
            Dispatch::NotHypercall => Ok(Ecall::Native(number)),
            Dispatch::Completed(result) => {
                self.cpu.pc = self.cpu.pc.wrapping_add(ECALL_LEN);
                Ok(Ecall::Completed(result))
            }
            Dispatch::Suspended => Ok(Ecall::Suspended),
        }
    }

    /// Wait for the suspended hypercall, write its result and step past the `ecall`.
    pub async fn resume(&mut self) -> Result<i64> {
        let mut guest = GuestView {
            cpu: &mut self.cpu,
            memory: &mut self.memory,
            kernel: &mut self.kernel,
        };
        let result = self.hypercalls.resume(&mut guest).await?;
        self.cpu.pc = self.cpu.pc.wrapping_add(ECALL_LEN);
        Ok(result)
    }

    pub fn save_checkpoint(&self, options: SaveOptions) -> Result<Vec<u8>> {
        Ok(friscy_checkpoint::save_checkpoint_to_vec(self, options)?)
    }

    pub fn load_checkpoint(&mut self, blob: &[u8]) -> Result<LoadStats> {
        let stats = friscy_checkpoint::load_checkpoint(blob, self)?;
        info!(
            pc = format_args!("{:#x}", self.cpu.pc),
            exec_base = format_args!("{:#x}", self.exec.exec_base),
            "machine resumed from checkpoint"
        );
        Ok(stats)
    }
}

impl CheckpointSource for Machine {
    fn cpu_state(&self) -> CpuState {
        self.cpu
    }

    fn memory_state(&self) -> MemoryManagementState {
        self.mm
    }

    fn exec_context(&self) -> ExecContext {
        self.exec
    }

    fn kernel_state(&self) -> &EmulatedKernelState {
        &self.kernel
    }

    fn exec_pages(&self) -> ExecPageSet {
        self.memory.exec_pages()
    }

    fn arena(&self) -> &[u8] {
        self.memory.arena()
    }

    fn hypercall_in_flight(&self) -> bool {
        self.hypercalls.is_suspended()
    }
}

impl CheckpointTarget for Machine {
    fn arena_len(&self) -> usize {
        self.memory.len()
    }

    fn hypercall_in_flight(&self) -> bool {
        self.hypercalls.is_suspended()
    }

    /// Also drops every explicit page permission; the blob's exec page list replaces them.
    fn invalidate_decoded_cache(&mut self) {
        self.memory.invalidate_decoded();
        self.memory.reset_attributes();
    }

    fn arena_mut(&mut self) -> &mut [u8] {
        self.memory.arena_mut()
    }

    fn restore_exec_page(&mut self, page: u64) {
        self.memory.set_attributes(page, PageAttributes::CODE);
    }

    fn restore_registers(&mut self, cpu: &CpuState) {
        self.cpu.x = cpu.x;
        self.cpu.f = cpu.f;
        self.cpu.fcsr = cpu.fcsr;
    }

    fn restore_pc(&mut self, pc: u64) {
        self.cpu.pc = pc;
    }

    fn restore_memory_state(&mut self, state: MemoryManagementState) {
        self.mm = state;
    }

    fn restore_exec_context(&mut self, ctx: ExecContext) {
        self.exec = ctx;
    }

    fn restore_kernel_state(&mut self, state: EmulatedKernelState) {
        self.kernel = state;
    }

    fn mark_resumed(&mut self) {
        self.resumed = true;
    }
}
