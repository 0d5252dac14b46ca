use std::fmt;

use derivative::Derivative;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    bus::Bus,
    error::{CpuFault, SnapshotError},
    port::PortConnector,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CpuState {
    #[default]
    Stop,
    Run,
    Step,
    Halt,
}

impl fmt::Display for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuState::Stop => write!(f, "STOP"),
            CpuState::Run => write!(f, "RUN"),
            CpuState::Step => write!(f, "STEP"),
            CpuState::Halt => write!(f, "HALT"),
        }
    }
}

/// What a CPU family plugs into the generic core: its register file, reset
/// vector and address width. Instruction semantics come from the
/// [`OpcodeTable`].
pub trait Architecture: 'static {
    type Registers: fmt::Debug + Clone + Default + Serialize + DeserializeOwned;

    /// Discriminator written into snapshots.
    const ID: &'static str;
    const ADDRESS_BITS: u32;
    /// Ticks reported for each step spent in HALT.
    const HALT_TICKS: u32 = 1;

    fn reset_vector(bus: &Bus) -> u32;
}

pub type OpcodeHandler<A> = Box<dyn Fn(&mut Context<'_, A>) -> anyhow::Result<()>>;

pub struct OpcodeTable<A: Architecture> {
    handlers: Vec<Option<OpcodeHandler<A>>>,
}

impl<A: Architecture> Default for OpcodeTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Architecture> OpcodeTable<A> {
    pub fn new() -> Self {
        Self {
            handlers: (0..256).map(|_| None).collect(),
        }
    }

    pub fn set<F>(&mut self, opcode: u8, handler: F) -> &mut Self
    where
        F: Fn(&mut Context<'_, A>) -> anyhow::Result<()> + 'static,
    {
        if self.handlers[opcode as usize].is_some() {
            tracing::warn!("[CPU] Replacing handler for opcode {:#04X}", opcode);
        }
        self.handlers[opcode as usize] = Some(Box::new(handler));
        self
    }

    pub fn with<F>(mut self, opcode: u8, handler: F) -> Self
    where
        F: Fn(&mut Context<'_, A>) -> anyhow::Result<()> + 'static,
    {
        self.set(opcode, handler);
        self
    }

    pub fn is_assigned(&self, opcode: u8) -> bool {
        self.handlers[opcode as usize].is_some()
    }

    fn get(&self, opcode: u8) -> Option<&OpcodeHandler<A>> {
        self.handlers[opcode as usize].as_ref()
    }
}

/// Everything an opcode handler may touch while executing one instruction.
pub struct Context<'a, A: Architecture> {
    pub regs: &'a mut A::Registers,
    pub bus: &'a mut Bus,
    pub ports: &'a mut PortConnector,
    opcode: u8,
    pc: &'a mut u32,
    ticks: &'a mut u32,
    state: &'a mut CpuState,
    address_mask: u32,
}

impl<A: Architecture> Context<'_, A> {
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn pc(&self) -> u32 {
        *self.pc
    }

    pub fn set_pc(&mut self, address: u32) {
        *self.pc = address & self.address_mask;
    }

    pub fn fetch8(&mut self) -> u8 {
        let value = self.bus.read8(*self.pc);
        *self.pc = self.pc.wrapping_add(1) & self.address_mask;
        value
    }

    pub fn fetch16(&mut self) -> u16 {
        let low = self.fetch8() as u16;
        let high = self.fetch8() as u16;
        (high << 8) | low
    }

    /// Charges `n` clock pulses to the current instruction.
    pub fn tick(&mut self, n: u32) {
        *self.ticks += n;
    }

    pub fn halt(&mut self) {
        *self.state = CpuState::Halt;
    }

    pub fn stop(&mut self) {
        *self.state = CpuState::Stop;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CpuSnapshot<R> {
    id: String,
    state: CpuState,
    pc: u32,
    ticks: u64,
    registers: R,
}

/// Generic fetch/decode/execute core.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Cpu<A: Architecture> {
    regs: A::Registers,
    pc: u32,
    address_mask: u32,
    state: CpuState,
    op_ticks: u32,
    total_ticks: u64,
    last_address: u32,
    fault: Option<CpuFault>,
    #[derivative(Debug = "ignore")]
    opcodes: OpcodeTable<A>,
}

impl<A: Architecture> Cpu<A> {
    pub fn new(opcodes: OpcodeTable<A>) -> Self {
        let address_mask = if A::ADDRESS_BITS >= 32 {
            u32::MAX
        } else {
            (1u32 << A::ADDRESS_BITS) - 1
        };

        Self {
            regs: A::Registers::default(),
            pc: 0,
            address_mask,
            state: CpuState::Stop,
            op_ticks: 0,
            total_ticks: 0,
            last_address: 0,
            fault: None,
            opcodes,
        }
    }

    pub fn id(&self) -> &'static str {
        A::ID
    }

    pub fn reset(&mut self, bus: &Bus) {
        self.regs = A::Registers::default();
        self.pc = A::reset_vector(bus) & self.address_mask;
        self.state = CpuState::Stop;
        self.op_ticks = 0;
        self.total_ticks = 0;
        self.last_address = self.pc;
        self.fault = None;

        tracing::debug!("[CPU] {} reset, PC={:#06X}", A::ID, self.pc);
    }

    pub fn start(&mut self) {
        if self.state == CpuState::Stop {
            self.state = CpuState::Run;
        }
    }

    pub fn halt(&mut self) {
        self.state = CpuState::Halt;
    }

    pub fn stop(&mut self) {
        self.state = CpuState::Stop;
    }

    /// Wakes a halted CPU. Returns whether the CPU was halted.
    pub fn interrupt(&mut self) -> bool {
        if self.state != CpuState::Halt {
            return false;
        }
        tracing::trace!("[CPU] Interrupt wakes CPU at {:#06X}", self.pc);
        self.state = CpuState::Run;
        true
    }

    /// Executes one instruction. In STOP this does nothing and touches no
    /// memory. In HALT it only burns `HALT_TICKS`. Returns `true` while the
    /// CPU is running or halted waiting for an interrupt.
    pub fn step(&mut self, bus: &mut Bus, ports: &mut PortConnector) -> bool {
        match self.state {
            CpuState::Stop => {
                self.op_ticks = 0;
                return false;
            }
            CpuState::Halt => {
                self.op_ticks = A::HALT_TICKS;
                self.total_ticks += u64::from(self.op_ticks);
                return true;
            }
            CpuState::Run | CpuState::Step => {}
        }

        let single = self.state == CpuState::Step;
        let address = self.pc;
        self.last_address = address;
        self.op_ticks = 0;

        let result = {
            let Cpu {
                regs,
                pc,
                address_mask,
                state,
                op_ticks,
                opcodes,
                ..
            } = self;

            let mut ctx = Context {
                regs,
                bus,
                ports,
                opcode: 0,
                pc,
                ticks: op_ticks,
                state,
                address_mask: *address_mask,
            };
            let opcode = ctx.fetch8();
            ctx.opcode = opcode;

            match opcodes.get(opcode) {
                Some(handler) => handler(&mut ctx)
                    .map_err(|source| CpuFault::Execution { address, source }),
                None => Err(CpuFault::UnknownOpcode { opcode, address }),
            }
        };

        self.total_ticks += u64::from(self.op_ticks);

        match result {
            Ok(()) => {
                tracing::trace!(
                    "[CPU] {:#06X}: {} ticks, state {}",
                    address,
                    self.op_ticks,
                    self.state
                );
                if single && self.state == CpuState::Step {
                    self.state = CpuState::Stop;
                }
            }
            Err(fault) => {
                tracing::error!("[CPU] {}, stopping", fault);
                self.fault = Some(fault);
                self.state = CpuState::Stop;
            }
        }

        matches!(self.state, CpuState::Run | CpuState::Halt)
    }

    /// Executes exactly one instruction, then parks in STOP.
    pub fn single_step(&mut self, bus: &mut Bus, ports: &mut PortConnector) -> bool {
        if self.state == CpuState::Stop {
            self.state = CpuState::Step;
        }
        self.step(bus, ports)
    }

    /// Steps until the CPU leaves RUN.
    pub fn run(&mut self, bus: &mut Bus, ports: &mut PortConnector) {
        self.start();
        while self.state == CpuState::Run {
            self.step(bus, ports);
        }
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    pub fn instruction_ticks(&self) -> u32 {
        self.op_ticks
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn set_pc(&mut self, address: u32) {
        self.pc = address & self.address_mask;
    }

    /// Address of the last instruction fetched.
    pub fn last_address(&self) -> u32 {
        self.last_address
    }

    pub fn fault(&self) -> Option<&CpuFault> {
        self.fault.as_ref()
    }

    pub fn regs(&self) -> &A::Registers {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut A::Registers {
        &mut self.regs
    }

    pub fn serialize(&self) -> Result<serde_json::Value, SnapshotError> {
        let snapshot = CpuSnapshot {
            id: A::ID.to_string(),
            state: self.state,
            pc: self.pc,
            ticks: self.total_ticks,
            registers: self.regs.clone(),
        };
        Ok(serde_json::to_value(snapshot)?)
    }

    fn parse_snapshot(value: &serde_json::Value) -> Result<CpuSnapshot<A::Registers>, SnapshotError> {
        let id = value
            .get("id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| SnapshotError::Missing("cpu id".to_string()))?;
        if id != A::ID {
            return Err(SnapshotError::compat(format!(
                "cpu is {}, snapshot has {}",
                A::ID,
                id
            )));
        }

        Ok(serde_json::from_value(value.clone())?)
    }

    /// Validates a snapshot section without applying it.
    pub fn check_snapshot(value: &serde_json::Value) -> Result<(), SnapshotError> {
        Self::parse_snapshot(value).map(|_| ())
    }

    pub fn deserialize(&mut self, value: &serde_json::Value) -> Result<(), SnapshotError> {
        let snapshot = Self::parse_snapshot(value)?;

        self.regs = snapshot.registers;
        self.pc = snapshot.pc & self.address_mask;
        self.state = snapshot.state;
        self.total_ticks = snapshot.ticks;
        self.op_ticks = 0;
        self.last_address = self.pc;
        self.fault = None;

        tracing::debug!("[CPU] Restored {} at PC={:#06X}", A::ID, self.pc);
        Ok(())
    }
}
