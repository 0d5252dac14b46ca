//! NEC µPD765-class floppy disk controller.
//!
//! The host sees two registers: the read-only Main Status Register and the
//! bidirectional data FIFO. Everything else happens in [`Device::tick`],
//! which walks an explicit state machine. Every wait (reset, RQM settle,
//! head load, seek, transfer timeout) is a countdown in controller clock
//! ticks.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fmt,
    path::Path,
    rc::Rc,
};

use derivative::Derivative;
use once_cell::sync::Lazy;

use crate::{
    device::Device,
    error::{DiskError, FdcFault, SnapshotError},
    floppy::FloppyDisk,
    geometry::SECTOR_SIZE,
    port::PortConnector,
    snapshot::FloppySnapshot,
};

pub const DRIVE_COUNT: usize = 4;

// Timings, in microseconds.
const RESET_DELAY_US: u64 = 10_000;
const RQM_DELAY_US: u64 = 5;
const TRANSFER_TIMEOUT_US: u64 = 100_000;
const RECALIBRATE_US: u64 = 100_000;
const NOT_READY_US: u64 = 100_000;
const SECTOR_END_US: u64 = 10;
const READ_ID_US: u64 = 1_000;
const SHORT_COMMAND_US: u64 = 5;
/// SENSE_INTERRUPT_STATUS completes in a fixed number of ticks.
const SENSE_INT_TICKS: u64 = 5;

/// Drives polled by SENSE_INTERRUPT_STATUS after a reset.
const RESET_POLL_COUNT: u8 = 4;

pub mod msr {
    pub const RQM: u8 = 0x80;
    pub const DIO: u8 = 0x40;
    pub const EXM: u8 = 0x20;
    pub const BUSY: u8 = 0x10;
    pub const ACTD: u8 = 0x08;
    pub const ACTC: u8 = 0x04;
    pub const ACTB: u8 = 0x02;
    pub const ACTA: u8 = 0x01;
}

pub mod st0 {
    pub const IC1: u8 = 0x80;
    pub const IC0: u8 = 0x40;
    pub const SE: u8 = 0x20;
    pub const EC: u8 = 0x10;
    pub const NR: u8 = 0x08;
    pub const HD: u8 = 0x04;
    pub const US1: u8 = 0x02;
    pub const US0: u8 = 0x01;

    /// Interrupt code 10: invalid command.
    pub const INVALID_COMMAND: u8 = IC1;
    /// Interrupt code 11: drive ready line changed (after reset).
    pub const READY_CHANGED: u8 = IC1 | IC0;
}

pub mod st1 {
    pub const NW: u8 = 0x02;
    pub const ND: u8 = 0x04;
}

pub mod st3 {
    pub const ESIG: u8 = 0x80;
    pub const WPDR: u8 = 0x40;
    pub const RDY: u8 = 0x20;
    pub const TRK0: u8 = 0x10;
    pub const DSDR: u8 = 0x08;
    pub const HDDR: u8 = 0x04;
    pub const DS1: u8 = 0x02;
    pub const DS0: u8 = 0x01;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdcState {
    ResetStart,
    ResetActive,
    ResetDone,
    RqmDelay,
    CmdWait,
    CmdRead,
    ParamWait,
    CmdExec,
    CmdExecDelay,
    CmdExecDone,
    CmdError,
    ReadStart,
    ReadExec,
    WriteStart,
    WriteExec,
    RwDone,
    NdmaWait,
    DmaWait,
    ResultWait,
    NotReady,
    AbnormalTermination,
}

impl fmt::Display for FdcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    CpuToFdc,
    FdcToCpu,
}

type ExecFn = fn(&mut FloppyController) -> Result<FdcState, FdcFault>;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Command {
    pub name: &'static str,
    pub params: usize,
    #[derivative(Debug = "ignore")]
    exec: ExecFn,
    pub interrupt: bool,
}

const CMD_READ_TRACK: u8 = 0x02;
const CMD_SPECIFY: u8 = 0x03;
const CMD_SENSE_DRIVE_STATUS: u8 = 0x04;
const CMD_WRITE_DATA: u8 = 0x05;
const CMD_READ_DATA: u8 = 0x06;
const CMD_RECALIBRATE: u8 = 0x07;
const CMD_SENSE_INTERRUPT: u8 = 0x08;
const CMD_WRITE_DELETED_DATA: u8 = 0x09;
const CMD_READ_ID: u8 = 0x0A;
const CMD_READ_DELETED_DATA: u8 = 0x0C;
const CMD_FORMAT_TRACK: u8 = 0x0D;
const CMD_SEEK: u8 = 0x0F;
const CMD_SCAN_EQUAL: u8 = 0x11;
const CMD_SCAN_LOW_OR_EQUAL: u8 = 0x19;
const CMD_SCAN_HIGH_OR_EQUAL: u8 = 0x1D;

/// Command set, keyed by the low five bits of the command byte.
static COMMANDS: Lazy<HashMap<u8, Command>> = Lazy::new(|| {
    use FloppyController as F;

    let table: [(u8, &'static str, usize, ExecFn, bool); 15] = [
        (CMD_READ_TRACK, "READ_TRACK", 8, F::cmd_read_track, true),
        (CMD_SPECIFY, "SPECIFY", 2, F::cmd_specify, false),
        (CMD_SENSE_DRIVE_STATUS, "SENSE_DRIVE_STATUS", 1, F::cmd_sense_drive_status, false),
        (CMD_WRITE_DATA, "WRITE_DATA", 8, F::cmd_write_data, true),
        (CMD_READ_DATA, "READ_DATA", 8, F::cmd_read_data, true),
        (CMD_RECALIBRATE, "RECALIBRATE", 1, F::cmd_recalibrate, true),
        (CMD_SENSE_INTERRUPT, "SENSE_INTERRUPT_STATUS", 0, F::cmd_sense_interrupt, false),
        (CMD_WRITE_DELETED_DATA, "WRITE_DELETED_DATA", 8, F::cmd_not_implemented, true),
        (CMD_READ_ID, "READ_ID", 1, F::cmd_read_id, false),
        (CMD_READ_DELETED_DATA, "READ_DELETED_DATA", 8, F::cmd_not_implemented, true),
        (CMD_FORMAT_TRACK, "FORMAT_TRACK", 5, F::cmd_not_implemented, true),
        (CMD_SEEK, "SEEK", 2, F::cmd_seek, true),
        (CMD_SCAN_EQUAL, "SCAN_EQUAL", 8, F::cmd_not_implemented, true),
        (CMD_SCAN_LOW_OR_EQUAL, "SCAN_LOW_OR_EQUAL", 8, F::cmd_not_implemented, true),
        (CMD_SCAN_HIGH_OR_EQUAL, "SCAN_HIGH_OR_EQUAL", 8, F::cmd_not_implemented, true),
    ];

    table
        .into_iter()
        .map(|(code, name, params, exec, interrupt)| {
            (
                code,
                Command {
                    name,
                    params,
                    exec,
                    interrupt,
                },
            )
        })
        .collect()
});

#[derive(Debug)]
pub struct FloppyController {
    clock_hz: u64,

    state: FdcState,
    next_state: FdcState,
    op_wait: u64,

    fifo: VecDeque<u8>,
    command: Option<&'static Command>,
    command_id: u8,
    /// Drive and head bits of the current command (US0, US1, HD).
    unit: u8,
    /// C/H/R parameters of the current transfer, reported on abnormal end.
    id_field: (u8, u8, u8),

    st0: u8,
    st1: u8,
    st3: u8,
    pcn: [u8; DRIVE_COUNT],
    seek_status: Option<u8>,
    reset_polls: u8,

    curr_drive: usize,
    curr_head: u8,
    curr_sector: u8,
    max_sector: u8,
    multi_track: bool,

    srt: u8,
    hlt: u8,
    hut: u8,
    non_dma: bool,

    command_busy: bool,
    data_register_ready: bool,
    execution_phase: bool,
    drive_active: [bool; DRIVE_COUNT],
    direction: DataDirection,

    dma_pending: bool,
    interrupt_pending: bool,
    disk_changed: bool,

    images: [FloppyDisk; DRIVE_COUNT],
}

impl FloppyController {
    pub fn new(clock_hz: u64) -> Self {
        let mut fdc = Self {
            clock_hz,
            state: FdcState::ResetStart,
            next_state: FdcState::CmdWait,
            op_wait: 0,
            fifo: VecDeque::with_capacity(SECTOR_SIZE),
            command: None,
            command_id: 0,
            unit: 0,
            id_field: (0, 0, 0),
            st0: 0,
            st1: 0,
            st3: 0,
            pcn: [0; DRIVE_COUNT],
            seek_status: None,
            reset_polls: 0,
            curr_drive: 0,
            curr_head: 0,
            curr_sector: 0,
            max_sector: 0,
            multi_track: false,
            srt: 0,
            hlt: 0,
            hut: 0,
            non_dma: true,
            command_busy: false,
            data_register_ready: false,
            execution_phase: false,
            drive_active: [false; DRIVE_COUNT],
            direction: DataDirection::CpuToFdc,
            dma_pending: false,
            interrupt_pending: false,
            disk_changed: true,
            images: Default::default(),
        };
        fdc.reset();
        fdc
    }

    /// Registers the Main Status Register at `base + 4` and the data FIFO at
    /// `base + 5`. `base` is a decoded port number.
    pub fn connect(fdc: &Rc<RefCell<Self>>, ports: &mut PortConnector, base: u16) -> bool {
        let (Some(msr_port), Some(data_port)) = (base.checked_add(4), base.checked_add(5)) else {
            tracing::error!("[FDC] Register base {:#06X} overflows the port space", base);
            return false;
        };

        let msr = fdc.clone();
        let fifo_in = fdc.clone();
        let fifo_out = fdc.clone();

        ports.connect_input(
            msr_port,
            Rc::new(move |_port: u16| msr.borrow_mut().read_main_status()),
            false,
        ) && ports.connect_input(
            data_port,
            Rc::new(move |_port: u16| fifo_in.borrow_mut().read_data()),
            false,
        ) && ports.connect_output(
            data_port,
            Rc::new(move |_port: u16, value: u8| fifo_out.borrow_mut().write_data(value)),
            false,
        )
    }

    pub fn clock_hz(&self) -> u64 {
        self.clock_hz
    }

    pub fn set_clock_hz(&mut self, clock_hz: u64) {
        tracing::debug!("[FDC] Clock set to {} Hz", clock_hz);
        self.clock_hz = clock_hz;
    }

    pub fn delay_to_ticks(&self, delay_us: u64) -> u64 {
        (delay_us * self.clock_hz / 1_000_000).max(1)
    }

    pub fn state(&self) -> FdcState {
        self.state
    }

    pub fn is_interrupt_pending(&self) -> bool {
        self.interrupt_pending
    }

    pub fn is_dma_pending(&self) -> bool {
        self.dma_pending
    }

    pub fn is_disk_changed(&self) -> bool {
        self.disk_changed
    }

    pub fn is_non_dma(&self) -> bool {
        self.non_dma
    }

    pub fn is_drive_active(&self, drive: usize) -> bool {
        self.drive_active.get(drive).copied().unwrap_or(false)
    }

    pub fn step_rate_ms(&self) -> u8 {
        self.srt
    }

    pub fn head_load_ms(&self) -> u8 {
        self.hlt
    }

    pub fn head_unload_ms(&self) -> u8 {
        self.hut
    }

    /// Present cylinder number of a drive.
    pub fn cylinder(&self, drive: usize) -> Option<u8> {
        self.pcn.get(drive).copied()
    }

    fn push(&mut self, value: u8) {
        self.fifo.push_back(value);
    }

    fn pop(&mut self) -> u8 {
        match self.fifo.pop_front() {
            Some(value) => value,
            None => {
                tracing::warn!("[FDC] FIFO underrun");
                0xFF
            }
        }
    }

    fn count_down(&mut self) -> bool {
        self.op_wait = self.op_wait.saturating_sub(1);
        self.op_wait == 0
    }

    fn set_wait_us(&mut self, delay_us: u64) {
        self.op_wait = self.delay_to_ticks(delay_us);
    }

    fn rqm_delay(&mut self, next: FdcState) {
        self.set_wait_us(RQM_DELAY_US);
        self.data_register_ready = false;
        self.state = FdcState::RqmDelay;
        self.next_state = next;
    }

    pub fn read_main_status(&mut self) -> u8 {
        if self.non_dma {
            self.interrupt_pending = false;
        }

        let mut status = 0;
        if self.data_register_ready {
            status |= msr::RQM;
        }
        if self.direction == DataDirection::FdcToCpu {
            status |= msr::DIO;
        }
        if self.execution_phase && self.non_dma {
            status |= msr::EXM;
        }
        if self.command_busy {
            status |= msr::BUSY;
        }
        for (drive, active) in self.drive_active.iter().enumerate() {
            if *active {
                status |= 1 << drive;
            }
        }

        tracing::trace!("[FDC] MSR = {:#04X} ({})", status, self.state);
        status
    }

    pub fn read_data(&mut self) -> u8 {
        if self.non_dma {
            self.interrupt_pending = false;
        }

        let value = match self.state {
            FdcState::ResultWait => {
                if !self.non_dma {
                    self.interrupt_pending = false;
                }
                self.command_busy = true;
                self.rqm_delay(FdcState::ResultWait);
                self.pop()
            }
            FdcState::DmaWait | FdcState::NdmaWait => {
                let value = self.pop();
                self.dma_acknowledge();
                self.read_sector();
                value
            }
            state => {
                tracing::warn!("[FDC] Data read in unexpected state {}", state);
                0xFF
            }
        };

        tracing::trace!("[FDC] FIFO read {:#04X}", value);
        value
    }

    pub fn write_data(&mut self, value: u8) {
        if self.non_dma {
            self.interrupt_pending = false;
        }

        tracing::trace!("[FDC] FIFO write {:#04X}", value);
        match self.state {
            FdcState::CmdWait => {
                self.push(value);
                self.command_busy = true;
                self.rqm_delay(FdcState::CmdRead);
            }
            FdcState::ParamWait => {
                self.push(value);
                self.command_busy = true;
                self.rqm_delay(FdcState::ParamWait);
            }
            FdcState::DmaWait | FdcState::NdmaWait => {
                self.push(value);
                self.dma_acknowledge();
                self.write_sector();
            }
            state => {
                tracing::warn!(
                    "[FDC] Data write {:#04X} in unexpected state {}, dropped",
                    value,
                    state
                );
            }
        }
    }

    pub fn dma_acknowledge(&mut self) {
        self.dma_pending = false;
    }

    /// One byte of a DMA read cycle.
    pub fn dma_read(&mut self) -> u8 {
        if self.state != FdcState::DmaWait {
            tracing::warn!("[FDC] DMA read in state {}", self.state);
            return 0xFF;
        }
        self.read_data()
    }

    /// One byte of a DMA write cycle.
    pub fn dma_write(&mut self, value: u8) {
        if self.state != FdcState::DmaWait {
            tracing::warn!("[FDC] DMA write in state {}", self.state);
            return;
        }
        self.write_data(value);
    }

    /// Terminal count: the host has moved all the bytes it wanted. Ends the
    /// transfer and moves to the result phase.
    pub fn dma_terminal_count(&mut self) {
        tracing::debug!("[FDC] Terminal count in state {}", self.state);
        if !matches!(
            self.state,
            FdcState::DmaWait | FdcState::NdmaWait | FdcState::ReadExec | FdcState::WriteExec
        ) {
            tracing::warn!("[FDC] Terminal count outside a transfer, ignored");
            return;
        }

        self.dma_pending = false;
        self.end_transfer();
    }

    fn read_command(&mut self) {
        self.command_id = self.pop();

        match COMMANDS.get(&(self.command_id & 0x1F)) {
            Some(command) => {
                tracing::debug!(
                    "[FDC] Command {} ({:#04X}), {} parameters",
                    command.name,
                    self.command_id,
                    command.params
                );
                self.command = Some(command);
                self.data_register_ready = command.params > 0;
                self.state = FdcState::ParamWait;
            }
            None => {
                tracing::warn!("[FDC] Unknown command {:#04X}", self.command_id);
                self.command = None;
                self.data_register_ready = false;
                self.state = FdcState::CmdError;
            }
        }
    }

    fn execute_command(&mut self) {
        let Some(command) = self.command else {
            self.state = FdcState::CmdError;
            return;
        };

        if self.command_id & 0x1F != CMD_SENSE_INTERRUPT {
            self.reset_polls = RESET_POLL_COUNT;
        }

        self.state = FdcState::CmdExec;
        self.execution_phase = true;
        self.data_register_ready = false;
        self.op_wait = 0;

        let next = match (command.exec)(self) {
            Ok(next) => next,
            Err(fault) => self.fault_state(fault),
        };
        tracing::debug!(
            "[FDC] {} queued {} bytes, next state {}",
            command.name,
            self.fifo.len(),
            next
        );

        self.next_state = next;
        self.state = if self.op_wait > 0 {
            FdcState::CmdExecDelay
        } else {
            next
        };
    }

    /// Turns a command fault into the state that reports it.
    fn fault_state(&mut self, fault: FdcFault) -> FdcState {
        tracing::warn!("[FDC] {}", fault);
        match fault {
            FdcFault::NotReady { .. } => {
                self.st0 = st0::IC0 | st0::NR | (self.unit & 0x07);
                self.set_wait_us(NOT_READY_US);
                FdcState::NotReady
            }
            FdcFault::InvalidSector(_)
            | FdcFault::InvalidCylinder(_)
            | FdcFault::InvalidHead(_)
            | FdcFault::UnsupportedSectorSize(_) => {
                self.st0 = st0::IC0 | (self.unit & 0x07);
                self.st1 = st1::ND;
                self.op_wait = 0;
                FdcState::AbnormalTermination
            }
            FdcFault::WriteProtected { .. } => {
                self.st0 = st0::IC0 | (self.unit & 0x07);
                self.st1 = st1::NW;
                self.op_wait = 0;
                FdcState::AbnormalTermination
            }
            FdcFault::Timeout | FdcFault::InvalidCommand(_) | FdcFault::NotImplemented(_) => {
                self.op_wait = 0;
                FdcState::CmdError
            }
        }
    }

    fn cmd_not_implemented(&mut self) -> Result<FdcState, FdcFault> {
        self.fifo.clear();
        let name = self.command.map(|c| c.name).unwrap_or("?");
        Err(FdcFault::NotImplemented(name))
    }

    fn cmd_specify(&mut self) -> Result<FdcState, FdcFault> {
        let p1 = self.pop();
        self.srt = 16 - (p1 >> 4);
        self.hut = (p1 & 0x0F) << 4;
        if self.hut == 0 {
            self.hut = 255;
        }

        let p2 = self.pop();
        self.hlt = p2 & 0xFE;
        if self.hlt == 0 {
            self.hlt = 255;
        }
        self.non_dma = p2 & 0x01 != 0;

        tracing::info!(
            "[FDC] SPECIFY srt={}ms hut={}ms hlt={}ms non_dma={}",
            self.srt,
            self.hut,
            self.hlt,
            self.non_dma
        );

        self.set_wait_us(SHORT_COMMAND_US);
        Ok(FdcState::CmdExecDone)
    }

    fn cmd_sense_interrupt(&mut self) -> Result<FdcState, FdcFault> {
        if let Some(status) = self.seek_status.take() {
            let drive = (status & 0x03) as usize;
            self.st0 = status;
            self.push(status);
            self.push(self.pcn[drive]);
        } else if self.reset_polls < RESET_POLL_COUNT {
            let drive = self.reset_polls;
            self.st0 = st0::READY_CHANGED | drive;
            self.push(self.st0);
            self.push(self.pcn[drive as usize]);
            self.reset_polls += 1;
        } else {
            self.st0 = st0::INVALID_COMMAND;
            self.push(self.st0);
        }

        tracing::info!("[FDC] SENSE_INTERRUPT_STATUS st0={:#04X}", self.st0);
        self.op_wait = SENSE_INT_TICKS;
        Ok(FdcState::CmdExecDone)
    }

    fn cmd_recalibrate(&mut self) -> Result<FdcState, FdcFault> {
        let drive = self.pop() & 0x03;
        self.unit = drive;
        tracing::info!("[FDC] RECALIBRATE drive {}", drive);

        let mut status = st0::SE | drive;
        if !self.images[drive as usize].is_loaded() {
            status |= st0::IC0 | st0::NR;
        }

        self.drive_active[drive as usize] = true;
        self.pcn[drive as usize] = 0;
        self.seek_status = Some(status);

        self.set_wait_us(RECALIBRATE_US);
        Ok(FdcState::CmdExecDone)
    }

    fn cmd_seek(&mut self) -> Result<FdcState, FdcFault> {
        let param = self.pop();
        let drive = (param & 0x03) as usize;
        let cylinder = self.pop();
        self.unit = param & 0x07;

        let travel = cylinder.abs_diff(self.pcn[drive]) as u64;
        tracing::info!(
            "[FDC] SEEK drive {} cylinder {} (travel {})",
            drive,
            cylinder,
            travel
        );

        let mut status = st0::SE | (param & 0x07);
        if !self.images[drive].is_loaded() {
            status |= st0::IC0 | st0::NR;
        }

        self.drive_active[drive] = true;
        self.pcn[drive] = cylinder;
        self.seek_status = Some(status);
        self.disk_changed = false;

        self.set_wait_us(travel * self.srt as u64 * 1_000);
        Ok(FdcState::CmdExecDone)
    }

    fn cmd_sense_drive_status(&mut self) -> Result<FdcState, FdcFault> {
        let param = self.pop();
        let drive = (param & 0x03) as usize;
        let disk = &self.images[drive];

        let mut status = st3::DSDR | (param & 0x07);
        if disk.is_loaded() {
            status |= st3::RDY;
        }
        if disk.is_write_protected() {
            status |= st3::WPDR;
        }
        if self.pcn[drive] == 0 {
            status |= st3::TRK0;
        }
        self.st3 = status;

        tracing::info!("[FDC] SENSE_DRIVE_STATUS drive {} st3={:#04X}", drive, status);
        self.push(status);
        self.set_wait_us(SHORT_COMMAND_US);
        Ok(FdcState::CmdExecDone)
    }

    fn cmd_read_id(&mut self) -> Result<FdcState, FdcFault> {
        let param = self.pop();
        let drive = (param & 0x03) as usize;
        let head = (param >> 2) & 0x01;
        self.unit = param & 0x07;

        let disk = &self.images[drive];
        if !disk.is_loaded() {
            return Err(FdcFault::NotReady { drive: drive as u8 });
        }
        if self.curr_sector == 0 {
            self.curr_sector = disk.geometry().first_sector();
        }

        tracing::info!("[FDC] READ_ID drive {} head {}", drive, head);

        self.drive_active[drive] = true;
        self.st0 = param & 0x07;
        self.fifo.clear();
        self.push(self.st0);
        self.push(0);
        self.push(0);
        self.push(self.pcn[drive]);
        self.push(head);
        self.push(self.curr_sector);
        self.push(2);

        self.disk_changed = false;
        self.set_wait_us(READ_ID_US);
        Ok(FdcState::CmdExecDone)
    }

    /// Pops the eight transfer parameters shared by READ_DATA, WRITE_DATA
    /// and READ_TRACK, and checks them against the loaded disk.
    fn start_transfer(&mut self, write: bool, check_sector: bool) -> Result<(), FdcFault> {
        let param = self.pop();
        let c = self.pop();
        let h = self.pop();
        let r = self.pop();
        let n = self.pop();
        let eot = self.pop();
        let _gpl = self.pop();
        let dtl = self.pop();

        self.unit = param & 0x07;
        self.curr_drive = (param & 0x03) as usize;
        self.curr_head = (param >> 2) & 0x01;
        self.curr_sector = r;
        self.max_sector = eot;
        self.id_field = (c, h, r);

        tracing::info!(
            "[FDC] drive={} head={} mt={} C={} H={} R={:#04X} N={} EOT={:#04X} DTL={:#04X}",
            self.curr_drive,
            self.curr_head,
            self.multi_track,
            c,
            h,
            r,
            n,
            eot,
            dtl
        );

        let disk = &self.images[self.curr_drive];
        if !disk.is_loaded() {
            return Err(FdcFault::NotReady {
                drive: self.curr_drive as u8,
            });
        }
        if n != 2 || dtl != 0xFF {
            return Err(FdcFault::UnsupportedSectorSize(n));
        }

        let geometry = *disk.geometry();
        if check_sector && (r < geometry.first_sector() || r > geometry.last_sector()) {
            return Err(FdcFault::InvalidSector(r));
        }
        if c >= geometry.cylinders {
            return Err(FdcFault::InvalidCylinder(c));
        }
        if self.curr_head >= geometry.heads {
            return Err(FdcFault::InvalidHead(self.curr_head));
        }
        if write && disk.is_write_protected() {
            return Err(FdcFault::WriteProtected {
                drive: self.curr_drive as u8,
            });
        }

        self.pcn[self.curr_drive] = c;
        self.drive_active[self.curr_drive] = true;
        self.set_wait_us(self.hlt as u64 * 1_000);
        Ok(())
    }

    fn cmd_read_data(&mut self) -> Result<FdcState, FdcFault> {
        self.multi_track = self.command_id & 0x80 != 0;
        self.start_transfer(false, true)?;
        self.push_sector()?;
        Ok(FdcState::ReadStart)
    }

    fn cmd_read_track(&mut self) -> Result<FdcState, FdcFault> {
        self.multi_track = false;
        self.start_transfer(false, false)?;
        self.curr_sector = self.images[self.curr_drive].geometry().first_sector();
        self.push_sector()?;
        Ok(FdcState::ReadStart)
    }

    fn cmd_write_data(&mut self) -> Result<FdcState, FdcFault> {
        self.multi_track = self.command_id & 0x80 != 0;
        self.start_transfer(true, true)?;
        Ok(FdcState::WriteStart)
    }

    fn push_sector(&mut self) -> Result<(), FdcFault> {
        let cylinder = self.pcn[self.curr_drive];
        let sector = self.images[self.curr_drive]
            .sector(cylinder, self.curr_head, self.curr_sector)
            .ok_or(FdcFault::InvalidCylinder(cylinder))?;
        self.fifo.extend(sector.iter().copied());
        Ok(())
    }

    /// Advances to the next sector. Returns `true` when the transfer has run
    /// off the end of its last track. A multi-track transfer on side 0
    /// carries on at the first sector of side 1; otherwise the sector wraps
    /// to the first one and the cylinder steps.
    fn update_curr_pos(&mut self) -> bool {
        let geometry = *self.images[self.curr_drive].geometry();
        let last = geometry.last_sector();
        let max = if self.non_dma {
            self.max_sector.min(last)
        } else {
            last
        };

        let mut end_of_track = self.curr_sector >= max;
        if end_of_track {
            self.curr_sector = geometry.first_sector();
            if self.multi_track && self.curr_head == 0 && geometry.heads > 1 {
                self.curr_head = 1;
                end_of_track = false;
            } else {
                if self.multi_track {
                    self.curr_head ^= 1;
                }
                let pcn = &mut self.pcn[self.curr_drive];
                *pcn = pcn.wrapping_add(1);
            }
        } else {
            self.curr_sector += 1;
        }

        tracing::debug!(
            "[FDC] Position C={} H={} R={:#04X} eot={}",
            self.pcn[self.curr_drive],
            self.curr_head,
            self.curr_sector,
            end_of_track
        );
        end_of_track
    }

    /// Reports the sector being transferred, not the one the command named.
    fn mark_position(&mut self) {
        self.id_field = (
            self.pcn[self.curr_drive],
            self.curr_head,
            self.curr_sector,
        );
    }

    fn end_transfer(&mut self) {
        self.data_register_ready = false;
        self.set_wait_us(SECTOR_END_US);
        self.next_state = FdcState::RwDone;
        self.state = FdcState::CmdExecDelay;
    }

    fn wait_for_host(&mut self) {
        self.dma_pending = true;
        self.set_wait_us(TRANSFER_TIMEOUT_US);
        self.state = if self.non_dma {
            FdcState::NdmaWait
        } else {
            FdcState::DmaWait
        };
    }

    fn read_sector(&mut self) {
        if self.fifo.is_empty() {
            if self.update_curr_pos() {
                tracing::debug!("[FDC] Read reached end of track");
                self.end_transfer();
                return;
            }
            if let Err(fault) = self.push_sector() {
                self.mark_position();
                self.state = self.fault_state(fault);
                return;
            }
        }
        self.wait_for_host();
    }

    fn write_sector(&mut self) {
        if self.fifo.len() >= SECTOR_SIZE {
            let cylinder = self.pcn[self.curr_drive];
            let (head, sector) = (self.curr_head, self.curr_sector);
            let bytes: Vec<u8> = self.fifo.drain(..SECTOR_SIZE).collect();

            let written = match self.images[self.curr_drive].sector_mut(cylinder, head, sector) {
                Some(target) => {
                    target.copy_from_slice(&bytes);
                    true
                }
                None => false,
            };
            if !written {
                self.mark_position();
                self.state = self.fault_state(FdcFault::InvalidCylinder(cylinder));
                return;
            }
            tracing::debug!("[FDC] Wrote C={} H={} R={:#04X}", cylinder, head, sector);

            if self.update_curr_pos() {
                self.end_transfer();
                return;
            }
        }
        self.wait_for_host();
    }

    fn push_rw_result(&mut self) {
        let drive = self.curr_drive;
        self.disk_changed = false;
        self.st0 = (self.curr_head << 2) | drive as u8;

        self.fifo.clear();
        self.push(self.st0);
        self.push(0);
        self.push(0);
        self.push(self.pcn[drive]);
        self.push(self.curr_head);
        self.push(self.curr_sector);
        self.push(2);
    }

    fn push_abnormal_result(&mut self) {
        let (c, h, r) = self.id_field;
        self.fifo.clear();
        self.push(self.st0);
        self.push(self.st1);
        self.push(0);
        self.push(c);
        self.push(h);
        self.push(r);
        self.push(2);
    }

    pub fn insert_disk(&mut self, drive: usize, disk: FloppyDisk) -> Result<(), DiskError> {
        let slot = self
            .images
            .get_mut(drive)
            .ok_or(DiskError::InvalidDrive(drive as u8))?;
        if !disk.is_loaded() {
            return Err(DiskError::NotLoaded(drive as u8));
        }

        tracing::info!("[FDC] Drive {}: inserted {}", drive, disk);
        *slot = disk;
        self.disk_changed = true;
        Ok(())
    }

    pub fn load_disk_image<P: AsRef<Path>>(
        &mut self,
        drive: usize,
        path: P,
    ) -> Result<(), DiskError> {
        if drive >= DRIVE_COUNT {
            return Err(DiskError::InvalidDrive(drive as u8));
        }
        let disk = FloppyDisk::load(path)?;
        self.insert_disk(drive, disk)
    }

    pub fn eject_disk(&mut self, drive: usize) -> Result<(), DiskError> {
        let slot = self
            .images
            .get_mut(drive)
            .ok_or(DiskError::InvalidDrive(drive as u8))?;

        tracing::info!("[FDC] Drive {}: ejected", drive);
        slot.clear();
        self.disk_changed = true;
        Ok(())
    }

    pub fn save_disk_image<P: AsRef<Path>>(&self, drive: usize, path: P) -> Result<(), DiskError> {
        let disk = self
            .images
            .get(drive)
            .ok_or(DiskError::InvalidDrive(drive as u8))?;
        if !disk.is_loaded() {
            return Err(DiskError::NotLoaded(drive as u8));
        }
        disk.save(path)
    }

    pub fn image_info(&self, drive: usize) -> Option<&FloppyDisk> {
        self.images.get(drive)
    }

    pub fn image_mut(&mut self, drive: usize) -> Option<&mut FloppyDisk> {
        self.images.get_mut(drive)
    }

    pub fn serialize(&self) -> FloppySnapshot {
        let mut snapshot = FloppySnapshot::default();
        for (slot, disk) in snapshot.images.iter_mut().zip(&self.images) {
            if disk.is_loaded() {
                *slot = disk.path().map(|p| p.display().to_string());
            }
        }
        snapshot
    }

    /// Reloads every drive from its image path. A drive whose image cannot
    /// be read is left empty.
    pub fn deserialize(&mut self, snapshot: &FloppySnapshot) -> Result<(), SnapshotError> {
        for (drive, path) in snapshot.images.iter().enumerate() {
            match path {
                Some(path) => {
                    if let Err(e) = self.load_disk_image(drive, path) {
                        tracing::error!("[FDC] Drive {}: cannot reload {}: {}", drive, path, e);
                        self.images[drive].clear();
                    }
                }
                None => self.images[drive].clear(),
            }
        }
        self.disk_changed = true;
        Ok(())
    }
}

impl Device for FloppyController {
    fn name(&self) -> &str {
        "fdc"
    }

    fn reset(&mut self) {
        tracing::debug!("[FDC] Reset");
        self.state = FdcState::ResetStart;
        self.next_state = FdcState::CmdWait;
        self.op_wait = 0;
        self.fifo.clear();
        self.command = None;
        self.command_id = 0;
        self.unit = 0;
        self.st0 = st0::READY_CHANGED;
        self.st1 = 0;
        self.st3 = 0;
        self.pcn = [0; DRIVE_COUNT];
        self.seek_status = None;
        self.reset_polls = 0;
        self.curr_drive = 0;
        self.curr_head = 0;
        self.curr_sector = 0;
        self.max_sector = 0;
        self.multi_track = false;
        self.srt = 16;
        self.hlt = 254;
        self.hut = 240;
        self.non_dma = true;
        self.command_busy = false;
        self.data_register_ready = false;
        self.execution_phase = false;
        self.drive_active = [false; DRIVE_COUNT];
        self.direction = DataDirection::CpuToFdc;
        self.dma_pending = false;
        self.interrupt_pending = false;
    }

    fn tick(&mut self) {
        match self.state {
            FdcState::ResetStart => {
                self.set_wait_us(RESET_DELAY_US);
                self.command_busy = true;
                self.state = FdcState::ResetActive;
            }
            FdcState::ResetActive => {
                if self.count_down() {
                    self.state = FdcState::ResetDone;
                }
            }
            FdcState::ResetDone => {
                tracing::debug!("[FDC] Reset done");
                self.state = FdcState::CmdWait;
                self.interrupt_pending = true;
            }
            FdcState::RqmDelay => {
                if self.count_down() {
                    let pending = self.fifo.len();
                    self.data_register_ready = match self.next_state {
                        FdcState::ParamWait => self.command.is_some_and(|c| pending < c.params),
                        FdcState::ResultWait => pending > 0,
                        _ => false,
                    };
                    self.state = self.next_state;
                }
            }
            FdcState::CmdWait => {
                self.data_register_ready = true;
                self.command_busy = false;
            }
            FdcState::CmdRead => self.read_command(),
            FdcState::ParamWait => {
                let pending = self.fifo.len();
                if self.command.is_some_and(|c| pending >= c.params) {
                    self.execute_command();
                }
            }
            FdcState::CmdExec => {}
            FdcState::CmdExecDelay => {
                if self.count_down() {
                    self.state = self.next_state;
                }
            }
            FdcState::CmdExecDone => {
                self.drive_active = [false; DRIVE_COUNT];
                self.data_register_ready = true;
                self.execution_phase = false;

                if self.fifo.is_empty() {
                    self.direction = DataDirection::CpuToFdc;
                    self.state = FdcState::CmdWait;
                } else {
                    self.direction = DataDirection::FdcToCpu;
                    self.state = FdcState::ResultWait;
                }

                if self.command.is_some_and(|c| c.interrupt) {
                    self.interrupt_pending = true;
                }
            }
            FdcState::ResultWait => {
                if self.fifo.is_empty() {
                    self.command_busy = false;
                    self.direction = DataDirection::CpuToFdc;
                    self.state = FdcState::CmdWait;
                }
            }
            FdcState::ReadStart => {
                self.direction = DataDirection::FdcToCpu;
                self.set_wait_us(TRANSFER_TIMEOUT_US);
                self.state = FdcState::ReadExec;
            }
            FdcState::ReadExec => self.read_sector(),
            FdcState::WriteStart => {
                self.direction = DataDirection::CpuToFdc;
                self.set_wait_us(TRANSFER_TIMEOUT_US);
                self.state = FdcState::WriteExec;
            }
            FdcState::WriteExec => self.write_sector(),
            FdcState::RwDone => {
                self.push_rw_result();
                self.state = FdcState::CmdExecDone;
            }
            FdcState::DmaWait => {
                if self.count_down() {
                    self.state = self.fault_state(FdcFault::Timeout);
                }
            }
            FdcState::NdmaWait => {
                self.data_register_ready = true;
                if self.count_down() {
                    self.data_register_ready = false;
                    self.state = self.fault_state(FdcFault::Timeout);
                }
            }
            FdcState::CmdError => {
                self.st0 = st0::INVALID_COMMAND;
                self.fifo.clear();
                self.push(self.st0);
                self.state = FdcState::CmdExecDone;
            }
            FdcState::AbnormalTermination => {
                self.push_abnormal_result();
                self.state = FdcState::CmdExecDone;
            }
            FdcState::NotReady => {
                self.fifo.clear();
                self.push(self.st0);
                self.state = FdcState::CmdExecDone;
            }
        }
    }
}
