//! The computer facade: one bus, one port table, one CPU and a list of
//! devices clocked in lockstep with it.

use std::{cell::RefCell, fs, path::Path, rc::Rc};

use anyhow::{anyhow, bail};
use derivative::Derivative;

use crate::{
    bus::{AccessMode, Bus},
    config::ComputerConfig,
    cpu::{Architecture, Cpu, OpcodeTable},
    device::Device,
    error::SnapshotError,
    fdc::FloppyController,
    floppy::FloppyDisk,
    memory_block::{MemoryBlock, MemoryKind},
    port::PortConnector,
    snapshot::{ComputerInfo, Snapshot},
};

pub type DeviceRef = Rc<RefCell<dyn Device>>;

struct Attached {
    device: DeviceRef,
    /// Skipped while turbo is on (audio sinks and the like).
    realtime: bool,
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Computer<A: Architecture> {
    config: ComputerConfig,
    bus: Bus,
    ports: PortConnector,
    cpu: Cpu<A>,
    #[derivative(Debug = "ignore")]
    devices: Vec<Attached>,
    fdc: Option<Rc<RefCell<FloppyController>>>,
    ticks: u64,
}

impl<A: Architecture> Computer<A> {
    pub fn config(&self) -> &ComputerConfig {
        &self.config
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn ports(&self) -> &PortConnector {
        &self.ports
    }

    pub fn ports_mut(&mut self) -> &mut PortConnector {
        &mut self.ports
    }

    pub fn cpu(&self) -> &Cpu<A> {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu<A> {
        &mut self.cpu
    }

    pub fn fdc(&self) -> Option<&Rc<RefCell<FloppyController>>> {
        self.fdc.as_ref()
    }

    /// Clock pulses delivered to devices since the last reboot.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn is_turbo(&self) -> bool {
        self.config.turbo
    }

    pub fn set_turbo(&mut self, turbo: bool) {
        tracing::info!("[COMPUTER] Turbo {}", if turbo { "on" } else { "off" });
        self.config.turbo = turbo;
    }

    pub fn set_cpu_speed(&mut self, hz: u64) -> anyhow::Result<()> {
        if hz == 0 {
            bail!("cpu speed must be non-zero");
        }
        tracing::info!("[COMPUTER] CPU speed {} Hz", hz);
        self.config.clock_speed_hz = hz;
        if let Some(fdc) = &self.fdc {
            fdc.borrow_mut().set_clock_hz(hz);
        }
        Ok(())
    }

    /// Runs one CPU instruction, then delivers its ticks to every device,
    /// one pulse at a time, in registration order. Returns whether the CPU
    /// is still running.
    pub fn step(&mut self) -> bool {
        let running = self.cpu.step(&mut self.bus, &mut self.ports);
        let ticks = self.cpu.instruction_ticks();

        let turbo = self.config.turbo;
        for _ in 0..ticks {
            for attached in &self.devices {
                if turbo && attached.realtime {
                    continue;
                }
                attached.device.borrow_mut().tick();
            }
        }
        self.ticks += u64::from(ticks);

        running
    }

    /// Steps until at least `ticks` pulses have elapsed or the CPU stops.
    /// Returns the number of pulses actually run.
    pub fn run_for(&mut self, ticks: u64) -> u64 {
        let start = self.ticks;
        while self.ticks - start < ticks {
            if !self.step() {
                break;
            }
        }
        self.ticks - start
    }

    /// CPU reset. Memory and devices are left alone.
    pub fn reset(&mut self) {
        tracing::info!("[COMPUTER] Reset");
        self.cpu.reset(&self.bus);
        self.cpu.start();
    }

    /// Power cycle: clears RAM, resets every device and the CPU.
    pub fn reboot(&mut self) {
        tracing::warn!("[COMPUTER] Reboot");
        self.bus.clear(0);
        for attached in &self.devices {
            attached.device.borrow_mut().reset();
        }
        self.ticks = 0;
        self.reset();
    }

    pub fn load_binary<P: AsRef<Path>>(&mut self, path: P, address: u32) -> anyhow::Result<usize> {
        self.bus.load_binary(path, address)
    }

    pub fn in_port(&self, port: u16) -> u8 {
        self.ports.in_port(port)
    }

    pub fn out_port(&self, port: u16, value: u8) {
        self.ports.out_port(port, value)
    }

    fn floppy(&self) -> anyhow::Result<&Rc<RefCell<FloppyController>>> {
        self.fdc
            .as_ref()
            .ok_or_else(|| anyhow!("{} has no floppy controller", self.config.id))
    }

    pub fn insert_disk<P: AsRef<Path>>(&mut self, drive: usize, path: P) -> anyhow::Result<()> {
        self.floppy()?.borrow_mut().load_disk_image(drive, path)?;
        Ok(())
    }

    pub fn insert_disk_image(&mut self, drive: usize, disk: FloppyDisk) -> anyhow::Result<()> {
        self.floppy()?.borrow_mut().insert_disk(drive, disk)?;
        Ok(())
    }

    pub fn eject_disk(&mut self, drive: usize) -> anyhow::Result<()> {
        self.floppy()?.borrow_mut().eject_disk(drive)?;
        Ok(())
    }

    pub fn save_snapshot(&self, dir: &Path) -> Result<(), SnapshotError> {
        fs::create_dir_all(dir)?;

        let snapshot = Snapshot {
            computer: ComputerInfo {
                id: self.config.id.clone(),
                baseram: self.config.base_ram,
            },
            cpu: Some(self.cpu.serialize()?),
            memory: Some(self.bus.serialize(dir)?),
            floppy: self.fdc.as_ref().map(|fdc| fdc.borrow().serialize()),
        };
        snapshot.save(dir)
    }

    /// Restores a snapshot written by an identically shaped computer. All
    /// compatibility checks run before anything is modified, except the
    /// floppy section, whose missing images only leave drives empty.
    pub fn restore_snapshot(&mut self, dir: &Path) -> Result<(), SnapshotError> {
        let snapshot = Snapshot::load(dir)?;

        if snapshot.computer.id != self.config.id {
            return Err(SnapshotError::compat(format!(
                "computer is {}, snapshot has {}",
                self.config.id, snapshot.computer.id
            )));
        }
        if snapshot.computer.baseram != self.config.base_ram {
            return Err(SnapshotError::compat(format!(
                "base RAM is {}KB, snapshot has {}KB",
                self.config.base_ram, snapshot.computer.baseram
            )));
        }

        let cpu = snapshot.cpu_section()?;
        Cpu::<A>::check_snapshot(cpu)?;

        self.bus.deserialize(snapshot.memory_section()?, dir)?;
        self.cpu.deserialize(cpu)?;

        if let (Some(fdc), Some(floppy)) = (&self.fdc, &snapshot.floppy) {
            fdc.borrow_mut().deserialize(floppy)?;
        }

        tracing::info!("[COMPUTER] Restored snapshot from {}", dir.display());
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum BlockSpec {
    Ram { name: String, base: u32, size: u32 },
    Rom { name: String, base: u32, data: Vec<u8> },
}

/// Assembles a [`Computer`]. ROM blocks are mapped read-only, so a ROM
/// declared over a RAM block shadows its reads and lets writes through.
#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct ComputerBuilder {
    config: ComputerConfig,
    blocks: Vec<BlockSpec>,
    floppy_port: Option<u16>,
    #[derivative(Debug = "ignore")]
    devices: Vec<(DeviceRef, bool)>,
}

impl ComputerBuilder {
    pub fn new(config: ComputerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn ram(&mut self, name: &str, base: u32, size: u32) -> &mut Self {
        self.blocks.push(BlockSpec::Ram {
            name: name.to_string(),
            base,
            size,
        });
        self
    }

    pub fn rom(&mut self, name: &str, base: u32, data: &[u8]) -> &mut Self {
        self.blocks.push(BlockSpec::Rom {
            name: name.to_string(),
            base,
            data: data.to_vec(),
        });
        self
    }

    /// Adds a floppy controller with its registers at `base + 4` and
    /// `base + 5` (decoded port numbers).
    pub fn floppy(&mut self, base: u16) -> &mut Self {
        self.floppy_port = Some(base);
        self
    }

    pub fn device(&mut self, device: DeviceRef) -> &mut Self {
        self.devices.push((device, false));
        self
    }

    /// A device that only makes sense at real speed; not clocked in turbo.
    pub fn realtime_device(&mut self, device: DeviceRef) -> &mut Self {
        self.devices.push((device, true));
        self
    }

    pub fn build<A: Architecture>(&self, opcodes: OpcodeTable<A>) -> anyhow::Result<Computer<A>> {
        let config = self.config.clone();
        config.validate()?;
        if config.address_bits != A::ADDRESS_BITS {
            bail!(
                "{} has a {}-bit address bus, configuration says {}",
                A::ID,
                A::ADDRESS_BITS,
                config.address_bits
            );
        }

        tracing::info!(
            "[COMPUTER] Building {} ({} cpu, {} blocks)",
            config.id,
            A::ID,
            self.blocks.len()
        );

        let mut bus = Bus::new(config.block_granularity)?;
        if !bus.init(config.address_bits) {
            bail!("cannot initialise a {}-bit bus", config.address_bits);
        }

        // RAM first so ROM can shadow it.
        let (ram, rom): (Vec<&BlockSpec>, Vec<&BlockSpec>) = self
            .blocks
            .iter()
            .partition(|spec| matches!(spec, BlockSpec::Ram { .. }));
        for spec in ram.into_iter().chain(rom) {
            let (block, base, shadow) = match spec {
                BlockSpec::Ram { name, base, size } => {
                    (MemoryBlock::new(name, *size, MemoryKind::Ram)?, *base, false)
                }
                BlockSpec::Rom { name, base, data } => (
                    MemoryBlock::from_data(name, data, MemoryKind::Rom)?,
                    *base,
                    true,
                ),
            };

            let name = block.id().to_string();
            let id = bus
                .add_block(block)
                .ok_or_else(|| anyhow!("cannot add block [{}]", name))?;
            let mapped = if shadow {
                bus.overlay(id, 0, base, None, AccessMode::Read)
            } else {
                bus.allocate(id, base, None, AccessMode::ReadWrite)
            };
            if !mapped {
                bail!("cannot map block [{}] at {:#06X}", name, base);
            }
        }

        let mut ports = PortConnector::new(config.port_mode);
        let mut devices: Vec<Attached> = Vec::new();

        let fdc = match self.floppy_port {
            Some(base) => {
                let fdc = Rc::new(RefCell::new(FloppyController::new(config.clock_speed_hz)));
                if !FloppyController::connect(&fdc, &mut ports, base) {
                    bail!("cannot connect floppy controller at port {:#06X}", base);
                }
                let device: DeviceRef = fdc.clone();
                devices.push(Attached {
                    device,
                    realtime: false,
                });
                Some(fdc)
            }
            None => None,
        };

        for (device, realtime) in &self.devices {
            devices.push(Attached {
                device: device.clone(),
                realtime: *realtime,
            });
        }

        let mut cpu = Cpu::new(opcodes);
        cpu.reset(&bus);
        cpu.start();

        Ok(Computer {
            config,
            bus,
            ports,
            cpu,
            devices,
            fdc,
            ticks: 0,
        })
    }
}
