pub mod bus;
pub mod computer;
pub mod config;
pub mod cpu;
pub mod device;
pub mod dsk_image;
pub mod error;
pub mod fdc;
pub mod floppy;
pub mod geometry;
pub mod io_block;
pub mod logging;
pub mod memory_block;
pub mod port;
pub mod snapshot;

pub use bus::{AccessMode, BlockId, Bus};
pub use computer::{Computer, ComputerBuilder};
pub use config::ComputerConfig;
pub use cpu::{Architecture, Context, Cpu, CpuState, OpcodeTable};
pub use device::Device;
pub use error::{CpuFault, DiskError, FdcFault, SnapshotError};
pub use fdc::FloppyController;
pub use floppy::FloppyDisk;
pub use geometry::Geometry;
pub use io_block::{BitMask, IoBlock, IoConnector};
pub use memory_block::{MemoryBlock, MemoryKind};
pub use port::{PortConnector, PortMode};
