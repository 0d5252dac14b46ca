#![allow(dead_code)]

use std::path::PathBuf;

use anyhow::bail;
use retrobus::{Architecture, Bus, OpcodeTable};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToyRegs {
    pub a: u8,
}

/// A tiny 8080-flavoured instruction set, enough to drive the core.
pub struct Toy;

impl Architecture for Toy {
    type Registers = ToyRegs;
    const ID: &'static str = "toy";
    const ADDRESS_BITS: u32 = 16;
    const HALT_TICKS: u32 = 4;

    fn reset_vector(_bus: &Bus) -> u32 {
        0
    }
}

pub const NOP: u8 = 0x00;
pub const STA: u8 = 0x32;
pub const LDA: u8 = 0x3A;
pub const MVI: u8 = 0x3E;
pub const HLT: u8 = 0x76;
pub const JMP: u8 = 0xC3;
pub const OUT: u8 = 0xD3;
pub const IN: u8 = 0xDB;
pub const BAD: u8 = 0xFD;

pub fn toy_opcodes() -> OpcodeTable<Toy> {
    OpcodeTable::<Toy>::new()
        .with(NOP, |ctx| {
            ctx.tick(4);
            Ok(())
        })
        .with(MVI, |ctx| {
            ctx.regs.a = ctx.fetch8();
            ctx.tick(7);
            Ok(())
        })
        .with(STA, |ctx| {
            let address = ctx.fetch16() as u32;
            ctx.bus.write8(address, ctx.regs.a);
            ctx.tick(13);
            Ok(())
        })
        .with(LDA, |ctx| {
            let address = ctx.fetch16() as u32;
            ctx.regs.a = ctx.bus.read8(address);
            ctx.tick(13);
            Ok(())
        })
        .with(JMP, |ctx| {
            let address = ctx.fetch16() as u32;
            ctx.set_pc(address);
            ctx.tick(10);
            Ok(())
        })
        .with(OUT, |ctx| {
            let port = ctx.fetch8() as u16;
            ctx.ports.out_port(port, ctx.regs.a);
            ctx.tick(10);
            Ok(())
        })
        .with(IN, |ctx| {
            let port = ctx.fetch8() as u16;
            ctx.regs.a = ctx.ports.in_port(port);
            ctx.tick(10);
            Ok(())
        })
        .with(HLT, |ctx| {
            ctx.tick(7);
            ctx.halt();
            Ok(())
        })
        .with(BAD, |ctx| bail!("opcode {:#04X} always fails", ctx.opcode()))
}

/// A fresh directory under the system temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("retrobus-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[ctor::ctor]
fn init() {
    let fmt_subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(fmt_subscriber);
}
