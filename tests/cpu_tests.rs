mod common;

use std::{cell::Cell, rc::Rc};

use common::*;
use retrobus::{
    AccessMode, Architecture, Bus, Cpu, CpuFault, CpuState, IoBlock, IoConnector, MemoryBlock,
    MemoryKind, OpcodeTable, PortConnector, PortMode,
};

/// 1KB of RAM at 0 holding `program`, plus an IO page at 0xFC00 whose
/// reads are counted.
fn machine(program: &[u8]) -> (Bus, PortConnector, Rc<Cell<u32>>) {
    let mut bus = Bus::new(0x400).unwrap();
    assert!(bus.init(16));

    let ram = bus
        .add_block(MemoryBlock::new("ram", 0x400, MemoryKind::Ram).unwrap())
        .unwrap();
    assert!(bus.allocate(ram, 0, None, AccessMode::ReadWrite));
    assert!(bus.block_mut(ram).unwrap().fill(0, program));

    let reads = Rc::new(Cell::new(0));
    let mut conn = IoConnector::new("watch", 0);
    let r = reads.clone();
    assert!(conn.connect_read(
        0,
        Rc::new(move |_: u16| {
            r.set(r.get() + 1);
            0x00
        })
    ));
    let mut io = IoBlock::new(0x400);
    io.add_device(&conn, 0, 0);
    let watch = bus.add_block(MemoryBlock::io("watch", io)).unwrap();
    assert!(bus.allocate(watch, 0xFC00, None, AccessMode::Read));

    (bus, PortConnector::new(PortMode::ByteLow), reads)
}

#[test]
fn reset_stops_at_the_reset_vector() {
    let (bus, _, _) = machine(&[]);
    let mut cpu = Cpu::new(toy_opcodes());
    cpu.reset(&bus);

    assert_eq!(cpu.state(), CpuState::Stop);
    assert_eq!(cpu.pc(), 0);
    assert_eq!(cpu.total_ticks(), 0);
    assert_eq!(cpu.id(), "toy");
}

#[test]
fn stopped_cpu_does_not_execute() {
    let (mut bus, mut ports, _) = machine(&[MVI, 0x42]);
    let mut cpu = Cpu::new(toy_opcodes());
    cpu.reset(&bus);

    assert!(!cpu.step(&mut bus, &mut ports));
    assert_eq!(cpu.pc(), 0);
    assert_eq!(cpu.regs().a, 0);
    assert_eq!(cpu.instruction_ticks(), 0);
}

#[test]
fn instructions_report_their_ticks() {
    let program = [MVI, 0x99, STA, 0x00, 0x02, NOP, JMP, 0x00, 0x01];
    let (mut bus, mut ports, _) = machine(&program);
    let mut cpu = Cpu::new(toy_opcodes());
    cpu.reset(&bus);
    cpu.start();

    let mut ticks = Vec::new();
    for _ in 0..4 {
        assert!(cpu.step(&mut bus, &mut ports));
        ticks.push(cpu.instruction_ticks());
    }

    assert_eq!(ticks, vec![7, 13, 4, 10]);
    assert_eq!(cpu.total_ticks(), 34);
    assert_eq!(bus.read8(0x0200), 0x99);
    assert_eq!(cpu.pc(), 0x0100);
    assert_eq!(cpu.last_address(), 6);
}

#[test]
fn failing_handler_stops_the_cpu_for_good() {
    // LDA from the watch page after the fault would show up as a read.
    let (mut bus, mut ports, reads) = machine(&[NOP, BAD, LDA, 0x00, 0xFC]);
    let mut cpu = Cpu::new(toy_opcodes());
    cpu.reset(&bus);
    cpu.start();

    assert!(cpu.step(&mut bus, &mut ports));
    assert!(!cpu.step(&mut bus, &mut ports));
    assert_eq!(cpu.state(), CpuState::Stop);
    assert!(matches!(
        cpu.fault(),
        Some(CpuFault::Execution { address: 1, .. })
    ));

    let pc = cpu.pc();
    for _ in 0..3 {
        assert!(!cpu.step(&mut bus, &mut ports));
    }
    assert_eq!(cpu.pc(), pc);
    assert_eq!(reads.get(), 0);
}

#[test]
fn unassigned_opcode_stops_the_cpu() {
    let (mut bus, mut ports, _) = machine(&[0xED]);
    let mut cpu = Cpu::new(toy_opcodes());
    cpu.reset(&bus);
    cpu.start();

    assert!(!cpu.step(&mut bus, &mut ports));
    assert!(matches!(
        cpu.fault(),
        Some(CpuFault::UnknownOpcode {
            opcode: 0xED,
            address: 0
        })
    ));

    cpu.reset(&bus);
    assert!(cpu.fault().is_none());
}

#[test]
fn run_returns_when_the_program_halts() {
    let (mut bus, mut ports, reads) = machine(&[LDA, 0x00, 0xFC, NOP, NOP, HLT]);
    let mut cpu = Cpu::new(toy_opcodes());
    cpu.reset(&bus);

    cpu.run(&mut bus, &mut ports);
    assert_eq!(cpu.state(), CpuState::Halt);
    assert_eq!(reads.get(), 1);
    assert_eq!(cpu.total_ticks(), 13 + 4 + 4 + 7);

    assert!(cpu.step(&mut bus, &mut ports));
    assert_eq!(cpu.instruction_ticks(), Toy::HALT_TICKS);
    assert_eq!(cpu.pc(), 6);
}

#[test]
fn ports_are_reachable_from_handlers() {
    let seen = Rc::new(Cell::new(0u8));
    let (mut bus, mut ports, _) = machine(&[MVI, 0x5A, OUT, 0x10, IN, 0x11, HLT]);
    let s = seen.clone();
    assert!(ports.connect_output(0x10, Rc::new(move |_: u16, v: u8| s.set(v)), false));
    assert!(ports.connect_input(0x11, Rc::new(|_: u16| 0xC4), false));

    let mut cpu = Cpu::new(toy_opcodes());
    cpu.reset(&bus);
    cpu.run(&mut bus, &mut ports);

    assert_eq!(seen.get(), 0x5A);
    assert_eq!(cpu.regs().a, 0xC4);
}

#[test]
fn snapshot_checks_the_architecture() {
    let (mut bus, mut ports, _) = machine(&[MVI, 0x33, HLT]);
    let mut cpu = Cpu::new(toy_opcodes());
    cpu.reset(&bus);
    cpu.run(&mut bus, &mut ports);

    let saved = cpu.serialize().unwrap();
    assert_eq!(saved["id"], "toy");
    assert_eq!(saved["state"], "HALT");

    let mut other = Cpu::new(toy_opcodes());
    other.reset(&bus);
    other.deserialize(&saved).unwrap();
    assert_eq!(other.regs().a, 0x33);
    assert_eq!(other.pc(), 3);
    assert_eq!(other.state(), CpuState::Halt);

    let mut foreign = saved.clone();
    foreign["id"] = "z80".into();
    let err = other.deserialize(&foreign).unwrap_err();
    assert!(err.is_compat());

    let empty = OpcodeTable::<Toy>::new();
    assert!(!empty.is_assigned(NOP));
}
