mod common;

use std::{cell::Cell, rc::Rc};

use retrobus::{
    bus::UNMAPPED_READ, AccessMode, Bus, IoBlock, IoConnector, MemoryBlock, MemoryKind,
};

fn bus(granularity: u32, bits: u32) -> Bus {
    let mut bus = Bus::new(granularity).unwrap();
    assert!(bus.init(bits));
    bus
}

fn ram(bus: &mut Bus, name: &str, size: u32) -> retrobus::BlockId {
    bus.add_block(MemoryBlock::new(name, size, MemoryKind::Ram).unwrap())
        .unwrap()
}

#[test]
fn aligned_allocations_read_back_the_fill_byte() {
    for (granularity, base) in [(0x100, 0x0000), (0x400, 0x8000), (0x4000, 0xC000), (8, 0x0008)] {
        let mut bus = bus(granularity, 16);
        let id = ram(&mut bus, "ram", granularity);
        assert!(bus.allocate(id, base, None, AccessMode::ReadWrite));

        bus.clear(0xA5);
        for offset in 0..granularity {
            assert_eq!(bus.read8(base + offset), 0xA5);
        }
    }
}

#[test]
fn read_and_write_mappings_are_independent() {
    let mut bus = bus(0x400, 16);
    let low = ram(&mut bus, "low", 0x400);
    let high = ram(&mut bus, "high", 0x400);
    let other = ram(&mut bus, "other", 0x400);

    assert!(bus.allocate(low, 0, None, AccessMode::Read));
    // Same direction collides, the opposite direction is free.
    assert!(!bus.allocate(other, 0, None, AccessMode::Read));
    assert!(!bus.allocate(other, 0, None, AccessMode::ReadWrite));
    assert!(bus.allocate(high, 0, None, AccessMode::Write));

    bus.write8(0x10, 0x77);
    assert_eq!(bus.block(high).unwrap().read(0x10), 0x77);
    assert_eq!(bus.block(low).unwrap().read(0x10), 0x00);
    assert_eq!(bus.read8(0x10), 0x00);
}

#[test]
fn failed_allocation_changes_nothing() {
    let mut bus = bus(0x400, 16);
    let small = ram(&mut bus, "small", 0x400);
    let big = ram(&mut bus, "big", 0x1000);

    assert!(bus.allocate(small, 0x0C00, None, AccessMode::ReadWrite));
    // Covers 0x0000..0x1000, colliding only in its last slot.
    assert!(!bus.allocate(big, 0, None, AccessMode::ReadWrite));
    assert!(bus.read_mapping(0x0000).is_none());
    assert_eq!(bus.read_mapping(0x0C00).map(|(id, _)| id), Some(small));
}

#[test]
fn misaligned_or_out_of_range_requests_fail() {
    let mut bus = bus(0x400, 16);
    let id = ram(&mut bus, "ram", 0x800);

    assert!(!bus.allocate(id, 0x200, None, AccessMode::ReadWrite));
    assert!(!bus.allocate(id, 0, Some(0x300), AccessMode::ReadWrite));
    assert!(!bus.allocate(id, 0xFC00, None, AccessMode::ReadWrite));
    assert!(!bus.allocate(id, 0, Some(0x1000), AccessMode::ReadWrite));
    assert!(bus.allocate(id, 0xF800, None, AccessMode::ReadWrite));
}

#[test]
fn rom_overlay_shadows_ram_until_restored() {
    let mut bus = bus(0x400, 16);
    let ram_id = ram(&mut bus, "ram", 0x4000);
    let rom_id = bus
        .add_block(MemoryBlock::from_data("bios", &[0xC3; 0x400], MemoryKind::Rom).unwrap())
        .unwrap();

    assert!(bus.allocate(ram_id, 0, None, AccessMode::ReadWrite));
    assert!(!bus.allocate(rom_id, 0, None, AccessMode::Read));
    assert!(bus.overlay(rom_id, 0, 0, None, AccessMode::Read));

    bus.write8(0x0005, 0x12);
    assert_eq!(bus.read8(0x0005), 0xC3);
    assert_eq!(bus.block(ram_id).unwrap().read(5), 0x12);

    assert!(bus.restore(0, 0x400, AccessMode::Read));
    assert_eq!(bus.read8(0x0005), 0x12);
    assert!(!bus.restore(0, 0x400, AccessMode::ReadWrite));
}

#[test]
fn rom_ignores_writes_through_the_bus() {
    let mut bus = bus(0x100, 16);
    let rom = bus
        .add_block(MemoryBlock::from_data("rom", &[1, 2, 3, 4], MemoryKind::Rom).unwrap())
        .unwrap();
    assert_eq!(bus.block(rom).unwrap().size(), 0x100);
    assert!(bus.allocate(rom, 0x100, None, AccessMode::ReadWrite));

    bus.write8(0x101, 0xEE);
    assert_eq!(bus.read8(0x101), 2);
}

#[test]
fn bank_switching_with_block_offsets() {
    let mut bus = bus(0x4000, 16);
    let banks = ram(&mut bus, "banks", 0x10000);
    bus.block_mut(banks).unwrap().fill(0x4000, &[0xB1]);
    bus.block_mut(banks).unwrap().fill(0xC000, &[0xB3]);

    assert!(bus.allocate_offset(banks, 0x4000, 0x8000, Some(0x4000), AccessMode::ReadWrite));
    assert_eq!(bus.read8(0x8000), 0xB1);

    assert!(!bus.allocate_offset(banks, 0xC000, 0x8000, Some(0x4000), AccessMode::ReadWrite));
    assert!(bus.overlay(banks, 0xC000, 0x8000, Some(0x4000), AccessMode::ReadWrite));
    assert_eq!(bus.read8(0x8000), 0xB3);
    assert_eq!(bus.read_mapping(0x8001).map(|(_, offset)| offset), Some(0xC001));
}

#[test]
fn map_window_aliases_an_address_range() {
    let mut bus = bus(0x400, 16);
    let id = ram(&mut bus, "ram", 0x400);
    assert!(bus.allocate(id, 0, None, AccessMode::ReadWrite));
    assert!(bus.map_window(0, 0x8000, 0x400));

    bus.write8(0x8010, 0x5A);
    assert_eq!(bus.read8(0x0010), 0x5A);
    assert_eq!(bus.read_mapping(0x8010), Some((id, 0x10)));
}

#[test]
fn free_unmaps_the_block() {
    let mut bus = bus(0x400, 16);
    let id = ram(&mut bus, "ram", 0x400);
    assert!(bus.allocate(id, 0, None, AccessMode::ReadWrite));
    assert!(bus.map_window(0, 0x400, 0x400));

    let block = bus.free(id).unwrap();
    assert_eq!(block.id(), "ram");
    assert_eq!(bus.read8(0x0000), UNMAPPED_READ);
    assert_eq!(bus.read8(0x0400), UNMAPPED_READ);
    assert!(bus.find_block("ram").is_none());
    assert!(bus.free(id).is_none());
}

#[test]
fn unmapped_access_is_harmless() {
    let mut bus = bus(0x400, 16);
    bus.write8(0x1234, 0x99);
    assert_eq!(bus.read8(0x1234), UNMAPPED_READ);
    assert_eq!(bus.read16(0x1234), 0x5555);
}

#[test]
fn sixteen_bit_access_in_both_byte_orders() {
    let mut bus = bus(0x400, 16);
    let id = ram(&mut bus, "ram", 0x400);
    assert!(bus.allocate(id, 0, None, AccessMode::ReadWrite));

    bus.write16(0x10, 0x1234);
    assert_eq!(bus.read8(0x10), 0x34);
    assert_eq!(bus.read8(0x11), 0x12);
    assert_eq!(bus.read16_be(0x10), 0x3412);

    bus.write16_be(0x20, 0xABCD);
    assert_eq!(bus.read8(0x20), 0xAB);
    assert_eq!(bus.read16(0x20), 0xCDAB);
}

#[test]
fn io_block_dispatches_to_device_handlers() {
    let latch = Rc::new(Cell::new(0u8));
    let mut conn = IoConnector::new("latch", 0x01);
    let l = latch.clone();
    assert!(conn.connect_read(0, Rc::new(move |_: u16| l.get())));
    let l = latch.clone();
    assert!(conn.connect_write(0, Rc::new(move |_: u16, v: u8| l.set(v)), false));
    assert!(conn.connect_read(1, Rc::new(|_: u16| 0x42)));

    let mut io = IoBlock::new(0x100);
    // Device decoded at every offset with bit 7 set.
    assert_eq!(io.add_device(&conn, 0x80, 0x80), 0x80);

    let mut bus = bus(0x100, 16);
    let id = bus.add_block(MemoryBlock::io("io", io)).unwrap();
    assert!(bus.allocate(id, 0xFF00, None, AccessMode::ReadWrite));

    bus.write8(0xFF80, 0x3C);
    assert_eq!(latch.get(), 0x3C);
    assert_eq!(bus.read8(0xFFFE), 0x3C);
    assert_eq!(bus.read8(0xFF81), 0x42);
    assert_eq!(bus.read8(0xFF10), 0xFF);
}

#[test]
fn binary_loading_and_dump() {
    let dir = common::temp_dir("bus-load");
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join("prog.bin");
    std::fs::write(&file, [0x3E, 0x01, 0x76]).unwrap();

    let mut bus = bus(0x400, 16);
    let id = ram(&mut bus, "ram", 0x800);
    assert!(bus.allocate(id, 0, None, AccessMode::ReadWrite));

    assert_eq!(bus.load_binary(&file, 0x0100).unwrap(), 3);
    assert_eq!(bus.read8(0x0102), 0x76);
    assert!(bus.load_binary(&file, 0x4000).is_err());

    let out = dir.join("dump.bin");
    bus.dump(0x0100, 4, &out).unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), vec![0x3E, 0x01, 0x76, 0x00]);

    std::fs::remove_dir_all(&dir).unwrap();
}
