mod common;

use std::fs;

use retrobus::{
    snapshot::{Snapshot, SNAPSHOT_FILE},
    AccessMode, Bus, FloppyController, FloppyDisk, MemoryBlock, MemoryKind, SnapshotError,
};

fn bus_with(ram_size: u32, rom: &[u8]) -> Bus {
    let mut bus = Bus::new(0x400).unwrap();
    assert!(bus.init(16));

    let ram = bus
        .add_block(MemoryBlock::new("main", ram_size, MemoryKind::Ram).unwrap())
        .unwrap();
    assert!(bus.allocate(ram, 0x0000, None, AccessMode::ReadWrite));
    let rom = bus
        .add_block(MemoryBlock::from_data("bios", rom, MemoryKind::Rom).unwrap())
        .unwrap();
    assert!(bus.allocate(rom, 0xF000, None, AccessMode::Read));
    bus
}

#[test]
fn memory_round_trips_into_a_fresh_bus() {
    let dir = common::temp_dir("snap-roundtrip");
    fs::create_dir_all(&dir).unwrap();

    let mut bus = bus_with(0x4000, &[0xC3; 0x400]);
    for address in 0..0x100u32 {
        bus.write8(address, address as u8);
    }
    bus.write16(0x3FFE, 0xBEEF);

    let section = bus.serialize(&dir).unwrap();
    assert_eq!(section.blocks.len(), 2);
    assert_eq!(section.blocks["main"].kind, MemoryKind::Ram);
    assert_eq!(section.blocks["main"].size, 0x4000);
    assert!(dir.join("memory_main.bin").exists());
    assert!(dir.join("memory_bios.bin").exists());

    let mut fresh = bus_with(0x4000, &[0x00; 0x400]);
    fresh.deserialize(&section, &dir).unwrap();
    for address in 0..0x100u32 {
        assert_eq!(fresh.read8(address), address as u8);
    }
    assert_eq!(fresh.read16(0x3FFE), 0xBEEF);
    assert_eq!(fresh.read8(0xF000), 0xC3);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn layout_mismatch_is_incompatible_and_changes_nothing() {
    let dir = common::temp_dir("snap-compat");
    fs::create_dir_all(&dir).unwrap();

    let mut bus = bus_with(0x4000, &[0xC3; 0x400]);
    bus.write8(0x10, 0x99);
    let section = bus.serialize(&dir).unwrap();

    let mut smaller = bus_with(0x2000, &[0x00; 0x400]);
    smaller.write8(0x10, 0x11);
    let err = smaller.deserialize(&section, &dir).unwrap_err();
    assert!(err.is_compat(), "{}", err);
    assert_eq!(smaller.read8(0x10), 0x11);

    let mut other = Bus::new(0x400).unwrap();
    assert!(other.init(16));
    other
        .add_block(MemoryBlock::new("main", 0x4000, MemoryKind::Ram).unwrap())
        .unwrap();
    other
        .add_block(MemoryBlock::new("bios", 0x400, MemoryKind::Ram).unwrap())
        .unwrap();
    assert!(other.deserialize(&section, &dir).unwrap_err().is_compat());

    let mut renamed = Bus::new(0x400).unwrap();
    assert!(renamed.init(16));
    renamed
        .add_block(MemoryBlock::new("low", 0x4000, MemoryKind::Ram).unwrap())
        .unwrap();
    assert!(renamed.deserialize(&section, &dir).unwrap_err().is_compat());

    // A block the snapshot does not mention would keep stale contents.
    let mut extra = bus_with(0x4000, &[0x00; 0x400]);
    let id = extra
        .add_block(MemoryBlock::new("extra", 0x400, MemoryKind::Ram).unwrap())
        .unwrap();
    assert!(extra.allocate(id, 0x8000, None, AccessMode::ReadWrite));
    extra.write8(0x8000, 0x77);
    extra.write8(0x10, 0x11);
    assert!(extra.deserialize(&section, &dir).unwrap_err().is_compat());
    assert_eq!(extra.read8(0x8000), 0x77);
    assert_eq!(extra.read8(0x10), 0x11);

    // An IO entry cannot stand in for a RAM block of the same name.
    let mut as_io = section.clone();
    as_io.blocks.get_mut("main").unwrap().kind = MemoryKind::Io;
    let mut fresh = bus_with(0x4000, &[0x00; 0x400]);
    fresh.write8(0x10, 0x11);
    assert!(fresh.deserialize(&as_io, &dir).unwrap_err().is_compat());
    assert_eq!(fresh.read8(0x10), 0x11);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn missing_block_file_is_reported() {
    let dir = common::temp_dir("snap-missing");
    fs::create_dir_all(&dir).unwrap();

    let bus = bus_with(0x4000, &[0xC3; 0x400]);
    let section = bus.serialize(&dir).unwrap();
    fs::remove_file(dir.join("memory_main.bin")).unwrap();

    let mut fresh = bus_with(0x4000, &[0x00; 0x400]);
    assert!(matches!(
        fresh.deserialize(&section, &dir),
        Err(SnapshotError::Missing(_))
    ));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn snapshot_document_survives_disk() {
    let dir = common::temp_dir("snap-document");
    assert!(matches!(Snapshot::load(&dir), Err(SnapshotError::Missing(_))));

    fs::create_dir_all(&dir).unwrap();
    let bus = bus_with(0x4000, &[0xC3; 0x400]);
    let snapshot = Snapshot {
        computer: retrobus::snapshot::ComputerInfo {
            id: "test".to_string(),
            baseram: 16,
        },
        cpu: Some(serde_json::json!({ "id": "toy" })),
        memory: Some(bus.serialize(&dir).unwrap()),
        floppy: None,
    };
    snapshot.save(&dir).unwrap();
    assert!(dir.join(SNAPSHOT_FILE).exists());

    let loaded = Snapshot::load(&dir).unwrap();
    assert_eq!(loaded, snapshot);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.join(SNAPSHOT_FILE)).unwrap()).unwrap();
    assert_eq!(json["computer"]["baseram"], 16);
    assert_eq!(json["memory"]["blocks"]["bios"]["type"], "ROM");

    fs::write(dir.join(SNAPSHOT_FILE), "{ not json").unwrap();
    assert!(matches!(Snapshot::load(&dir), Err(SnapshotError::Json(_))));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn floppy_images_are_reloaded_by_path() {
    let dir = common::temp_dir("snap-floppy");
    fs::create_dir_all(&dir).unwrap();
    let image = dir.join("boot.img");
    fs::write(&image, vec![0xE5u8; 368_640]).unwrap();

    let mut fdc = FloppyController::new(1_000_000);
    fdc.load_disk_image(0, &image).unwrap();
    fdc.insert_disk(1, FloppyDisk::from_raw(vec![0u8; 163_840]).unwrap())
        .unwrap();

    let section = fdc.serialize();
    assert_eq!(section.images[0].as_deref(), Some(image.to_str().unwrap()));
    assert_eq!(section.images[1], None);

    let mut restored = FloppyController::new(1_000_000);
    restored.insert_disk(2, FloppyDisk::from_raw(vec![0u8; 163_840]).unwrap())
        .unwrap();
    restored.deserialize(&section).unwrap();
    assert!(restored.image_info(0).unwrap().is_loaded());
    assert_eq!(restored.image_info(0).unwrap().geometry().name, "360KB");
    assert!(!restored.image_info(2).unwrap().is_loaded());

    // A vanished image leaves the drive empty instead of failing.
    fs::remove_file(&image).unwrap();
    let mut missing = FloppyController::new(1_000_000);
    missing.deserialize(&section).unwrap();
    assert!(!missing.image_info(0).unwrap().is_loaded());

    fs::remove_dir_all(&dir).unwrap();
}
