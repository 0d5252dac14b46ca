//! On-disk snapshot layout.
//!
//! A snapshot is a directory holding `snapshot.json` plus one raw binary
//! file per RAM or ROM block. Each component owns its section of the JSON
//! document and checks it against its own configuration on restore.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{error::SnapshotError, memory_block::MemoryKind};

pub const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputerInfo {
    pub id: String,
    /// Base RAM in KB.
    pub baseram: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub size: u32,
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub blocks: BTreeMap<String, BlockEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloppySnapshot {
    pub images: [Option<String>; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub computer: ComputerInfo,
    #[serde(default)]
    pub cpu: Option<serde_json::Value>,
    #[serde(default)]
    pub memory: Option<MemorySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floppy: Option<FloppySnapshot>,
}

impl Snapshot {
    pub fn save(&self, dir: &Path) -> Result<(), SnapshotError> {
        fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(SNAPSHOT_FILE), json)?;

        tracing::info!("[SNAPSHOT] Saved to {}", dir.display());
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, SnapshotError> {
        let path = dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Err(SnapshotError::Missing(path.display().to_string()));
        }

        let json = fs::read_to_string(&path)?;
        let snapshot: Snapshot = serde_json::from_str(&json)?;
        tracing::info!(
            "[SNAPSHOT] Loaded {} ({})",
            path.display(),
            snapshot.computer.id
        );
        Ok(snapshot)
    }

    pub fn cpu_section(&self) -> Result<&serde_json::Value, SnapshotError> {
        self.cpu
            .as_ref()
            .ok_or_else(|| SnapshotError::Missing("cpu section".to_string()))
    }

    pub fn memory_section(&self) -> Result<&MemorySnapshot, SnapshotError> {
        self.memory
            .as_ref()
            .ok_or_else(|| SnapshotError::Missing("memory section".to_string()))
    }
}
