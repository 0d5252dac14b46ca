//! CPCEMU DSK and Extended DSK containers.
//!
//! Both variants start with a 256-byte Disk-Info block followed by one
//! Track-Info block per track and side. Sector ids inside a track may be in
//! any order and any size; [`DskImage::to_flat`] normalises them into the
//! plain 512-byte CHS layout the controller works with.

use crate::{
    error::DiskError,
    geometry::{Geometry, SECTOR_SIZE},
};

const STANDARD_SIGNATURE: &[u8] = b"MV - CPCEMU Disk-File\r\nDisk-Info\r\n";
const EXTENDED_SIGNATURE: &[u8] = b"EXTENDED CPC DSK File\r\nDisk-Info\r\n";

const DISK_INFO_SIZE: usize = 0x100;
const TRACK_INFO_SIZE: usize = 0x100;
const SECTOR_INFO_BASE: usize = 0x18;
const SECTOR_INFO_SIZE: usize = 8;

/// Filler used for sectors missing from the container.
const FORMAT_FILLER: u8 = 0xE5;

#[derive(Debug, Clone)]
pub struct DskSector {
    pub c: u8,
    pub h: u8,
    pub r: u8,
    pub n: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DskTrack {
    pub track: u8,
    pub side: u8,
    pub sectors: Vec<DskSector>,
}

#[derive(Debug, Clone)]
pub struct DskImage {
    pub extended: bool,
    pub tracks: u8,
    pub sides: u8,
    pub track_list: Vec<DskTrack>,
}

impl DskImage {
    pub fn is_dsk(data: &[u8]) -> bool {
        data.starts_with(STANDARD_SIGNATURE) || data.starts_with(EXTENDED_SIGNATURE)
    }

    pub fn parse(data: &[u8]) -> Result<Self, DiskError> {
        if data.len() < DISK_INFO_SIZE {
            return Err(DiskError::Format("DSK file shorter than its header".into()));
        }

        let extended = if data.starts_with(EXTENDED_SIGNATURE) {
            true
        } else if data.starts_with(STANDARD_SIGNATURE) {
            false
        } else {
            return Err(DiskError::Format("unrecognised DSK signature".into()));
        };

        let tracks = data[0x30];
        let sides = data[0x31];
        if tracks == 0 || sides == 0 || sides > 2 {
            return Err(DiskError::Format(format!(
                "bad DSK layout: {} tracks, {} sides",
                tracks, sides
            )));
        }

        let count = tracks as usize * sides as usize;
        let standard_size = u16::from_le_bytes([data[0x32], data[0x33]]) as usize;

        let mut track_list = Vec::with_capacity(count);
        let mut offset = DISK_INFO_SIZE;
        for i in 0..count {
            let size = if extended {
                data.get(0x34 + i).copied().unwrap_or(0) as usize * 256
            } else {
                standard_size
            };

            // Unformatted track in an extended image.
            if size == 0 {
                continue;
            }
            if offset + TRACK_INFO_SIZE > data.len() {
                tracing::warn!("[DSK] Image truncated after {} of {} tracks", i, count);
                break;
            }

            track_list.push(parse_track(&data[offset..], extended)?);
            offset += size;
        }

        tracing::debug!(
            "[DSK] Parsed {} image: {} tracks x {} sides",
            if extended { "extended" } else { "standard" },
            tracks,
            sides
        );

        Ok(Self {
            extended,
            tracks,
            sides,
            track_list,
        })
    }

    /// Flattens the container into a sector-ordered buffer. Cylinders come
    /// from the highest track number, sectors per track from the fullest
    /// track, and the first sector id from the lowest id on the disk.
    pub fn to_flat(&self) -> Result<(Geometry, Vec<u8>), DiskError> {
        let cylinders = self
            .track_list
            .iter()
            .map(|t| t.track as usize + 1)
            .max()
            .ok_or_else(|| DiskError::Format("DSK image has no tracks".into()))?;
        let sectors = self
            .track_list
            .iter()
            .map(|t| t.sectors.len())
            .max()
            .unwrap_or(0);
        let min_id = self
            .track_list
            .iter()
            .flat_map(|t| t.sectors.iter().map(|s| s.r))
            .min()
            .ok_or_else(|| DiskError::Format("DSK image has no sectors".into()))?;

        if cylinders > u8::MAX as usize || sectors > u8::MAX as usize || min_id == 0 {
            return Err(DiskError::Format(format!(
                "unsupported DSK layout: {} cylinders, {} sectors, first id {}",
                cylinders, sectors, min_id
            )));
        }

        let geometry = Geometry {
            name: if self.extended { "EDSK" } else { "DSK" },
            heads: self.sides,
            cylinders: cylinders as u8,
            sectors: sectors as u8,
            sector_offset: min_id - 1,
        };

        let mut flat = vec![FORMAT_FILLER; geometry.image_size()];
        for track in &self.track_list {
            for sector in &track.sectors {
                let Some(offset) = geometry.chs_to_offset(track.track, track.side, sector.r) else {
                    tracing::warn!(
                        "[DSK] Skipping sector {:#04X} on track {} side {}: outside geometry",
                        sector.r,
                        track.track,
                        track.side
                    );
                    continue;
                };

                if sector.data.len() != SECTOR_SIZE {
                    tracing::warn!(
                        "[DSK] Sector {:#04X} on track {} is {} bytes, normalised to {}",
                        sector.r,
                        track.track,
                        sector.data.len(),
                        SECTOR_SIZE
                    );
                }
                let len = sector.data.len().min(SECTOR_SIZE);
                flat[offset..offset + len].copy_from_slice(&sector.data[..len]);
            }
        }

        Ok((geometry, flat))
    }
}

fn parse_track(block: &[u8], extended: bool) -> Result<DskTrack, DiskError> {
    if !block.starts_with(b"Track-Info") {
        return Err(DiskError::Format("missing Track-Info block".into()));
    }

    let track = block[0x10];
    let side = block[0x11];
    let size_code = block[0x14];
    let count = block[0x15] as usize;

    let mut sectors = Vec::with_capacity(count);
    let mut data_offset = TRACK_INFO_SIZE;
    for i in 0..count {
        let info = SECTOR_INFO_BASE + i * SECTOR_INFO_SIZE;
        if info + SECTOR_INFO_SIZE > TRACK_INFO_SIZE {
            return Err(DiskError::Format(format!(
                "track {} lists {} sectors, more than the info block holds",
                track, count
            )));
        }

        let n = block[info + 3];
        let len = if extended {
            u16::from_le_bytes([block[info + 6], block[info + 7]]) as usize
        } else {
            128usize << size_code.min(6)
        };

        let Some(bytes) = block.get(data_offset..data_offset + len) else {
            return Err(DiskError::Format(format!(
                "track {} truncated in sector {} of {}",
                track,
                i + 1,
                count
            )));
        };
        let data = bytes.to_vec();
        data_offset += len;

        sectors.push(DskSector {
            c: block[info],
            h: block[info + 1],
            r: block[info + 2],
            n,
            data,
        });
    }

    Ok(DskTrack {
        track,
        side,
        sectors,
    })
}
