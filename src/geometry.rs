use std::{collections::HashMap, fmt};

use once_cell::sync::Lazy;

pub const SECTOR_SIZE: usize = 512;

/// Physical layout of a floppy image. Sectors are always 512 bytes and
/// numbered from `sector_offset + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub name: &'static str,
    pub heads: u8,
    pub cylinders: u8,
    pub sectors: u8,
    pub sector_offset: u8,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            name: "",
            heads: 0,
            cylinders: 0,
            sectors: 0,
            sector_offset: 0,
        }
    }
}

impl Geometry {
    pub const fn new(name: &'static str, heads: u8, cylinders: u8, sectors: u8) -> Self {
        Self {
            name,
            heads,
            cylinders,
            sectors,
            sector_offset: 0,
        }
    }

    pub fn image_size(&self) -> usize {
        SECTOR_SIZE * self.heads as usize * self.cylinders as usize * self.sectors as usize
    }

    pub fn first_sector(&self) -> u8 {
        self.sector_offset.wrapping_add(1)
    }

    pub fn last_sector(&self) -> u8 {
        self.sector_offset.wrapping_add(self.sectors)
    }

    /// Byte offset of sector (c, h, s) in the flat image, or `None` when the
    /// address is outside this geometry.
    pub fn chs_to_offset(&self, c: u8, h: u8, s: u8) -> Option<usize> {
        if c >= self.cylinders || h >= self.heads {
            return None;
        }
        if s < self.first_sector() || s > self.last_sector() {
            return None;
        }

        let index = (c as usize * self.heads as usize + h as usize) * self.sectors as usize
            + (s - self.sector_offset) as usize
            - 1;
        Some(SECTOR_SIZE * index)
    }

    /// Known raw image formats, looked up by file size.
    pub fn from_image_size(size: usize) -> Option<Geometry> {
        KNOWN_GEOMETRIES.get(&size).copied()
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} heads, {} cylinders, {} sectors)",
            self.name, self.heads, self.cylinders, self.sectors
        )
    }
}

static KNOWN_GEOMETRIES: Lazy<HashMap<usize, Geometry>> = Lazy::new(|| {
    [
        Geometry::new("160KB", 1, 40, 8),
        Geometry::new("180KB", 1, 40, 9),
        Geometry::new("200KB", 1, 40, 10),
        Geometry::new("320KB", 2, 40, 8),
        Geometry::new("360KB", 2, 40, 9),
        Geometry::new("400KB", 2, 40, 10),
        Geometry::new("1.2MB", 2, 80, 15),
        Geometry::new("720KB", 2, 80, 9),
        Geometry::new("1.44MB", 2, 80, 18),
    ]
    .into_iter()
    .map(|g| (g.image_size(), g))
    .collect()
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_sizes() {
        let g = Geometry::from_image_size(368_640).unwrap();
        assert_eq!(g.name, "360KB");
        assert_eq!((g.heads, g.cylinders, g.sectors), (2, 40, 9));

        assert_eq!(Geometry::from_image_size(1_474_560).unwrap().name, "1.44MB");
        assert!(Geometry::from_image_size(1000).is_none());
    }

    #[test]
    fn chs_offsets() {
        let g = Geometry::new("360KB", 2, 40, 9);
        assert_eq!(g.chs_to_offset(0, 0, 1), Some(0));
        assert_eq!(g.chs_to_offset(0, 0, 2), Some(512));
        assert_eq!(g.chs_to_offset(0, 1, 1), Some(9 * 512));
        assert_eq!(g.chs_to_offset(1, 0, 1), Some(18 * 512));
        assert_eq!(g.chs_to_offset(0, 0, 0), None);
        assert_eq!(g.chs_to_offset(0, 0, 10), None);
        assert_eq!(g.chs_to_offset(40, 0, 1), None);
        assert_eq!(g.chs_to_offset(0, 2, 1), None);
    }

    #[test]
    fn sector_offset_shifts_numbering() {
        let g = Geometry {
            sector_offset: 0xC0,
            ..Geometry::new("CPC data", 1, 40, 9)
        };
        assert_eq!(g.chs_to_offset(0, 0, 0xC1), Some(0));
        assert_eq!(g.chs_to_offset(0, 0, 0xC9), Some(8 * 512));
        assert_eq!(g.chs_to_offset(0, 0, 1), None);
    }
}
