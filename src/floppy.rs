use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::{
    dsk_image::DskImage,
    error::DiskError,
    geometry::{Geometry, SECTOR_SIZE},
};

/// A floppy image held in memory. Either fully loaded with a geometry that
/// matches its data, or empty.
#[derive(Debug, Clone, Default)]
pub struct FloppyDisk {
    loaded: bool,
    path: Option<PathBuf>,
    geometry: Geometry,
    data: Vec<u8>,
    write_protected: bool,
}

impl FloppyDisk {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Raw sector dump. The geometry is looked up from the data length.
    pub fn from_raw(data: Vec<u8>) -> Result<Self, DiskError> {
        let geometry =
            Geometry::from_image_size(data.len()).ok_or(DiskError::UnsupportedSize(data.len()))?;
        Ok(Self::with_geometry(geometry, data))
    }

    pub fn from_dsk(data: &[u8]) -> Result<Self, DiskError> {
        let (geometry, flat) = DskImage::parse(data)?.to_flat()?;
        Ok(Self::with_geometry(geometry, flat))
    }

    /// Sniffs the DSK signature and falls back to a raw image.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, DiskError> {
        if DskImage::is_dsk(&data) {
            Self::from_dsk(&data)
        } else {
            Self::from_raw(data)
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DiskError> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let mut disk = Self::from_bytes(data)?;
        disk.path = Some(path.to_path_buf());

        tracing::info!(
            "[DSK] Loaded {}: {}",
            path.display(),
            disk.geometry
        );
        Ok(disk)
    }

    fn with_geometry(geometry: Geometry, data: Vec<u8>) -> Self {
        Self {
            loaded: true,
            path: None,
            geometry,
            data,
            write_protected: false,
        }
    }

    /// Writes the flat sector data, whatever format the image came from.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DiskError> {
        if !self.loaded {
            return Err(DiskError::Format("no image to save".into()));
        }
        fs::write(path.as_ref(), &self.data)?;
        tracing::info!(
            "[DSK] Saved {} bytes to {}",
            self.data.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: Option<PathBuf>) {
        self.path = path;
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn set_write_protected(&mut self, protect: bool) {
        self.write_protected = protect;
    }

    pub fn sector(&self, c: u8, h: u8, s: u8) -> Option<&[u8]> {
        let offset = self.geometry.chs_to_offset(c, h, s)?;
        self.data.get(offset..offset + SECTOR_SIZE)
    }

    pub fn sector_mut(&mut self, c: u8, h: u8, s: u8) -> Option<&mut [u8]> {
        let offset = self.geometry.chs_to_offset(c, h, s)?;
        self.data.get_mut(offset..offset + SECTOR_SIZE)
    }
}

impl fmt::Display for FloppyDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.loaded {
            return write!(f, "(empty)");
        }
        match &self.path {
            Some(path) => write!(f, "{} [{}]", path.display(), self.geometry),
            None => write!(f, "(memory) [{}]", self.geometry),
        }
    }
}
