//! Sector images to flux.
//!
//! A DSK image records sectors, not flux. Each track is laid out with the
//! standard IBM format around the recorded ID fields, and the FDC status
//! bytes stored with each sector are turned back into the defects that
//! produced them (CRC errors, deleted marks, missing data fields).

use emu_core::Time;
use format_dsk::{DskError, DskImage, DskSector, sector_len};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::track::{Encoding, SectorSpec, build_ibm_track};
use crate::{DriveConfig, FluxDisk};

const ST1_DE: u8 = 0x20;
const ST1_MA: u8 = 0x01;
const ST2_CM: u8 = 0x40;
const ST2_DD: u8 = 0x20;
const ST2_MD: u8 = 0x01;

/// Largest data field laid down for one sector. Size codes above 6 are
/// used by protections and never fit a DD track.
const MAX_FIELD: usize = 0x1800;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Dsk(#[from] DskError),
    #[error("track {cylinder}/{side} needs {cells} cells, a revolution holds {capacity}")]
    TrackTooLong {
        cylinder: u8,
        side: u8,
        cells: usize,
        capacity: usize,
    },
    #[error("image has {image} cylinders, drive has {drive}")]
    TooManyCylinders { image: u8, drive: u8 },
}

/// Recording format used when laying tracks down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskFormat {
    pub encoding: Encoding,
    /// Data rate in bits per second.
    pub data_rate: u32,
}

impl DiskFormat {
    /// Double density MFM at 250 kbit/s.
    #[must_use]
    pub fn double_density() -> Self {
        Self {
            encoding: Encoding::Mfm,
            data_rate: 250_000,
        }
    }

    #[must_use]
    pub fn cell_ps(&self) -> u64 {
        Time::from_hz(self.encoding.cell_rate(self.data_rate)).as_ps()
    }
}

impl Default for DiskFormat {
    fn default() -> Self {
        Self::double_density()
    }
}

fn sector_spec(sector: &DskSector) -> SectorSpec<'_> {
    let len = sector_len(sector.n).min(MAX_FIELD).min(sector.data.len());
    let mut spec = SectorSpec::new([sector.c, sector.h, sector.r, sector.n], &sector.data[..len]);
    spec.deleted = sector.st2 & ST2_CM != 0;
    spec.data_crc_error = sector.st2 & ST2_DD != 0;
    spec.id_crc_error = sector.st1 & ST1_DE != 0 && !spec.data_crc_error;
    spec.no_data_field = sector.st1 & ST1_MA != 0 && sector.st2 & ST2_MD != 0;
    spec
}

impl FluxDisk {
    /// Lay a sector image down as flux for a drive.
    pub fn from_dsk(image: &DskImage, format: DiskFormat, drive: &DriveConfig) -> Result<Self, ImageError> {
        let cylinders = image.cylinders();
        if cylinders > drive.cylinders {
            return Err(ImageError::TooManyCylinders {
                image: cylinders,
                drive: drive.cylinders,
            });
        }
        let cell_ps = format.cell_ps();
        let capacity = usize::try_from(drive.revolution().as_ps() / cell_ps).unwrap_or(usize::MAX);
        let mut disk = Self::unformatted(drive.cylinders, image.sides.max(1));

        for track in &image.tracks {
            let specs: Vec<_> = track.sectors.iter().map(sector_spec).collect();
            let mut built = build_ibm_track(format.encoding, &specs, track.gap3);
            if built.len() > capacity {
                return Err(ImageError::TrackTooLong {
                    cylinder: track.cylinder,
                    side: track.side,
                    cells: built.len(),
                    capacity,
                });
            }
            built.fill_to(capacity);
            disk.set_track(track.cylinder, track.side, &built, cell_ps);
        }
        debug!(cylinders, sides = image.sides, "disk image laid down");
        Ok(disk)
    }

    /// Parse DSK bytes and lay them down.
    pub fn from_dsk_bytes(bytes: &[u8], format: DiskFormat, drive: &DriveConfig) -> Result<Self, ImageError> {
        let image = DskImage::from_bytes(bytes)?;
        Self::from_dsk(&image, format, drive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{Field, cells_from_flux, scan_fields};
    use format_dsk::DskTrack;

    fn nine_sector_image() -> DskImage {
        let mut image = DskImage::new(1);
        for c in 0..2 {
            let sectors = (1..=9).map(|r| DskSector::filled(c, 0, r, 2, r)).collect();
            image.tracks.push(DskTrack::new(c, 0, sectors));
        }
        image
    }

    fn fields(disk: &FluxDisk, c: u8) -> Vec<Field> {
        let cells = cells_from_flux(disk.track(c, 0), DiskFormat::default().cell_ps());
        scan_fields(&cells, Encoding::Mfm)
    }

    #[test]
    fn every_sector_lands_on_its_track() {
        let disk = FluxDisk::from_dsk(&nine_sector_image(), DiskFormat::default(), &DriveConfig::cpc_3())
            .expect("image fits");
        let found = fields(&disk, 1);
        assert_eq!(found.len(), 18, "ID and data field per sector");
        assert!(matches!(found[0], Field::Id { chrn: [1, 0, 1, 2], crc_ok: true, .. }));
        match &found[17] {
            Field::Data { data, crc_ok, .. } => {
                assert!(*crc_ok);
                assert_eq!(data, &vec![9u8; 512]);
            }
            other => panic!("expected data field, got {other:?}"),
        }
    }

    #[test]
    fn status_bytes_become_defects() {
        let mut image = nine_sector_image();
        let sector = image.sector_mut(0, 0, 2).expect("sector 2");
        sector.st1 = ST1_DE;
        sector.st2 = ST2_DD;
        let sector = image.sector_mut(0, 0, 3).expect("sector 3");
        sector.st2 = ST2_CM;
        let sector = image.sector_mut(0, 0, 4).expect("sector 4");
        sector.st1 = ST1_DE;

        let disk = FluxDisk::from_dsk(&image, DiskFormat::default(), &DriveConfig::cpc_3()).expect("image fits");
        let found = fields(&disk, 0);
        assert!(matches!(found[3], Field::Data { crc_ok: false, .. }), "data CRC error on R=2");
        assert!(matches!(found[5], Field::Data { deleted: true, crc_ok: true, .. }), "deleted mark on R=3");
        assert!(matches!(found[6], Field::Id { crc_ok: false, .. }), "ID CRC error on R=4");
    }

    #[test]
    fn oversized_track_is_rejected() {
        let mut image = DskImage::new(1);
        let sectors = (1..=12).map(|r| DskSector::filled(0, 0, r, 2, 0)).collect();
        image.tracks.push(DskTrack::new(0, 0, sectors));
        let err = FluxDisk::from_dsk(&image, DiskFormat::default(), &DriveConfig::cpc_3()).unwrap_err();
        assert!(matches!(err, ImageError::TrackTooLong { cylinder: 0, .. }), "got {err}");
    }

    #[test]
    fn bad_bytes_surface_the_dsk_error() {
        let err = FluxDisk::from_dsk_bytes(b"nope", DiskFormat::default(), &DriveConfig::cpc_3()).unwrap_err();
        assert!(matches!(err, ImageError::Dsk(DskError::TooShort(4))), "got {err}");
    }

    #[test]
    fn fm_format_uses_single_density_cells() {
        let format = DiskFormat {
            encoding: Encoding::Fm,
            data_rate: 125_000,
        };
        assert_eq!(format.cell_ps(), 8_000_000);
        assert_eq!(DiskFormat::default().cell_ps(), 2_000_000);
    }
}
