//! CPC DSK and Extended DSK disk images.
//!
//! A DSK file stores a disk at sector level: per track, the list of ID
//! fields (C, H, R, N) with their FDC status bytes, followed by sector
//! data. The standard variant has one track size for the whole image; the
//! extended variant has a per-track size table and per-sector data lengths.
//!
//! This crate only deals with the container. Turning sectors into flux is
//! the drive model's job.

use thiserror::Error;

const STANDARD_SIGNATURE: &[u8] = b"MV - CPCEMU Disk-File\r\nDisk-Info\r\n";
const EXTENDED_SIGNATURE: &[u8] = b"EXTENDED CPC DSK File\r\nDisk-Info\r\n";
const TRACK_SIGNATURE: &[u8] = b"Track-Info\r\n";

const DISK_INFO_LEN: usize = 0x100;
const TRACK_INFO_LEN: usize = 0x100;
const SECTOR_INFO_BASE: usize = 0x18;
const MAX_SECTORS: usize = (TRACK_INFO_LEN - SECTOR_INFO_BASE) / 8;

/// Default GAP#3 length written into track headers.
pub const DEFAULT_GAP3: u8 = 0x4E;
/// Default format filler byte.
pub const DEFAULT_FILLER: u8 = 0xE5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DskError {
    #[error("image too short: {0} bytes")]
    TooShort(usize),
    #[error("unrecognised disk signature")]
    BadSignature,
    #[error("track block {index} at offset {offset:#x} is missing its Track-Info header")]
    BadTrackHeader { index: usize, offset: usize },
    #[error("track {cylinder}/{side} has {count} sectors, at most 29 fit in a track header")]
    TooManySectors { cylinder: u8, side: u8, count: usize },
}

/// One sector: its ID field, the status the original controller reported
/// for it, and its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DskSector {
    pub c: u8,
    pub h: u8,
    pub r: u8,
    /// Size code, 128 << N bytes.
    pub n: u8,
    pub st1: u8,
    pub st2: u8,
    pub data: Vec<u8>,
}

impl DskSector {
    /// A clean sector with data sized from `n`, filled with `fill`.
    #[must_use]
    pub fn filled(c: u8, h: u8, r: u8, n: u8, fill: u8) -> Self {
        Self {
            c,
            h,
            r,
            n,
            st1: 0,
            st2: 0,
            data: vec![fill; sector_len(n)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DskTrack {
    pub cylinder: u8,
    pub side: u8,
    /// Track-wide size code (standard images size every sector from it).
    pub size_code: u8,
    pub gap3: u8,
    pub filler: u8,
    pub sectors: Vec<DskSector>,
}

impl DskTrack {
    #[must_use]
    pub fn new(cylinder: u8, side: u8, sectors: Vec<DskSector>) -> Self {
        Self {
            cylinder,
            side,
            size_code: sectors.first().map_or(2, |s| s.n),
            gap3: DEFAULT_GAP3,
            filler: DEFAULT_FILLER,
            sectors,
        }
    }
}

/// A whole disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DskImage {
    pub sides: u8,
    pub extended: bool,
    pub tracks: Vec<DskTrack>,
}

/// Bytes in a sector of size code `n`, as the controller computes it.
#[must_use]
pub fn sector_len(n: u8) -> usize {
    if n > 7 { 16384 } else { 128 << n }
}

impl DskImage {
    #[must_use]
    pub fn new(sides: u8) -> Self {
        Self {
            sides,
            extended: true,
            tracks: Vec::new(),
        }
    }

    /// Parse a standard or extended image.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DskError> {
        if data.len() < DISK_INFO_LEN {
            return Err(DskError::TooShort(data.len()));
        }
        let extended = if data.starts_with(EXTENDED_SIGNATURE) {
            true
        } else if data.starts_with(STANDARD_SIGNATURE) {
            false
        } else {
            return Err(DskError::BadSignature);
        };

        let cylinders = usize::from(data[0x30]);
        let sides = data[0x31];
        let blocks = cylinders * usize::from(sides);

        // Each entry is the byte length of that track block; 0 = unformatted.
        let block_sizes: Vec<usize> = if extended {
            (0..blocks)
                .map(|i| data.get(0x34 + i).map_or(0, |&b| usize::from(b) * 256))
                .collect()
        } else {
            let size = usize::from(u16::from_le_bytes([data[0x32], data[0x33]]));
            vec![size; blocks]
        };

        let mut tracks = Vec::new();
        let mut offset = DISK_INFO_LEN;
        for (index, size) in block_sizes.into_iter().enumerate() {
            if size == 0 {
                continue;
            }
            // A truncated image keeps whatever complete track headers it has.
            let Some(block) = data.get(offset..) else { break };
            if block.len() < TRACK_INFO_LEN {
                break;
            }
            if !block.starts_with(TRACK_SIGNATURE) {
                return Err(DskError::BadTrackHeader { index, offset });
            }
            let end = block.len().min(size);
            tracks.push(parse_track(&block[..end], extended));
            offset += size;
        }

        Ok(Self {
            sides,
            extended,
            tracks,
        })
    }

    #[must_use]
    pub fn track(&self, cylinder: u8, side: u8) -> Option<&DskTrack> {
        self.tracks
            .iter()
            .find(|t| t.cylinder == cylinder && t.side == side)
    }

    /// Sector by physical position and ID record number.
    #[must_use]
    pub fn sector(&self, cylinder: u8, side: u8, r: u8) -> Option<&DskSector> {
        self.track(cylinder, side)?.sectors.iter().find(|s| s.r == r)
    }

    pub fn sector_mut(&mut self, cylinder: u8, side: u8, r: u8) -> Option<&mut DskSector> {
        self.tracks
            .iter_mut()
            .find(|t| t.cylinder == cylinder && t.side == side)?
            .sectors
            .iter_mut()
            .find(|s| s.r == r)
    }

    /// Highest cylinder number plus one.
    #[must_use]
    pub fn cylinders(&self) -> u8 {
        self.tracks
            .iter()
            .map(|t| t.cylinder.saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    /// Serialise. Extended images keep per-sector lengths; standard images
    /// pad every track block to the largest one.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DskError> {
        let cylinders = usize::from(self.cylinders());
        let sides = usize::from(self.sides.max(1));
        let mut blocks: Vec<Option<Vec<u8>>> = vec![None; cylinders * sides];
        for track in &self.tracks {
            let slot = usize::from(track.cylinder) * sides + usize::from(track.side);
            if let Some(entry) = blocks.get_mut(slot) {
                *entry = Some(write_track(track)?);
            }
        }

        let mut header = vec![0u8; DISK_INFO_LEN];
        let signature = if self.extended {
            EXTENDED_SIGNATURE
        } else {
            STANDARD_SIGNATURE
        };
        header[..signature.len()].copy_from_slice(signature);
        header[0x30] = cylinders as u8;
        header[0x31] = sides as u8;

        let mut out = header;
        if self.extended {
            for (i, block) in blocks.iter().enumerate() {
                if let (Some(block), Some(entry)) = (block, out.get_mut(0x34 + i)) {
                    *entry = (block.len() / 256) as u8;
                }
            }
            for block in blocks.into_iter().flatten() {
                out.extend_from_slice(&block);
            }
        } else {
            let size = blocks.iter().flatten().map(Vec::len).max().unwrap_or(0);
            out[0x32..0x34].copy_from_slice(&(size as u16).to_le_bytes());
            for block in blocks {
                let mut block = block.unwrap_or_default();
                block.resize(size, 0);
                out.extend_from_slice(&block);
            }
        }
        Ok(out)
    }
}

fn parse_track(block: &[u8], extended: bool) -> DskTrack {
    let size_code = block[0x14];
    let count = usize::from(block[0x15]).min(MAX_SECTORS);
    let mut sectors = Vec::with_capacity(count);
    let mut data_at = TRACK_INFO_LEN;

    for info in block[SECTOR_INFO_BASE..SECTOR_INFO_BASE + count * 8].chunks_exact(8) {
        let len = if extended {
            usize::from(u16::from_le_bytes([info[6], info[7]]))
        } else {
            sector_len(size_code)
        };
        // Missing bytes at the end of a short block read back as zero.
        let mut data = vec![0u8; len];
        if let Some(avail) = block.get(data_at..) {
            let n = avail.len().min(len);
            data[..n].copy_from_slice(&avail[..n]);
        }
        data_at += len;

        sectors.push(DskSector {
            c: info[0],
            h: info[1],
            r: info[2],
            n: info[3],
            st1: info[4],
            st2: info[5],
            data,
        });
    }

    DskTrack {
        cylinder: block[0x10],
        side: block[0x11],
        size_code,
        gap3: block[0x16],
        filler: block[0x17],
        sectors,
    }
}

fn write_track(track: &DskTrack) -> Result<Vec<u8>, DskError> {
    if track.sectors.len() > MAX_SECTORS {
        return Err(DskError::TooManySectors {
            cylinder: track.cylinder,
            side: track.side,
            count: track.sectors.len(),
        });
    }
    let mut buf = vec![0u8; TRACK_INFO_LEN];
    buf[..TRACK_SIGNATURE.len()].copy_from_slice(TRACK_SIGNATURE);
    buf[0x10] = track.cylinder;
    buf[0x11] = track.side;
    buf[0x14] = track.size_code;
    buf[0x15] = track.sectors.len() as u8;
    buf[0x16] = track.gap3;
    buf[0x17] = track.filler;

    for (sector, info) in track
        .sectors
        .iter()
        .zip(buf[SECTOR_INFO_BASE..].chunks_exact_mut(8))
    {
        info[..6].copy_from_slice(&[sector.c, sector.h, sector.r, sector.n, sector.st1, sector.st2]);
        info[6..].copy_from_slice(&(sector.data.len() as u16).to_le_bytes());
    }
    for sector in &track.sectors {
        buf.extend_from_slice(&sector.data);
    }
    buf.resize(buf.len().div_ceil(256) * 256, 0);
    Ok(buf)
}
