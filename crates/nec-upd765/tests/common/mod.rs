//! Test bench: a PC-style controller wired to one flux-level drive, driven
//! by a host that polls MSR and moves data by PIO.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use drive_ibm_floppy::track::Encoding;
use drive_ibm_floppy::{DiskFormat, DriveConfig, FluxDisk, FluxDrive};
use emu_core::{Medium, Time};
use format_dsk::{DskImage, DskSector, DskTrack};
use nec_upd765::{Config, MSR_DIO, MSR_RQM, Phase, Upd765};

pub const REG_DOR: u8 = 2;
pub const REG_MSR: u8 = 4;
pub const REG_DATA: u8 = 5;
pub const REG_CCR: u8 = 7;

/// Host polling interval.
pub const HOST_STEP: Time = Time::from_micros(8);
/// Longest a single command may take.
pub const TIMEOUT: Time = Time::from_millis(2000);

pub struct Bench {
    pub fdc: Upd765,
    pub drive: Rc<RefCell<FluxDrive>>,
    pub now: Time,
    pub host_step: Time,
}

impl Bench {
    /// Controller out of reset, motor A on, 250 kbit/s, PIO mode.
    pub fn new(disk: FluxDisk) -> Self {
        Self::with_config(Config::pc_fdc_superio(), disk)
    }

    pub fn with_config(config: Config, disk: FluxDisk) -> Self {
        let mut drive = FluxDrive::new(DriveConfig::pc_35());
        drive.insert(disk);
        let drive = Rc::new(RefCell::new(drive));
        let mut fdc = Upd765::new(config);
        let medium: Rc<RefCell<dyn Medium>> = drive.clone();
        fdc.attach(0, medium, Time::ZERO);
        let mut bench = Self {
            fdc,
            drive,
            now: Time::from_micros(10),
            host_step: HOST_STEP,
        };
        bench.write_reg(REG_DOR, 0x1C);
        bench.write_reg(REG_CCR, 0x02);
        // SRT D (6 ms steps at 250 kbit/s), HUT/HLT minimal, non-DMA.
        bench.command(&[0x03, 0xDF, 0x03]);
        bench.wait(Time::from_millis(1));
        bench
    }

    pub fn wait(&mut self, span: Time) {
        self.now += span;
        self.fdc.run_until(self.now);
    }

    pub fn write_reg(&mut self, offset: u8, value: u8) {
        self.now += Time::from_micros(1);
        self.fdc.write_register(offset, value, self.now);
    }

    pub fn read_reg(&mut self, offset: u8) -> u8 {
        self.now += Time::from_micros(1);
        self.fdc.read_register(offset, self.now)
    }

    pub fn command(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_reg(REG_DATA, b);
        }
    }

    /// Wait for the result phase and read every result byte. The MSR reads
    /// acknowledge a data-completion interrupt.
    pub fn result(&mut self) -> Vec<u8> {
        let deadline = self.now + TIMEOUT;
        while self.fdc.phase() != Phase::Result {
            assert!(self.now < deadline, "no result phase");
            self.wait(self.host_step);
        }
        let mut out = Vec::new();
        while self.fdc.phase() == Phase::Result {
            // Hosts check RQM and DIO before every result byte.
            let msr = self.read_reg(REG_MSR);
            assert_eq!(msr & (MSR_RQM | MSR_DIO), MSR_RQM | MSR_DIO);
            out.push(self.read_reg(REG_DATA));
        }
        out
    }

    /// Move data from the controller until the result phase or `limit`
    /// bytes, whichever comes first.
    pub fn read_bytes(&mut self, limit: usize) -> Vec<u8> {
        let deadline = self.now + TIMEOUT;
        let mut data = Vec::new();
        while data.len() < limit && self.fdc.phase() == Phase::Execution {
            assert!(self.now < deadline, "read stalled after {} bytes", data.len());
            let msr = self.read_reg(REG_MSR);
            if msr & (MSR_RQM | MSR_DIO) == MSR_RQM | MSR_DIO {
                data.push(self.read_reg(REG_DATA));
            } else {
                self.wait(self.host_step);
            }
        }
        data
    }

    /// Feed bytes to the controller while it asks for them.
    pub fn write_bytes(&mut self, data: &[u8]) {
        let deadline = self.now + TIMEOUT;
        let mut pending = data.iter();
        let mut next = pending.next();
        while let Some(&byte) = next {
            assert!(self.now < deadline, "write stalled");
            if self.fdc.phase() != Phase::Execution {
                break;
            }
            let msr = self.read_reg(REG_MSR);
            if msr & (MSR_RQM | MSR_DIO) == MSR_RQM {
                self.write_reg(REG_DATA, byte);
                next = pending.next();
            } else {
                self.wait(self.host_step);
            }
        }
    }

    pub fn pulse_tc(&mut self) {
        self.now += Time::from_micros(1);
        self.fdc.set_tc(true, self.now);
        self.now += Time::from_micros(1);
        self.fdc.set_tc(false, self.now);
    }

    pub fn sense_interrupt(&mut self) -> Vec<u8> {
        self.command(&[0x08]);
        self.result()
    }

    /// Cells of a track as currently recorded.
    pub fn track_cells(&self, cylinder: u8, head: u8) -> Vec<bool> {
        self.drive.borrow().track_cells(cylinder, head, Encoding::Mfm, 250_000)
    }
}

/// Byte `i` of the test pattern for sector `r`.
pub fn pattern(r: u8, i: usize) -> u8 {
    (i as u8).wrapping_mul(7) ^ r
}

/// Contents of sector `r` on cylinder `c` of [`dsk_image`].
pub fn expected_sector(c: u8, r: u8) -> Vec<u8> {
    (0..512).map(|i| pattern(r, i) ^ c).collect()
}

/// Single-sided MFM image, `cylinders` × 9 sectors of 512 bytes carrying
/// [`pattern`] data.
pub fn dsk_image(cylinders: u8) -> DskImage {
    let mut image = DskImage::new(1);
    for c in 0..cylinders {
        let sectors = (1..=9)
            .map(|r| {
                let mut sector = DskSector::filled(c, 0, r, 2, 0);
                for (i, b) in sector.data.iter_mut().enumerate() {
                    *b = pattern(r, i) ^ c;
                }
                sector
            })
            .collect();
        image.tracks.push(DskTrack::new(c, 0, sectors));
    }
    image
}

pub fn mfm_disk(cylinders: u8) -> FluxDisk {
    FluxDisk::from_dsk(&dsk_image(cylinders), DiskFormat::double_density(), &DriveConfig::pc_35())
        .expect("image fits the drive")
}

/// READ DATA command bytes for one MFM sector on drive 0 side 0.
pub fn read_data(c: u8, r: u8, eot: u8) -> [u8; 9] {
    [0x46, 0x00, c, 0x00, r, 0x02, eot, 0x1B, 0xFF]
}

pub fn write_data(c: u8, r: u8, eot: u8) -> [u8; 9] {
    [0x45, 0x00, c, 0x00, r, 0x02, eot, 0x1B, 0xFF]
}
