//! FORMAT TRACK laid down on a blank disk, checked at the flux level and
//! read back through the controller.

mod common;

use common::{Bench, read_data};
use drive_ibm_floppy::FluxDisk;
use drive_ibm_floppy::track::{Encoding, Field, scan_fields};
use nec_upd765::{ST0_FAIL, ST1_NW};

const SECTORS: [u8; 4] = [1, 3, 2, 4];

fn format_track(bench: &mut Bench) -> Vec<u8> {
    bench.command(&[0x4D, 0x00, 0x02, SECTORS.len() as u8, 0x54, 0xE5]);
    let ids: Vec<u8> = SECTORS.iter().flat_map(|&r| [0, 0, r, 2]).collect();
    bench.write_bytes(&ids);
    bench.result()
}

/// ID fields and data fields found on a track, in order.
fn split_fields(fields: &[Field]) -> (Vec<(usize, [u8; 4], bool)>, Vec<(usize, bool, Vec<u8>, bool)>) {
    let ids = fields
        .iter()
        .filter_map(|f| match f {
            Field::Id { cell, chrn, crc_ok } => Some((*cell, *chrn, *crc_ok)),
            Field::Data { .. } => None,
        })
        .collect();
    let data = fields
        .iter()
        .filter_map(|f| match f {
            Field::Data {
                cell,
                deleted,
                data,
                crc_ok,
            } => Some((*cell, *deleted, data.clone(), *crc_ok)),
            Field::Id { .. } => None,
        })
        .collect();
    (ids, data)
}

#[test]
fn format_writes_ids_gaps_and_filler() {
    let mut bench = Bench::new(FluxDisk::unformatted(84, 2));
    assert_eq!(format_track(&mut bench), vec![0, 0, 0, 0, 0, 0, 2]);

    let fields = scan_fields(&bench.track_cells(0, 0), Encoding::Mfm);
    let (ids, data) = split_fields(&fields);

    assert_eq!(ids.len(), 4, "{fields:?}");
    assert_eq!(data.len(), 4);
    for (i, &r) in SECTORS.iter().enumerate() {
        let (id_cell, chrn, id_ok) = ids[i];
        assert_eq!(chrn, [0, 0, r, 2]);
        assert!(id_ok, "ID CRC of sector {r}");
        let (data_cell, deleted, bytes, data_ok) = &data[i];
        assert!(!deleted);
        assert!(data_ok, "data CRC of sector {r}");
        assert!(bytes.iter().all(|&b| b == 0xE5) && bytes.len() == 512);
        // ID bytes and CRC, gap 2, sync, data mark.
        assert_eq!(data_cell - id_cell, (6 + 22 + 12 + 3 + 1) * 16);
    }
    // Data field, CRC, gap 3, sync, ID mark.
    let spacing = ids[1].0 - ids[0].0;
    assert_eq!(spacing, (6 + 22 + 16 + 512 + 2 + 0x54 + 16) * 16);
}

#[test]
fn formatted_track_reads_back() {
    let mut bench = Bench::new(FluxDisk::unformatted(84, 2));
    format_track(&mut bench);
    bench.command(&read_data(0, 3, 4));
    let data = bench.read_bytes(512);
    bench.pulse_tc();
    assert_eq!(data, vec![0xE5; 512]);
    assert_eq!(bench.result(), vec![0, 0, 0, 0, 0, 4, 2]);
}

#[test]
fn format_refuses_write_protected_disk() {
    let mut disk = FluxDisk::unformatted(84, 2);
    disk.write_protected = true;
    let mut bench = Bench::new(disk);
    bench.command(&[0x4D, 0x00, 0x02, 4, 0x54, 0xE5]);
    assert_eq!(bench.result(), vec![ST0_FAIL, ST1_NW, 0, 0, 0, 0, 2]);
}

#[test]
fn fm_format_uses_single_density_gaps() {
    let mut bench = Bench::new(FluxDisk::unformatted(84, 2));
    bench.command(&[0x0D, 0x00, 0x01, SECTORS.len() as u8, 0x1B, 0xE5]);
    let ids: Vec<u8> = SECTORS.iter().flat_map(|&r| [0, 0, r, 1]).collect();
    bench.write_bytes(&ids);
    assert_eq!(bench.result(), vec![0, 0, 0, 0, 0, 0, 1]);

    let cells = bench.drive.borrow().track_cells(0, 0, Encoding::Fm, 250_000);
    let fields = scan_fields(&cells, Encoding::Fm);
    let (ids, data) = split_fields(&fields);
    assert_eq!(ids.len(), 4, "{fields:?}");
    assert_eq!(data.len(), 4);
    for (i, &r) in SECTORS.iter().enumerate() {
        let (id_cell, chrn, id_ok) = ids[i];
        assert_eq!(chrn, [0, 0, r, 1]);
        assert!(id_ok, "ID CRC of sector {r}");
        let (data_cell, deleted, bytes, data_ok) = &data[i];
        assert!(!deleted);
        assert!(data_ok, "data CRC of sector {r}");
        assert!(bytes.iter().all(|&b| b == 0xE5) && bytes.len() == 256);
        // ID bytes and CRC, 11 bytes of gap 2, 6 zero bytes, data mark.
        assert_eq!(data_cell - id_cell, (6 + 11 + 6 + 1) * 16);
    }
    // Up to the data field as above, then data, CRC, gap 3, 6 zero bytes
    // and the next ID mark.
    assert_eq!(ids[1].0 - ids[0].0, (6 + 11 + 6 + 1 + 256 + 2 + 0x1B + 6 + 1) * 16);

    bench.command(&[0x06, 0x00, 0, 0, 3, 1, 4, 0x0E, 0xFF]);
    let data = bench.read_bytes(256);
    bench.pulse_tc();
    assert_eq!(data, vec![0xE5; 256]);
    assert_eq!(bench.result(), vec![0, 0, 0, 0, 0, 4, 1]);
}
