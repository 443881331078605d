//! The live engine runs ahead of the host and rolls back when the host
//! interacts. Whatever the host pacing, what it sees must match a
//! controller that was clocked one cell at a time.

mod common;

use common::{Bench, expected_sector, mfm_disk, read_data, write_data};
use emu_core::{Observable, Time};
use proptest::prelude::*;

fn snapshot(bench: &Bench) -> Vec<String> {
    bench
        .fdc
        .query_paths()
        .iter()
        .map(|path| format!("{path}={}", bench.fdc.query(path).expect("listed path")))
        .collect()
}

fn write_and_read_back(step_us: u64) -> (Vec<u8>, Vec<u8>, Vec<String>) {
    let mut bench = Bench::new(mfm_disk(1));
    bench.host_step = Time::from_micros(step_us);
    let payload: Vec<u8> = (0..512).map(|i| (i as u8).rotate_left(3)).collect();
    bench.command(&write_data(0, 7, 7));
    bench.write_bytes(&payload);
    bench.pulse_tc();
    let mut results = bench.result();

    bench.command(&read_data(0, 7, 7));
    let data = bench.read_bytes(512);
    bench.pulse_tc();
    results.extend(bench.result());
    (data, results, snapshot(&bench))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn tc_after_any_byte_ends_the_sector(k in 1usize..512, step_us in 2u64..20) {
        let mut bench = Bench::new(mfm_disk(1));
        bench.host_step = Time::from_micros(step_us);
        bench.command(&read_data(0, 1, 9));
        let data = bench.read_bytes(k);
        bench.pulse_tc();

        prop_assert_eq!(&data[..], &expected_sector(0, 1)[..k]);
        prop_assert_eq!(bench.result(), vec![0, 0, 0, 0, 0, 2, 2]);
    }

    #[test]
    fn host_pacing_does_not_change_recorded_data(step_us in 2u64..20) {
        let (data, results, _) = write_and_read_back(step_us);
        prop_assert_eq!(data, (0..512).map(|i| (i as u8).rotate_left(3)).collect::<Vec<u8>>());
        prop_assert_eq!(results, vec![0, 0, 0, 1, 0, 1, 2, 0, 0, 0, 1, 0, 1, 2]);
    }
}

#[test]
fn identical_runs_are_identical() {
    let first = write_and_read_back(8);
    let second = write_and_read_back(8);
    assert_eq!(first, second);
}

#[test]
fn status_queries_mid_transfer_change_nothing() {
    let mut quiet = Bench::new(mfm_disk(1));
    quiet.command(&read_data(0, 2, 2));
    let expected = quiet.read_bytes(512);

    let mut chatty = Bench::new(mfm_disk(1));
    chatty.command(&read_data(0, 2, 2));
    let mut data = Vec::new();
    while data.len() < 512 {
        // Peek at the engine between every byte.
        let _ = snapshot(&chatty);
        let byte = chatty.read_bytes(1);
        assert_eq!(byte.len(), 1, "transfer ended after {} bytes", data.len());
        data.extend(byte);
    }
    assert_eq!(data, expected);
    assert_eq!(data, expected_sector(0, 2));
}
