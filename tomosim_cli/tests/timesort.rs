#![allow(missing_docs)]

use assert_cmd::Command;
use assert_fs::TempDir;
use predicates::str;
use std::fs::File;
use tomosim::history::{HistoryHeader, HistoryKind, HistoryReader, HistoryWriter};
use tomosim::params::RunTimeParams;
use tomosim::photon::{Decay, DecayType, Position};

fn write_unsorted(path: &std::path::Path, kind: HistoryKind, times: &[f64]) {
    let header = HistoryHeader::new(kind, RunTimeParams::default());
    let mut writer = HistoryWriter::create(File::create(path).unwrap(), header).unwrap();
    for &time in times {
        writer
            .write_decay(&Decay {
                location: Position::new(0.0, 0.0, 0.0),
                start_weight: 1.0,
                time,
                decay_type: DecayType::Positron,
            })
            .unwrap();
    }
    writer.into_inner().unwrap();
}

fn read_times(path: &std::path::Path) -> Vec<f64> {
    let mut reader = HistoryReader::open(File::open(path).unwrap()).unwrap();
    let mut times = Vec::new();
    while let Some(event) = reader.read_event().unwrap() {
        if let tomosim::history::Event::Decay(decay) = event {
            times.push(decay.time);
        }
    }
    times
}

#[test]
fn sorts_and_sets_the_header_flag() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("unsorted.hist");
    let output = dir.path().join("sorted.hist");
    write_unsorted(&input, HistoryKind::Phg, &[3.0, 1.0, 2.0]);

    Command::cargo_bin("tomosim")
        .unwrap()
        .args(["timesort", "-p"])
        .arg(&input)
        .arg(&output)
        .assert()
        .success()
        .stdout(str::contains("sorting process now completed"));

    assert_eq!(read_times(&output), vec![1.0, 2.0, 3.0]);
    let reader = HistoryReader::open(File::open(&output).unwrap()).unwrap();
    assert!(reader.header().is_time_sorted);
    // the input survives without -r
    assert!(input.exists());
}

#[test]
fn test_mode_reports_sortedness() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("unsorted.hist");
    write_unsorted(&input, HistoryKind::Phg, &[2.0, 1.0]);

    Command::cargo_bin("tomosim")
        .unwrap()
        .args(["timesort", "-p", "-t"])
        .arg(&input)
        .assert()
        .failure()
        .stdout(str::contains("NOT time sorted"));
}

#[test]
fn wrong_source_kind_is_rejected() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("detector.hist");
    let output = dir.path().join("sorted.hist");
    write_unsorted(&input, HistoryKind::Detector, &[1.0]);

    Command::cargo_bin("tomosim")
        .unwrap()
        .args(["timesort", "-p"])
        .arg(&input)
        .arg(&output)
        .assert()
        .failure()
        .code(1)
        .stderr(str::contains("detector history file"));
}

#[test]
fn remove_input_deletes_the_source() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("unsorted.hist");
    let output = dir.path().join("sorted.hist");
    write_unsorted(&input, HistoryKind::Phg, &[2.0, 1.0]);

    Command::cargo_bin("tomosim")
        .unwrap()
        .args(["timesort", "-p", "-r"])
        .arg(&input)
        .arg(&output)
        .assert()
        .success();

    assert!(!input.exists());
    assert!(output.exists());
}
