//! トラックコーデック検証ツール
//!
//! イメージ（またはランダムデータ）の全セクタをトラックエンコーダでエンコードし、
//! デコードして一致を確認する。`--capture` 指定時は書き込みキャプチャ経路
//! （ビット列 -> キャプチャ -> スロット書き込み -> デコード）も通す。
//!
//! 使用方法: cargo run --bin nic_check -- dos33.dsk --capture

use a2floppy::capture::{CaptureOutcome, WriteCaptureEngine};
use a2floppy::image::{DiskImage, DSK_SIZE, SECTORS_PER_TRACK};
use a2floppy::nic::{InterleaveTable, SECTOR_BYTES};
use a2floppy::sim::{FluxEvent, WriteStream};
use a2floppy::stepper::TRACKS;
use a2floppy::track::{EncodedTrack, TrackEncoder, ADDRESS_FIELD_OFFSET, SLOT_BYTES};
use clap::Parser;
use rand::Rng;
use std::fs;
use std::time::Instant;

/// NIC 6-and-2 track codec check
#[derive(Parser, Debug)]
#[command(name = "nic_check")]
#[command(author = "A2RS Project")]
#[command(version = "0.1.0")]
#[command(about = "Round-trips a disk image through the track codec", long_about = None)]
struct Args {
    /// ディスクイメージ（省略時はランダムデータ）
    image: Option<String>,

    /// アドレスフィールドのボリューム番号
    #[arg(long, default_value = "254")]
    volume: u8,

    /// 書き込みキャプチャ経路も検証する
    #[arg(long)]
    capture: bool,
}

#[derive(Default)]
struct Totals {
    sectors: usize,
    codec_errors: usize,
    address_errors: usize,
    captures: usize,
    capture_errors: usize,
}

/// 1セクタをキャプチャ経路で書き込み、デコード結果を確認
fn check_capture(
    engine: &mut WriteCaptureEngine,
    encoded: &mut EncodedTrack,
    slot: u8,
    expected: &[u8; SECTOR_BYTES],
) -> bool {
    let offset = slot as usize * SLOT_BYTES + ADDRESS_FIELD_OFFSET + 11;
    if engine.begin(encoded, offset) != Some(slot) {
        return false;
    }
    for event in WriteStream::data_field(expected).flux_events() {
        match event {
            FluxEvent::Transition => engine.on_transition(),
            FluxEvent::Elapse(ns) => engine.elapse(ns),
        }
    }
    match engine.end(encoded) {
        CaptureOutcome::Installed { .. } => encoded.decode_slot(slot).as_ref() == Ok(expected),
        CaptureOutcome::Dropped(_) => false,
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut image = DiskImage::new();
    match &args.image {
        Some(path) => match fs::read(path) {
            Ok(bytes) => {
                if bytes.len() != DSK_SIZE {
                    println!("Warning: {} is {} bytes (expected {})", path, bytes.len(), DSK_SIZE);
                }
                image.load(&bytes);
                println!("Checking {}", path);
            }
            Err(e) => {
                eprintln!("Failed to read {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => {
            let mut bytes = vec![0u8; DSK_SIZE];
            rand::thread_rng().fill(&mut bytes[..]);
            image.load(&bytes);
            println!("Checking random image");
        }
    }

    let encoder = TrackEncoder::new(args.volume);
    let mut encoded = EncodedTrack::boxed();
    let mut engine = WriteCaptureEngine::new();
    let mut totals = Totals::default();
    let start = Instant::now();

    for track in 0..TRACKS as u8 {
        let raw = image.track(track).unwrap_or(&[]);
        encoded.rebuild(&encoder, raw, track);

        for slot in 0..SECTORS_PER_TRACK as u8 {
            let logical = InterleaveTable::physical_to_logical(slot).unwrap_or(slot);
            let expected = match image.sector(track, logical) {
                Some(sector) => *sector,
                None => continue,
            };
            totals.sectors += 1;

            match encoded.address_of(slot) {
                Some(addr) if addr.is_valid() && addr.track == track && addr.sector == slot => {}
                _ => {
                    totals.address_errors += 1;
                    println!("T={:02} slot={:02}: bad address field", track, slot);
                }
            }

            match encoded.decode_slot(slot) {
                Ok(decoded) if decoded == expected => {}
                Ok(_) => {
                    totals.codec_errors += 1;
                    println!("T={:02} S={:02}: decoded data mismatch", track, logical);
                }
                Err(e) => {
                    totals.codec_errors += 1;
                    println!("T={:02} S={:02}: {}", track, logical, e);
                }
            }

            if args.capture {
                totals.captures += 1;
                if !check_capture(&mut engine, &mut encoded, slot, &expected) {
                    totals.capture_errors += 1;
                    println!("T={:02} S={:02}: capture path failed", track, logical);
                }
            }
        }
    }

    println!(
        "{} sectors checked in {:.1} ms: {} codec errors, {} address errors",
        totals.sectors,
        start.elapsed().as_secs_f64() * 1000.0,
        totals.codec_errors,
        totals.address_errors
    );
    if args.capture {
        println!("{} captures: {} failed", totals.captures, totals.capture_errors);
    }

    let failed = totals.codec_errors + totals.address_errors + totals.capture_errors;
    if failed > 0 {
        std::process::exit(1);
    }
    println!("OK");
}
