//! デバッグコンソール
//!
//! テキストコマンドでエミュレータを直接操作する。リアルタイム処理の外で使うこと
//! （セクタの読み書きはプロトコルを通さず生イメージを触る）。

use crate::emulator::FloppyEmulator;
use crate::hal::DrivePins;
use crate::nic::SECTOR_BYTES;
use crate::storage::StorageBackend;
use std::fmt::Write as _;

/// コンソールコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Pins,
    Seek(u8),
    Read(u8, u8),
    Write(u8, u8, u8),
    Cache(u8),
    Flush,
    Load(String),
    List,
    Test,
    Quit,
}

const HELP: &str = "\
Commands:
  help                 this text
  status | info        drive status
  pins | gpio          input pin levels
  seek <t>             move head to track t
  read <t> <s>         hex dump of track t sector s
  write <t> <s> <b>    fill track t sector s with byte b
  cache <slot>         dump encoded slot of the streaming track
  flush                reconcile the cached track now
  load <file>          load a disk image
  list                 list disk images
  test                 write/read-back self test (T0 S0)
  quit | exit          leave the console
Numbers: decimal, $hex or 0xhex";

/// 数値をパース（10進、$16進、0x16進）
pub fn parse_number(s: &str) -> Option<u8> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix('$') {
        u8::from_str_radix(hex, 16).ok()
    } else if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn arg(args: &[&str], index: usize, name: &str) -> Result<u8, String> {
    let raw = args
        .get(index)
        .ok_or_else(|| format!("missing <{}>", name))?;
    parse_number(raw).ok_or_else(|| format!("invalid {}: {}", name, raw))
}

/// 1行をコマンドにパース（空行は None）
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut parts = line.split_whitespace();
    let name = match parts.next() {
        Some(name) => name.to_lowercase(),
        None => return Ok(None),
    };
    let args: Vec<&str> = parts.collect();

    let command = match name.as_str() {
        "help" | "?" => Command::Help,
        "status" | "info" => Command::Status,
        "pins" | "gpio" => Command::Pins,
        "seek" => Command::Seek(arg(&args, 0, "track")?),
        "read" => Command::Read(arg(&args, 0, "track")?, arg(&args, 1, "sector")?),
        "write" => Command::Write(
            arg(&args, 0, "track")?,
            arg(&args, 1, "sector")?,
            arg(&args, 2, "byte")?,
        ),
        "cache" => Command::Cache(arg(&args, 0, "slot")?),
        "flush" => Command::Flush,
        "load" => Command::Load(
            args.first()
                .map(|s| s.to_string())
                .ok_or_else(|| "missing <file>".to_string())?,
        ),
        "list" | "ls" => Command::List,
        "test" => Command::Test,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command: {} (try 'help')", other)),
    };
    Ok(Some(command))
}

/// 16バイト/行の16進ダンプ
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (i, line) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:03X}:", i * 16);
        for b in line {
            let _ = write!(out, " {:02X}", b);
        }
        out.push('\n');
    }
    out
}

/// コマンドを実行して出力テキストを返す
pub fn execute<P: DrivePins, S: StorageBackend>(
    emu: &mut FloppyEmulator<P, S>,
    command: &Command,
) -> Result<String, String> {
    match command {
        Command::Help => Ok(HELP.to_string()),
        Command::Status => Ok(status_text(emu)),
        Command::Pins => Ok(pins_text(emu.pins())),
        Command::Seek(track) => {
            emu.set_track(*track).map_err(|e| e.to_string())?;
            Ok(format!("Head at track {}", track))
        }
        Command::Read(track, sector) => {
            let data = emu.read_sector(*track, *sector).map_err(|e| e.to_string())?;
            Ok(format!("T={} S={}\n{}", track, sector, hex_dump(&data)))
        }
        Command::Write(track, sector, byte) => {
            emu.write_sector(*track, *sector, &[*byte; SECTOR_BYTES])
                .map_err(|e| e.to_string())?;
            Ok(format!("T={} S={} filled with ${:02X}", track, sector, byte))
        }
        Command::Cache(slot) => {
            let dump = emu.cache_sector(*slot).map_err(|e| e.to_string())?;
            let mut out = String::new();
            let track = dump
                .track
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(out, "Cache T={} slot={}", track, dump.slot);
            match dump.address {
                Some(addr) => {
                    let _ = writeln!(
                        out,
                        "Address: V={:02X} T={} S={} CHK={:02X} ({})",
                        addr.volume,
                        addr.track,
                        addr.sector,
                        addr.checksum,
                        if addr.is_valid() { "ok" } else { "bad" }
                    );
                }
                None => out.push_str("Address: not found\n"),
            }
            out.push_str(&hex_dump(&dump.bytes));
            match dump.decoded {
                Ok(data) => {
                    out.push_str("Decoded:\n");
                    out.push_str(&hex_dump(&data));
                }
                Err(e) => {
                    let _ = writeln!(out, "Decoded: {}", e);
                }
            }
            Ok(out)
        }
        Command::Flush => match emu.flush().map_err(|e| e.to_string())? {
            Some(report) => Ok(format!(
                "Reconciled T={}: {} decoded, {} skipped",
                report.track,
                report.decoded_count(),
                report.failed_count()
            )),
            None => Ok("Cache is clean".to_string()),
        },
        Command::Load(name) => {
            let bytes = emu.load_named(name).map_err(|e| e.to_string())?;
            Ok(format!("Loaded {} ({} bytes)", name, bytes))
        }
        Command::List => {
            let names = emu.list_images().map_err(|e| e.to_string())?;
            if names.is_empty() {
                Ok("(no images)".to_string())
            } else {
                Ok(names.join("\n"))
            }
        }
        Command::Test => self_test(emu),
        Command::Quit => Ok(String::new()),
    }
}

fn status_text<P: DrivePins, S: StorageBackend>(emu: &FloppyEmulator<P, S>) -> String {
    let status = emu.status().snapshot();
    let stats = emu.capture_stats();
    let mut out = String::new();
    let _ = writeln!(out, "Image:     {}", emu.image_name().unwrap_or("(none)"));
    let _ = writeln!(
        out,
        "Head:      T={} (phys {}){}",
        status.logical_track,
        status.physical_track,
        if status.at_track0() { " [TRACK 0]" } else { "" }
    );
    let _ = writeln!(
        out,
        "Cache:     T={} {}",
        status
            .cached_track
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string()),
        if status.dirty { "DIRTY" } else { "clean" }
    );
    let _ = writeln!(
        out,
        "Line:      {} ({})",
        status.line_mode,
        if status.selected { "selected" } else { "not selected" }
    );
    let _ = writeln!(
        out,
        "Captures:  {} installed, {} dropped (no sync {}, address {}, unknown sector {}, malformed {})",
        stats.installed,
        stats.dropped(),
        stats.no_sync,
        stats.address_fields,
        stats.unknown_sector,
        stats.malformed
    );
    let _ = write!(
        out,
        "Persisted: {}",
        status
            .last_persisted
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string())
    );
    out
}

fn level(high: bool) -> &'static str {
    if high {
        "HIGH"
    } else {
        "LOW"
    }
}

/// 入力ピンの生レベル
pub fn pins_text<P: DrivePins>(pins: &P) -> String {
    let phases = pins.phase_bits() & 0x0F;
    let mut out = String::new();
    for i in 0..4 {
        let _ = writeln!(out, "PH{}:       {}", i, level(phases & (1 << i) != 0));
    }
    let _ = writeln!(
        out,
        "/ENABLE:   {} ({})",
        level(pins.select_level()),
        if pins.is_selected() { "selected" } else { "not selected" }
    );
    let _ = writeln!(
        out,
        "/WREQ:     {} ({})",
        level(pins.write_request_level()),
        if pins.is_write_enabled() { "writing" } else { "reading" }
    );
    let _ = write!(out, "Phases:    {:04b}", phases);
    out
}

/// T0 S0 に書いて読み戻し、元に戻す
fn self_test<P: DrivePins, S: StorageBackend>(
    emu: &mut FloppyEmulator<P, S>,
) -> Result<String, String> {
    let original = emu.read_sector(0, 0).map_err(|e| e.to_string())?;
    let mut pattern = [0u8; SECTOR_BYTES];
    for (i, b) in pattern.iter_mut().enumerate() {
        *b = (i as u8) ^ 0xA5;
    }
    emu.write_sector(0, 0, &pattern).map_err(|e| e.to_string())?;
    let readback = emu.read_sector(0, 0).map_err(|e| e.to_string())?;
    emu.write_sector(0, 0, &original).map_err(|e| e.to_string())?;

    if readback == pattern {
        Ok("Self test PASS".to_string())
    } else {
        let bad = readback
            .iter()
            .zip(pattern.iter())
            .position(|(a, b)| a != b)
            .unwrap_or(0);
        Err(format!("Self test FAIL at byte {}", bad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::EmulatorOptions;
    use crate::image::DSK_SIZE;
    use crate::sim::SimPins;
    use crate::storage::MemoryStorage;

    fn emulator() -> FloppyEmulator<SimPins, MemoryStorage> {
        let mut storage = MemoryStorage::new();
        storage.insert("a.dsk", vec![0x11; DSK_SIZE]);
        storage.insert("b.dsk", vec![0x22; DSK_SIZE]);
        let mut emu = FloppyEmulator::new(SimPins::new(), storage, EmulatorOptions::default());
        emu.load_named("a.dsk").unwrap();
        emu.tick(0);
        emu
    }

    fn run(emu: &mut FloppyEmulator<SimPins, MemoryStorage>, line: &str) -> Result<String, String> {
        match parse_command(line)? {
            Some(command) => execute(emu, &command),
            None => Ok(String::new()),
        }
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("  "), Ok(None));
        assert_eq!(parse_command("SEEK $10"), Ok(Some(Command::Seek(16))));
        assert_eq!(parse_command("write 1 2 0xff"), Ok(Some(Command::Write(1, 2, 255))));
        assert_eq!(parse_command("info"), Ok(Some(Command::Status)));
        assert!(parse_command("read 1").is_err());
        assert!(parse_command("read 1 x").is_err());
        assert!(parse_command("format").is_err());
    }

    #[test]
    fn test_read_write_commands() {
        let mut emu = emulator();
        assert!(run(&mut emu, "write 3 4 $5A").is_ok());
        let out = run(&mut emu, "read 3 4").unwrap();
        assert!(out.contains("000: 5A 5A"));
        assert!(run(&mut emu, "read 40 0").unwrap_err().contains("out of range"));
    }

    #[test]
    fn test_status_and_seek() {
        let mut emu = emulator();
        run(&mut emu, "seek 0").unwrap();
        let out = run(&mut emu, "status").unwrap();
        assert!(out.contains("Image:     a.dsk"));
        assert!(out.contains("[TRACK 0]"));
        assert!(out.contains("Persisted: never"));
    }

    #[test]
    fn test_cache_flush_list_load() {
        let mut emu = emulator();
        let out = run(&mut emu, "cache 0").unwrap();
        assert!(out.contains("Address: V=FE T=17 S=0 CHK=EF (ok)"));
        assert!(out.contains("Decoded:"));
        assert_eq!(run(&mut emu, "flush").unwrap(), "Cache is clean");
        assert_eq!(run(&mut emu, "list").unwrap(), "a.dsk\nb.dsk");
        assert!(run(&mut emu, "load b.dsk").unwrap().contains("Loaded b.dsk"));
        assert_eq!(emu.read_sector(0, 0).unwrap(), [0x22; SECTOR_BYTES]);
        assert!(run(&mut emu, "load c.dsk").is_err());
    }

    #[test]
    fn test_self_test_restores_sector() {
        let mut emu = emulator();
        assert_eq!(run(&mut emu, "test").unwrap(), "Self test PASS");
        assert_eq!(emu.read_sector(0, 0).unwrap(), [0x11; SECTOR_BYTES]);
    }

    #[test]
    fn test_pins_command() {
        let mut emu = emulator();
        assert_eq!(parse_command("gpio"), Ok(Some(Command::Pins)));
        emu.pins().set_phases(0b0101);
        emu.pins().set_selected(true);
        let out = run(&mut emu, "pins").unwrap();
        assert!(out.contains("PH0:       HIGH"));
        assert!(out.contains("PH1:       LOW"));
        assert!(out.contains("/ENABLE:   LOW (selected)"));
        assert!(out.contains("/WREQ:     HIGH (reading)"));
        assert!(out.ends_with("Phases:    0101"));
    }

    #[test]
    fn test_hex_dump() {
        let dump = hex_dump(&[0u8; 20]);
        assert_eq!(dump.lines().count(), 2);
        assert!(dump.starts_with("000: 00"));
        assert!(dump.contains("010: 00 00 00 00\n"));
    }
}
