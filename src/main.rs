//! A2Floppy - Disk II ドライブエミュレータ
//!
//! Version 0.1
//!
//! ホスト上でドライブエミュレータのコアを動かし、デバッグコンソールと
//! シミュレートしたコントローラによる書き込みデモを提供する。
//!
//! # 使用方法
//! ```text
//! a2floppy --image dos33.dsk
//! a2floppy --image work.dsk --demo-write 17 3 --disk-log flow+decide
//! ```

use a2floppy::config::Config;
use a2floppy::console::{self, Command};
use a2floppy::disk_log;
use a2floppy::emulator::FloppyEmulator;
use a2floppy::irq::IrqContext;
use a2floppy::nic::SECTOR_BYTES;
use a2floppy::sim::{SimController, SimPins};
use a2floppy::storage::FileStorage;
use clap::Parser;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Emulator = FloppyEmulator<SimPins, FileStorage>;

/// A2Floppy - Disk II drive emulator
#[derive(Parser, Debug)]
#[command(name = "a2floppy")]
#[command(author = "A2RS Project")]
#[command(version = "0.1.0")]
#[command(about = "A2Floppy - Apple II Disk II drive emulator core", long_about = None)]
struct Args {
    /// ディスクイメージ（イメージディレクトリからの名前、またはパス）
    #[arg(short, long)]
    image: Option<String>,

    /// 設定ファイル
    #[arg(short, long)]
    config: Option<String>,

    /// 起動後にヘッドを移動するトラック
    #[arg(short, long)]
    track: Option<u8>,

    /// シミュレートしたコントローラでセクタを書き込む（トラック セクタ）
    #[arg(long, num_args = 2, value_names = ["TRACK", "SECTOR"])]
    demo_write: Option<Vec<u8>>,

    /// コンソールコマンドをファイルから実行
    #[arg(long)]
    script: Option<String>,

    /// ディスクログレベル: none, flow, state, decide, nibble, all
    /// 複数指定可: flow+state+decide
    #[arg(long)]
    disk_log: Option<String>,
}

/// メイン tick の周期
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// 画像指定を保存先の名前に変換する
///
/// 既存ファイルのパスなら絶対パス、そうでなければイメージディレクトリ内の名前とみなす。
fn image_name(spec: &str) -> String {
    let path = Path::new(spec);
    if path.is_file() {
        if let Ok(abs) = fs::canonicalize(path) {
            return abs.to_string_lossy().into_owned();
        }
    }
    spec.to_string()
}

/// メイン tick をバックグラウンドで回す
fn spawn_ticker(ctx: IrqContext<Emulator>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last = Instant::now();
        while !stop.load(Ordering::Acquire) {
            thread::sleep(TICK_INTERVAL);
            let now = Instant::now();
            let elapsed = now.duration_since(last).as_micros().min(u32::MAX as u128) as u32;
            last = now;
            ctx.tick(elapsed);
        }
    })
}

/// コマンドを1行実行して結果を表示（quit なら false）
fn run_line(ctx: &IrqContext<Emulator>, line: &str) -> bool {
    match console::parse_command(line) {
        Ok(None) => true,
        Ok(Some(Command::Quit)) => false,
        Ok(Some(command)) => {
            match ctx.with(|emu| console::execute(emu, &command)) {
                Ok(out) => println!("{}", out),
                Err(e) => println!("Error: {}", e),
            }
            true
        }
        Err(e) => {
            println!("Error: {}", e);
            true
        }
    }
}

fn run_script(ctx: &IrqContext<Emulator>, path: &str) -> Result<(), String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read script {}: {}", path, e))?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        println!("> {}", line);
        if !run_line(ctx, line) {
            break;
        }
    }
    Ok(())
}

fn run_interactive(ctx: &IrqContext<Emulator>) {
    println!("A2Floppy console. Type 'help' for commands.");
    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if !run_line(ctx, &line) {
                    break;
                }
            }
            Err(e) => {
                eprintln!("Failed to read input: {}", e);
                break;
            }
        }
    }
}

/// シミュレートしたコントローラでセクタを1つ書き込むデモ
fn demo_write(ctx: &IrqContext<Emulator>, pins: &SimPins, track: u8, sector: u8) {
    let mut data = [0u8; SECTOR_BYTES];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(7) ^ track ^ (sector << 4);
    }

    let mut controller = SimController::new(pins.clone());
    let outcome = ctx.with(|emu| controller.write_sector(emu, track, sector, &data));
    match outcome {
        Some(outcome) => println!("Demo write T={} S={}: {:?}", track, sector, outcome),
        None => {
            println!("Demo write T={} S={}: address field not found", track, sector);
            return;
        }
    }

    let verified = ctx.with(|emu| {
        if let Err(e) = emu.flush() {
            log::warn!("Flush before verify failed: {}", e);
        }
        emu.read_sector(track, sector).map(|read| read == data)
    });
    match verified {
        Ok(true) => println!("Demo write verified"),
        Ok(false) => println!("Demo write MISMATCH"),
        Err(e) => println!("Demo write failed: {}", e),
    }
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    // 設定ファイル
    let (mut config, config_path) = Config::load_with_options(args.config.as_deref());
    config.ensure_directories();

    // ディスクログレベルを設定（コマンドライン優先）
    let disk_log_level = match &args.disk_log {
        Some(level) => disk_log::parse_level(level),
        None => config.disk_log_level(),
    };
    disk_log::set_log_level(disk_log_level);

    let pins = SimPins::new();
    let storage = FileStorage::new(config.image_dir_path());
    let mut emu = FloppyEmulator::new(pins.clone(), storage, config.emulator_options());

    // ディスクイメージ
    let image = args
        .image
        .as_deref()
        .map(image_name)
        .or_else(|| config.last_image.clone());
    if let Some(name) = image {
        match emu.load_named(&name) {
            Ok(bytes) => {
                println!("Loaded {} ({} bytes)", name, bytes);
                config.last_image = Some(name);
            }
            Err(e) => eprintln!("Failed to load {}: {}", name, e),
        }
    }

    pins.set_selected(true);
    emu.tick(0);

    if let Some(track) = args.track {
        if let Err(e) = emu.set_track(track) {
            eprintln!("Failed to set track: {}", e);
        }
    }

    let ctx = match IrqContext::register(emu) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    if let Some(location) = &args.demo_write {
        if let [track, sector] = location[..] {
            demo_write(&ctx, &pins, track, sector);
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let ticker = spawn_ticker(ctx.clone(), Arc::clone(&stop));

    if let Some(script) = &args.script {
        if let Err(e) = run_script(&ctx, script) {
            eprintln!("{}", e);
        }
    } else if args.demo_write.is_none() {
        run_interactive(&ctx);
    }

    stop.store(true, Ordering::Release);
    if ticker.join().is_err() {
        log::warn!("Tick thread panicked");
    }

    // 終了前に書き戻す
    if let Err(e) = ctx.with(|emu| emu.flush()) {
        log::warn!("Final flush failed: {}", e);
    }

    if let Err(e) = config.save_to(&config_path) {
        eprintln!("{}", e);
    }
}
