//! ホスト上のシミュレーション
//!
//! 実機の代わりにピン入力・ステッパー駆動・書き込みフラックスを生成し、
//! コントローラ側の動作（シーク、アドレスフィールド検索、セクタ書き込み）を再現する。
//! テストと CLI のデモで使う。

use crate::capture::{CaptureOutcome, BIT_CELL_NS, SKIP_BIT};
use crate::emulator::FloppyEmulator;
use crate::hal::DrivePins;
use crate::nic::{encode_sector, InterleaveTable, SECTOR_BYTES};
use crate::stepper::MAX_LOGICAL_TRACK;
use crate::storage::StorageBackend;
use crate::track::{AddressField, ADDRESS_PROLOGUE, DATA_PROLOGUE, EPILOGUE, TRACK_BYTES};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct PinState {
    phases: AtomicU8,
    select_level: AtomicBool,
    write_request_level: AtomicBool,
}

/// 共有ピン（コントローラ側とエミュレータ側で clone して使う）
#[derive(Debug, Clone)]
pub struct SimPins {
    state: Arc<PinState>,
}

impl Default for SimPins {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPins {
    /// 初期状態: フェーズ全OFF、非選択、書き込みなし
    pub fn new() -> Self {
        SimPins {
            state: Arc::new(PinState {
                phases: AtomicU8::new(0),
                select_level: AtomicBool::new(true),
                write_request_level: AtomicBool::new(true),
            }),
        }
    }

    pub fn set_phases(&self, phases: u8) {
        self.state.phases.store(phases & 0x0F, Ordering::Release);
    }

    /// ドライブ選択（負論理の変換はここで行う）
    pub fn set_selected(&self, selected: bool) {
        self.state.select_level.store(!selected, Ordering::Release);
    }

    pub fn set_write_enabled(&self, enabled: bool) {
        self.state.write_request_level.store(!enabled, Ordering::Release);
    }
}

impl DrivePins for SimPins {
    fn phase_bits(&self) -> u8 {
        self.state.phases.load(Ordering::Acquire)
    }

    fn select_level(&self) -> bool {
        self.state.select_level.load(Ordering::Acquire)
    }

    fn write_request_level(&self) -> bool {
        self.state.write_request_level.load(Ordering::Acquire)
    }
}

/// 1ホットのフェーズ列を生成する
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseSequencer {
    phase: u8,
}

impl PhaseSequencer {
    pub fn new(phase: u8) -> Self {
        PhaseSequencer { phase: phase & 3 }
    }

    pub fn phase(&self) -> u8 {
        self.phase
    }

    /// 現在のフェーズの出力値
    pub fn current(&self) -> u8 {
        1 << self.phase
    }

    /// 内側へ1ハーフトラック
    pub fn step_in(&mut self) -> u8 {
        self.phase = (self.phase + 1) & 3;
        self.current()
    }

    /// 外側へ1ハーフトラック
    pub fn step_out(&mut self) -> u8 {
        self.phase = (self.phase + 3) & 3;
        self.current()
    }

    /// 物理トラック `from` から `to` までのフェーズ列
    pub fn seek(&mut self, from: u8, to: u8) -> Vec<u8> {
        if to >= from {
            (from..to).map(|_| self.step_in()).collect()
        } else {
            (to..from).map(|_| self.step_out()).collect()
        }
    }
}

/// 書き込みラインのイベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxEvent {
    /// フラックス遷移（ビット1）
    Transition,
    /// 時間経過（ナノ秒）
    Elapse(u32),
}

/// 遷移はセル先頭から少し遅れて来る
const TRANSITION_DELAY_NS: u32 = 500;

/// コントローラが書き込むビット列
///
/// キャプチャ側が捨てる余剰ビット（リセット後17番目）の位置には
/// 詰め物のビットを差し込んでおく。
#[derive(Debug, Clone, Default)]
pub struct WriteStream {
    bits: Vec<bool>,
    counted: u32,
    window: u8,
    synced: bool,
}

impl WriteStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// セクタ1つ分のデータフィールド（同期5バイト + D5 AA AD + 343 + DE AA EB）
    pub fn data_field(sector: &[u8; SECTOR_BYTES]) -> Self {
        WriteStream::new()
            .sync(5)
            .bytes(&DATA_PROLOGUE)
            .bytes(&encode_sector(sector))
            .bytes(&EPILOGUE)
    }

    /// 同期バイト FF
    pub fn sync(self, count: usize) -> Self {
        self.bytes(&vec![0xFF; count])
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        for &byte in bytes {
            for i in (0..8).rev() {
                self.push((byte >> i) & 1 != 0);
            }
        }
        self
    }

    pub fn raw_bits(mut self, bits: &[bool]) -> Self {
        for &bit in bits {
            self.push(bit);
        }
        self
    }

    fn push(&mut self, bit: bool) {
        self.counted += 1;
        if self.counted == SKIP_BIT {
            self.bits.push(true);
            self.counted += 1;
        }
        self.bits.push(bit);

        if !self.synced {
            self.window = (self.window << 1) | bit as u8;
            if self.window == DATA_PROLOGUE[0] {
                self.synced = true;
                self.counted = 0;
            }
        }
    }

    /// セル単位のビット列
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// 時間軸のイベント列
    pub fn flux_events(&self) -> Vec<FluxEvent> {
        let mut events = Vec::with_capacity(self.bits.len() * 3);
        for &bit in &self.bits {
            if bit {
                events.push(FluxEvent::Elapse(TRANSITION_DELAY_NS));
                events.push(FluxEvent::Transition);
                events.push(FluxEvent::Elapse(BIT_CELL_NS - TRANSITION_DELAY_NS));
            } else {
                events.push(FluxEvent::Elapse(BIT_CELL_NS));
            }
        }
        events
    }
}

/// ステップ1回ごとに与える時間（µs）
const STEP_TIME_US: u32 = 1000;

/// 読み取りラッチが1ニブルを得るまでに許すビット数
const NIBBLE_BIT_LIMIT: usize = 64;

/// コントローラの動作を再現する
pub struct SimController {
    pins: SimPins,
    sequencer: PhaseSequencer,
}

impl SimController {
    pub fn new(pins: SimPins) -> Self {
        SimController {
            pins,
            sequencer: PhaseSequencer::default(),
        }
    }

    pub fn pins(&self) -> &SimPins {
        &self.pins
    }

    /// ドライブを選択し、現在のフェーズをピンに出す
    pub fn select(&mut self) {
        self.pins.set_selected(true);
        self.pins.set_phases(self.sequencer.current());
    }

    pub fn deselect(&mut self) {
        self.pins.set_selected(false);
    }

    /// エミュレータのヘッド位置にフェーズを合わせる
    pub fn sync_phase<S: StorageBackend>(&mut self, emu: &FloppyEmulator<SimPins, S>) {
        self.sequencer = PhaseSequencer::new(emu.head().last_phase);
        self.pins.set_phases(self.sequencer.current());
    }

    /// 論理トラックへシーク
    pub fn seek<S: StorageBackend>(&mut self, emu: &mut FloppyEmulator<SimPins, S>, track: u8) {
        let track = track.min(MAX_LOGICAL_TRACK);
        let from = emu.head().physical_track;
        for phases in self.sequencer.seek(from, track * 2) {
            self.pins.set_phases(phases);
            emu.tick(STEP_TIME_US);
        }
        emu.tick(0);
    }

    /// 読み取りラッチの動作で1ニブル読む（MSBが立つまでシフト）
    pub fn read_nibble<S: StorageBackend>(&mut self, emu: &mut FloppyEmulator<SimPins, S>) -> Option<u8> {
        let mut latch = 0u8;
        for _ in 0..NIBBLE_BIT_LIMIT {
            latch = (latch << 1) | emu.read_bit() as u8;
            if latch & 0x80 != 0 {
                return Some(latch);
            }
        }
        None
    }

    /// 次のアドレスフィールドを読む（`max_nibbles` まで）
    pub fn find_address<S: StorageBackend>(
        &mut self,
        emu: &mut FloppyEmulator<SimPins, S>,
        max_nibbles: usize,
    ) -> Option<AddressField> {
        let mut matched = 0;
        for _ in 0..max_nibbles {
            let nibble = self.read_nibble(emu)?;
            if nibble == ADDRESS_PROLOGUE[matched] {
                matched += 1;
            } else {
                matched = (nibble == ADDRESS_PROLOGUE[0]) as usize;
            }
            if matched == ADDRESS_PROLOGUE.len() {
                let mut field = [0u8; 11];
                field[..3].copy_from_slice(&ADDRESS_PROLOGUE);
                for byte in field[3..].iter_mut() {
                    *byte = self.read_nibble(emu)?;
                }
                return AddressField::parse(&field);
            }
        }
        None
    }

    /// セクタ1つを書き込む（シーク -> アドレス検索 -> WE アサート -> データ送出 -> WE 解除）
    ///
    /// 目的のアドレスフィールドが2周以内に見つからなければ None。
    pub fn write_sector<S: StorageBackend>(
        &mut self,
        emu: &mut FloppyEmulator<SimPins, S>,
        track: u8,
        sector: u8,
        data: &[u8; SECTOR_BYTES],
    ) -> Option<CaptureOutcome> {
        let slot = InterleaveTable::logical_to_physical(sector)?;
        self.sync_phase(emu);
        self.select();
        self.seek(emu, track);

        let mut budget = TRACK_BYTES * 2;
        loop {
            let addr = self.find_address(emu, budget)?;
            budget = budget.saturating_sub(crate::track::SLOT_BYTES);
            if addr.is_valid() && addr.track == track && addr.sector == slot {
                break;
            }
            if budget == 0 {
                return None;
            }
        }

        self.pins.set_write_enabled(true);
        emu.on_write_request_changed();
        play(emu, &WriteStream::data_field(data));
        self.pins.set_write_enabled(false);
        emu.on_write_request_changed()
    }
}

/// 書き込みストリームをエミュレータの割り込み入口へ流す
pub fn play<P: DrivePins, S: StorageBackend>(emu: &mut FloppyEmulator<P, S>, stream: &WriteStream) {
    for event in stream.flux_events() {
        match event {
            FluxEvent::Transition => emu.on_write_transition(),
            FluxEvent::Elapse(ns) => emu.advance_write_clock(ns),
        }
    }
}
