//! ドライブエミュレータ本体
//!
//! メインの tick と割り込み入口（WE変化、書き込み遷移、サンプルタイマー）を束ね、
//! ステッパー追跡・キャッシュ選択・リーダーとキャプチャの切り替えを行う。
//!
//! tick の順序:
//! 1. ステッパー（常に、非選択でも）
//! 2. キャプチャ中ならここで戻る
//! 3. 論理トラックが変わっていればキャッシュを書き戻し・再構築
//! 4. 回転クロックを進める

use crate::capture::{CaptureOutcome, CaptureState, CaptureStats, WriteCaptureEngine};
use crate::disk_log;
use crate::hal::DrivePins;
use crate::image::{DiskImage, SECTORS_PER_TRACK};
use crate::line::{LineArbiter, LineMode};
use crate::nic::SECTOR_BYTES;
use crate::reader::BitstreamReader;
use crate::stepper::{HeadState, StepEvent, StepperPositionTracker, MAX_LOGICAL_TRACK};
use crate::storage::{StorageBackend, StorageError};
use crate::track::{AddressField, SlotError, TrackEncoder, DEFAULT_VOLUME, SLOT_BYTES};
use crate::track_cache::{ReconcileReport, TrackCache};
use chrono::{DateTime, Local, TimeZone};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// 起動時のヘッド位置
pub const BRING_UP_TRACK: u8 = 17;

/// 無効トラックの印（共有ステータス用）
const NO_TRACK: u8 = 0xFF;

/// エミュレータのエラー
#[derive(Debug)]
pub enum EmulatorError {
    TrackOutOfRange(u8),
    SectorOutOfRange(u8),
    /// キャプチャ中は実行できない
    CaptureInProgress,
    /// 割り込みコンテキストは1つだけ
    AlreadyRegistered,
    Storage(StorageError),
}

impl fmt::Display for EmulatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulatorError::TrackOutOfRange(t) => {
                write!(f, "track {} out of range (0-{})", t, MAX_LOGICAL_TRACK)
            }
            EmulatorError::SectorOutOfRange(s) => {
                write!(f, "sector {} out of range (0-{})", s, SECTORS_PER_TRACK - 1)
            }
            EmulatorError::CaptureInProgress => write!(f, "write capture in progress"),
            EmulatorError::AlreadyRegistered => write!(f, "emulator context already registered"),
            EmulatorError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for EmulatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmulatorError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for EmulatorError {
    fn from(e: StorageError) -> Self {
        EmulatorError::Storage(e)
    }
}

/// エミュレータの設定
#[derive(Debug, Clone, Copy)]
pub struct EmulatorOptions {
    /// ロード時のヘッド位置
    pub bring_up_track: u8,
    /// アドレスフィールドのボリューム番号
    pub volume: u8,
    /// 書き戻したトラックを保存先へ書き込む
    pub persist_tracks: bool,
}

impl Default for EmulatorOptions {
    fn default() -> Self {
        EmulatorOptions {
            bring_up_track: BRING_UP_TRACK,
            volume: DEFAULT_VOLUME,
            persist_tracks: true,
        }
    }
}

/// 他コンテキストから読める状態
///
/// 書くのは tick / 割り込み側だけ。読む側はスナップショットを取る。
#[derive(Debug)]
pub struct SharedStatus {
    logical_track: AtomicU8,
    physical_track: AtomicU8,
    cached_track: AtomicU8,
    dirty: AtomicBool,
    writing: AtomicBool,
    selected: AtomicBool,
    captures_installed: AtomicU32,
    captures_dropped: AtomicU32,
    /// 最終保存時刻（UNIX秒、0 = 未保存）
    last_persisted: AtomicI64,
}

impl Default for SharedStatus {
    fn default() -> Self {
        SharedStatus {
            logical_track: AtomicU8::new(0),
            physical_track: AtomicU8::new(0),
            cached_track: AtomicU8::new(NO_TRACK),
            dirty: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            selected: AtomicBool::new(false),
            captures_installed: AtomicU32::new(0),
            captures_dropped: AtomicU32::new(0),
            last_persisted: AtomicI64::new(0),
        }
    }
}

/// 状態のスナップショット
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub logical_track: u8,
    pub physical_track: u8,
    pub cached_track: Option<u8>,
    pub dirty: bool,
    pub line_mode: LineMode,
    pub selected: bool,
    pub captures_installed: u32,
    pub captures_dropped: u32,
    pub last_persisted: Option<DateTime<Local>>,
}

impl StatusSnapshot {
    /// トラック0にいるか
    pub fn at_track0(&self) -> bool {
        self.physical_track == 0
    }
}

impl SharedStatus {
    pub fn snapshot(&self) -> StatusSnapshot {
        let cached = self.cached_track.load(Ordering::Acquire);
        let persisted = self.last_persisted.load(Ordering::Acquire);
        StatusSnapshot {
            logical_track: self.logical_track.load(Ordering::Acquire),
            physical_track: self.physical_track.load(Ordering::Acquire),
            cached_track: (cached != NO_TRACK).then_some(cached),
            dirty: self.dirty.load(Ordering::Acquire),
            line_mode: if self.writing.load(Ordering::Acquire) {
                LineMode::Write
            } else {
                LineMode::Read
            },
            selected: self.selected.load(Ordering::Acquire),
            captures_installed: self.captures_installed.load(Ordering::Acquire),
            captures_dropped: self.captures_dropped.load(Ordering::Acquire),
            last_persisted: if persisted == 0 {
                None
            } else {
                Local.timestamp_opt(persisted, 0).single()
            },
        }
    }

    fn set_head(&self, head: &HeadState) {
        self.physical_track.store(head.physical_track, Ordering::Release);
        self.logical_track.store(head.logical_track(), Ordering::Release);
    }

    fn set_cache(&self, cache: &TrackCache) {
        self.cached_track
            .store(cache.cached_track().unwrap_or(NO_TRACK), Ordering::Release);
        self.dirty.store(cache.is_dirty(), Ordering::Release);
    }

    fn set_persisted(&self, at: DateTime<Local>) {
        self.last_persisted.store(at.timestamp(), Ordering::Release);
    }
}

/// キャッシュ内スロットのダンプ
#[derive(Debug, Clone)]
pub struct SlotDump {
    pub track: Option<u8>,
    pub slot: u8,
    pub bytes: Vec<u8>,
    pub address: Option<AddressField>,
    pub decoded: Result<[u8; SECTOR_BYTES], SlotError>,
}

/// Disk II ドライブエミュレータ
pub struct FloppyEmulator<P: DrivePins, S: StorageBackend> {
    pins: P,
    storage: S,
    options: EmulatorOptions,
    image: DiskImage,
    image_name: Option<String>,
    stepper: StepperPositionTracker,
    cache: TrackCache,
    reader: BitstreamReader,
    line: LineArbiter,
    capture: WriteCaptureEngine,
    status: Arc<SharedStatus>,
}

impl<P: DrivePins, S: StorageBackend> FloppyEmulator<P, S> {
    /// バッファはすべてここで確保する（以後の tick/割り込みでは確保しない）
    pub fn new(pins: P, storage: S, options: EmulatorOptions) -> Self {
        let bring_up = options.bring_up_track.min(MAX_LOGICAL_TRACK);
        let mut stepper = StepperPositionTracker::new();
        stepper.reset_to(bring_up, pins.phase_bits());
        let mut reader = BitstreamReader::new();
        reader.start();

        let emu = FloppyEmulator {
            cache: TrackCache::new(TrackEncoder::new(options.volume)),
            pins,
            storage,
            options,
            image: DiskImage::new(),
            image_name: None,
            stepper,
            reader,
            line: LineArbiter::new(),
            capture: WriteCaptureEngine::new(),
            status: Arc::new(SharedStatus::default()),
        };
        emu.status.set_head(&emu.stepper.head());
        emu
    }

    // ============================================================
    // メインコンテキスト
    // ============================================================

    /// 1回分のポーリング処理
    pub fn tick(&mut self, elapsed_us: u32) {
        let event = self.stepper.sample(self.pins.phase_bits());
        if let StepEvent::Stepped { from, to } = event {
            self.status.set_head(&self.stepper.head());
            if event.changed_track() {
                disk_log::log_track_change(from >> 1, to >> 1);
            }
        }
        self.status
            .selected
            .store(self.pins.is_selected(), Ordering::Release);

        if self.capture.is_active() {
            return;
        }

        let track = self.stepper.logical_track();
        if self.cache.selected_track() != Some(track) {
            self.select_track(track);
        }

        if self.reader.advance(elapsed_us, &mut self.cache) > 0 {
            self.status.set_cache(&self.cache);
        }
    }

    /// 読み出しラインの次の1ビット（シリアライザ出力）
    ///
    /// 非選択・書き込み中は Low。
    #[inline]
    pub fn read_bit(&mut self) -> bool {
        if !self.pins.is_selected() || self.line.mode() == LineMode::Write {
            return false;
        }
        let before = self.cache.cached_track();
        let bit = self.reader.next_bit(&mut self.cache);
        if self.cache.cached_track() != before {
            self.status.set_cache(&self.cache);
        }
        bit
    }

    fn select_track(&mut self, track: u8) {
        let report = self.cache.select(track, &mut self.image);
        if let Some(report) = report {
            self.persist(&report);
        }
        self.status.set_cache(&self.cache);
    }

    /// 書き戻したトラックを保存先へ（失敗はログのみ）
    fn persist(&mut self, report: &ReconcileReport) {
        if !self.options.persist_tracks || report.decoded == 0 {
            return;
        }
        let name = match &self.image_name {
            Some(name) => name.clone(),
            None => return,
        };
        let bytes = match self.image.track(report.track) {
            Some(bytes) => bytes,
            None => return,
        };
        match self.storage.save_track(&name, report.track, bytes) {
            Ok(()) => {
                self.status.set_persisted(Local::now());
                disk_log::log_track_persisted(&name, report.track);
            }
            Err(e) => log::warn!("Failed to save track {} of {}: {}", report.track, name, e),
        }
    }

    // ============================================================
    // 割り込み入口
    // ============================================================

    /// WE（/WREQ）のエッジ
    ///
    /// アサートでキャプチャ開始、解除でキャプチャを終えて結果を返す。
    pub fn on_write_request_changed(&mut self) -> Option<CaptureOutcome> {
        if self.pins.is_write_enabled() {
            self.begin_capture();
            None
        } else {
            self.end_capture()
        }
    }

    fn begin_capture(&mut self) {
        // /WREQ は全ドライブ共通なので、選択されていなければ無視
        if !self.pins.is_selected() || self.capture.is_active() {
            return;
        }
        // 保留中の入れ替えを先に済ませる（書き込み先と送出中のトラックを一致させる）
        self.cache.publish_pending();
        let offset = match self.line.enter_write(&mut self.reader) {
            Some(offset) => offset,
            None => return,
        };
        self.capture.begin(self.cache.front(), offset);
        self.status.writing.store(true, Ordering::Release);
        self.status.set_cache(&self.cache);
    }

    fn end_capture(&mut self) -> Option<CaptureOutcome> {
        if self.capture.state() != CaptureState::Sampling {
            return None;
        }
        self.capture.stop_sampling();
        self.line.exit_write(&mut self.reader);
        let outcome = self.capture.complete(self.cache.front_mut());

        match outcome {
            CaptureOutcome::Installed { .. } => {
                self.status.captures_installed.fetch_add(1, Ordering::AcqRel);
            }
            CaptureOutcome::Dropped(_) => {
                self.status.captures_dropped.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.status.writing.store(false, Ordering::Release);
        self.status.set_cache(&self.cache);
        Some(outcome)
    }

    /// 書き込みラインの遷移（非選択なら無視）
    #[inline]
    pub fn on_write_transition(&mut self) {
        if self.pins.is_selected() {
            self.capture.on_transition();
        }
    }

    /// 4µsサンプルタイマー満了（非選択なら無視）
    #[inline]
    pub fn on_sample_timer(&mut self) {
        if self.pins.is_selected() {
            self.capture.on_timer_expiry();
        }
    }

    /// サンプルタイマーのモデル時間を進める
    pub fn advance_write_clock(&mut self, ns: u32) {
        if self.pins.is_selected() {
            self.capture.elapse(ns);
        }
    }

    // ============================================================
    // イメージ
    // ============================================================

    /// イメージを置き換える
    ///
    /// ヘッドは起動位置へ、キャッシュは無効化、リーダーは先頭から。
    pub fn load_image(&mut self, bytes: &[u8]) -> Result<usize, EmulatorError> {
        if self.capture.is_active() {
            return Err(EmulatorError::CaptureInProgress);
        }
        let loaded = self.image.load(bytes);
        self.image_name = None;
        let bring_up = self.options.bring_up_track.min(MAX_LOGICAL_TRACK);
        self.stepper.reset_to(bring_up, self.pins.phase_bits());
        self.cache.invalidate();
        self.reader.start();
        self.status.set_head(&self.stepper.head());
        self.status.set_cache(&self.cache);
        Ok(loaded)
    }

    /// 保存先から名前でイメージを読み込む（以後の書き戻し先になる）
    pub fn load_named(&mut self, name: &str) -> Result<usize, EmulatorError> {
        if self.capture.is_active() {
            return Err(EmulatorError::CaptureInProgress);
        }
        let bytes = self.storage.load_image(name)?;
        let loaded = self.load_image(&bytes)?;
        self.image_name = Some(name.to_string());
        disk_log::log_image_loaded(name, bytes.len());
        log::info!("Loaded image {} ({} bytes)", name, bytes.len());
        Ok(loaded)
    }

    pub fn image_name(&self) -> Option<&str> {
        self.image_name.as_deref()
    }

    pub fn list_images(&self) -> Result<Vec<String>, EmulatorError> {
        Ok(self.storage.list_images()?)
    }

    // ============================================================
    // デバッグ API（プロトコルを通さず生イメージを直接操作）
    // ============================================================

    fn check_location(track: u8, sector: u8) -> Result<(), EmulatorError> {
        if track > MAX_LOGICAL_TRACK {
            return Err(EmulatorError::TrackOutOfRange(track));
        }
        if sector as usize >= SECTORS_PER_TRACK {
            return Err(EmulatorError::SectorOutOfRange(sector));
        }
        Ok(())
    }

    /// 生イメージからセクタを読む
    pub fn read_sector(&self, track: u8, sector: u8) -> Result<[u8; SECTOR_BYTES], EmulatorError> {
        Self::check_location(track, sector)?;
        self.image
            .sector(track, sector)
            .copied()
            .ok_or(EmulatorError::SectorOutOfRange(sector))
    }

    /// 生イメージへセクタを書く
    ///
    /// 選択中のトラックなら、キャプチャ分を書き戻してからキャッシュを作り直す。
    pub fn write_sector(
        &mut self,
        track: u8,
        sector: u8,
        data: &[u8; SECTOR_BYTES],
    ) -> Result<(), EmulatorError> {
        Self::check_location(track, sector)?;
        if self.capture.is_active() {
            return Err(EmulatorError::CaptureInProgress);
        }
        let selected = self.cache.selected_track() == Some(track);
        if selected {
            if let Some(report) = self.cache.reconcile(&mut self.image) {
                self.persist(&report);
            }
        }
        self.image.write_sector(track, sector, data);
        if selected {
            self.cache.refresh(&mut self.image);
        }
        self.status.set_cache(&self.cache);
        Ok(())
    }

    /// ヘッド位置を強制設定（フェーズはピンから再同期）
    pub fn set_track(&mut self, track: u8) -> Result<(), EmulatorError> {
        if self.capture.is_active() {
            return Err(EmulatorError::CaptureInProgress);
        }
        if !self.stepper.force_track(track, self.pins.phase_bits()) {
            return Err(EmulatorError::TrackOutOfRange(track));
        }
        let head = self.stepper.head();
        disk_log::log_track_forced(track, head.phase);
        self.status.set_head(&head);
        self.select_track(track);
        Ok(())
    }

    /// 送出中トラックの物理スロットをダンプ
    pub fn cache_sector(&self, slot: u8) -> Result<SlotDump, EmulatorError> {
        let front = self.cache.front();
        let bytes = front
            .slot(slot)
            .ok_or(EmulatorError::SectorOutOfRange(slot))?;
        debug_assert_eq!(bytes.len(), SLOT_BYTES);
        Ok(SlotDump {
            track: front.track(),
            slot,
            bytes: bytes.to_vec(),
            address: front.address_of(slot),
            decoded: front.decode_slot(slot),
        })
    }

    /// 今すぐ書き戻す（ダーティでなければ None）
    pub fn flush(&mut self) -> Result<Option<ReconcileReport>, EmulatorError> {
        if self.capture.is_active() {
            return Err(EmulatorError::CaptureInProgress);
        }
        let report = self.cache.reconcile(&mut self.image);
        if let Some(report) = &report {
            self.persist(report);
        }
        self.status.set_cache(&self.cache);
        Ok(report)
    }

    // ============================================================
    // 参照
    // ============================================================

    pub fn head(&self) -> HeadState {
        self.stepper.head()
    }

    pub fn logical_track(&self) -> u8 {
        self.stepper.logical_track()
    }

    pub fn line_mode(&self) -> LineMode {
        self.line.mode()
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    /// 直近のキャプチャバイト
    pub fn recent_capture(&self, n: usize) -> Vec<u8> {
        self.capture.recent_bytes(n)
    }

    pub fn cache(&self) -> &TrackCache {
        &self.cache
    }

    pub fn image(&self) -> &DiskImage {
        &self.image
    }

    pub fn reader(&self) -> &BitstreamReader {
        &self.reader
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn options(&self) -> &EmulatorOptions {
        &self.options
    }

    /// 共有ステータス（他スレッドへ渡す）
    pub fn status(&self) -> Arc<SharedStatus> {
        Arc::clone(&self.status)
    }

    /// リーダーとラインモードが一致しているか
    pub fn line_is_consistent(&self) -> bool {
        self.line.is_consistent(&self.reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::DSK_SIZE;
    use crate::nic::InterleaveTable;
    use crate::sim::{play, SimController, SimPins, WriteStream};
    use crate::storage::MemoryStorage;
    use crate::track::{ADDRESS_FIELD_OFFSET, SLOT_BYTES};
    use rand::Rng;

    type TestEmulator = FloppyEmulator<SimPins, MemoryStorage>;

    fn random_image() -> Vec<u8> {
        let mut bytes = vec![0u8; DSK_SIZE];
        rand::thread_rng().fill(&mut bytes[..]);
        bytes
    }

    fn setup() -> (TestEmulator, SimPins, Vec<u8>) {
        let pins = SimPins::new();
        let image = random_image();
        let mut storage = MemoryStorage::new();
        storage.insert("work.dsk", image.clone());
        let mut emu = FloppyEmulator::new(pins.clone(), storage, EmulatorOptions::default());
        emu.load_named("work.dsk").unwrap();
        pins.set_selected(true);
        pins.set_phases(0b0001);
        emu.tick(0);
        (emu, pins, image)
    }

    /// スロット `slot` のアドレスフィールド直後まで読み進める
    fn position_after_address(emu: &mut TestEmulator, slot: u8) {
        let target = (slot as usize * SLOT_BYTES + ADDRESS_FIELD_OFFSET + 11) * 8;
        while emu.reader().bit_position() != target {
            emu.read_bit();
        }
    }

    #[test]
    fn test_load_resets_to_bring_up_track() {
        let (emu, _pins, image) = setup();
        assert_eq!(emu.logical_track(), BRING_UP_TRACK);
        assert_eq!(emu.cache().cached_track(), Some(BRING_UP_TRACK));
        assert_eq!(emu.read_sector(5, 9).unwrap()[..], image[5 * 4096 + 9 * 256..5 * 4096 + 10 * 256]);
        assert_eq!(emu.image_name(), Some("work.dsk"));
    }

    #[test]
    fn test_stepping_selects_new_track() {
        let (mut emu, pins, _image) = setup();
        // 2ハーフトラック前進 = 1トラック
        pins.set_phases(0b0010);
        emu.tick(10);
        pins.set_phases(0b0100);
        emu.tick(10);
        assert_eq!(emu.logical_track(), BRING_UP_TRACK + 1);
        assert_eq!(emu.cache().selected_track(), Some(BRING_UP_TRACK + 1));
        // 周回境界まで送出は旧トラック
        assert_eq!(emu.cache().cached_track(), Some(BRING_UP_TRACK));
        emu.tick(4 * crate::track::TRACK_BITS as u32);
        assert_eq!(emu.cache().cached_track(), Some(BRING_UP_TRACK + 1));
        assert_eq!(emu.status().snapshot().cached_track, Some(BRING_UP_TRACK + 1));
    }

    #[test]
    fn test_stepper_runs_when_not_selected() {
        let (mut emu, pins, _image) = setup();
        pins.set_selected(false);
        pins.set_phases(0b1000);
        emu.tick(0);
        assert_eq!(emu.head().physical_track, BRING_UP_TRACK * 2 - 1);
        assert!(!emu.read_bit());
    }

    #[test]
    fn test_capture_then_track_change_reconciles() {
        let (mut emu, pins, image) = setup();
        let slot = 4u8;
        let sector = InterleaveTable::physical_to_logical(slot).unwrap();
        position_after_address(&mut emu, slot);

        let mut data = [0u8; SECTOR_BYTES];
        rand::thread_rng().fill(&mut data[..]);

        pins.set_write_enabled(true);
        assert!(emu.on_write_request_changed().is_none());
        assert_eq!(emu.line_mode(), LineMode::Write);
        assert!(emu.line_is_consistent());
        assert!(!emu.read_bit());
        play(&mut emu, &WriteStream::data_field(&data));
        pins.set_write_enabled(false);
        let outcome = emu.on_write_request_changed();
        assert_eq!(
            outcome,
            Some(CaptureOutcome::Installed { slot, sector, bytes: 349 })
        );
        assert_eq!(emu.line_mode(), LineMode::Read);
        assert!(emu.line_is_consistent());
        assert_eq!(emu.reader().bit_position(), 0);
        assert!(emu.cache().is_dirty());

        // 書き戻し前は生イメージはまだ古い
        let offset = BRING_UP_TRACK as usize * 4096 + sector as usize * 256;
        assert_eq!(emu.read_sector(BRING_UP_TRACK, sector).unwrap()[..], image[offset..offset + 256]);

        pins.set_phases(0b1000);
        emu.tick(0);
        pins.set_phases(0b0100);
        emu.tick(0);
        assert_eq!(emu.logical_track(), BRING_UP_TRACK - 1);
        assert_eq!(emu.read_sector(BRING_UP_TRACK, sector).unwrap(), data);
        // 他のセクタは変わらない
        let other = (sector + 1) % 16;
        let offset = BRING_UP_TRACK as usize * 4096 + other as usize * 256;
        assert_eq!(emu.read_sector(BRING_UP_TRACK, other).unwrap()[..], image[offset..offset + 256]);

        // トラックが保存先へ書き戻されている
        assert_eq!(emu.storage().saved_tracks(), &[("work.dsk".to_string(), BRING_UP_TRACK)]);
        let saved = emu.storage().image("work.dsk").unwrap();
        assert_eq!(&saved[BRING_UP_TRACK as usize * 4096 + sector as usize * 256..][..256], &data[..]);
        let status = emu.status().snapshot();
        assert_eq!(status.captures_installed, 1);
        assert!(status.last_persisted.is_some());
    }

    #[test]
    fn test_tick_does_not_rebuild_during_capture() {
        let (mut emu, pins, _image) = setup();
        position_after_address(&mut emu, 1);
        pins.set_write_enabled(true);
        emu.on_write_request_changed();
        pins.set_phases(0b0010);
        emu.tick(0);
        pins.set_phases(0b0100);
        emu.tick(0);
        // ヘッドは動くがキャッシュは触らない
        assert_eq!(emu.logical_track(), BRING_UP_TRACK + 1);
        assert_eq!(emu.cache().selected_track(), Some(BRING_UP_TRACK));
        assert!(matches!(emu.set_track(3), Err(EmulatorError::CaptureInProgress)));
        assert!(matches!(emu.flush(), Err(EmulatorError::CaptureInProgress)));
        pins.set_write_enabled(false);
        assert_eq!(
            emu.on_write_request_changed(),
            Some(CaptureOutcome::Dropped(crate::capture::DropReason::NoSync))
        );
        emu.tick(0);
        assert_eq!(emu.cache().selected_track(), Some(BRING_UP_TRACK + 1));
    }

    #[test]
    fn test_transitions_ignored_when_not_selected() {
        let (mut emu, pins, _image) = setup();
        position_after_address(&mut emu, 2);
        pins.set_write_enabled(true);
        emu.on_write_request_changed();
        pins.set_selected(false);
        play(&mut emu, &WriteStream::data_field(&[0x33; SECTOR_BYTES]));
        pins.set_selected(true);
        pins.set_write_enabled(false);
        assert_eq!(
            emu.on_write_request_changed(),
            Some(CaptureOutcome::Dropped(crate::capture::DropReason::NoSync))
        );
        assert!(!emu.cache().is_dirty());
    }

    #[test]
    fn test_write_request_ignored_when_not_selected() {
        let (mut emu, pins, _image) = setup();
        position_after_address(&mut emu, 2);
        pins.set_selected(false);
        emu.tick(0);
        pins.set_write_enabled(true);
        assert_eq!(emu.on_write_request_changed(), None);
        assert_eq!(emu.capture_state(), CaptureState::Idle);
        assert_eq!(emu.line_mode(), LineMode::Read);
        assert!(emu.line_is_consistent());

        // キャッシュは凍結されずに追従する
        pins.set_phases(0b0010);
        emu.tick(0);
        pins.set_phases(0b0100);
        emu.tick(0);
        assert_eq!(emu.logical_track(), BRING_UP_TRACK + 1);
        assert_eq!(emu.cache().selected_track(), Some(BRING_UP_TRACK + 1));

        pins.set_write_enabled(false);
        assert_eq!(emu.on_write_request_changed(), None);
        assert_eq!(emu.capture_stats().dropped(), 0);
        assert_eq!(emu.status().snapshot().captures_dropped, 0);
    }

    #[test]
    fn test_debug_sector_api() {
        let (mut emu, _pins, _image) = setup();
        let data = [0x4Eu8; SECTOR_BYTES];
        emu.write_sector(BRING_UP_TRACK, 2, &data).unwrap();
        assert_eq!(emu.read_sector(BRING_UP_TRACK, 2).unwrap(), data);
        // 選択中トラックはキャッシュにも反映される（次の周回で）
        emu.tick(4 * crate::track::TRACK_BITS as u32);
        let slot = InterleaveTable::logical_to_physical(2).unwrap();
        assert_eq!(emu.cache_sector(slot).unwrap().decoded, Ok(data));

        assert!(matches!(emu.read_sector(35, 0), Err(EmulatorError::TrackOutOfRange(35))));
        assert!(matches!(emu.write_sector(0, 16, &data), Err(EmulatorError::SectorOutOfRange(16))));
        assert!(matches!(emu.cache_sector(16), Err(EmulatorError::SectorOutOfRange(16))));
    }

    #[test]
    fn test_set_track() {
        let (mut emu, pins, _image) = setup();
        pins.set_phases(0b0100);
        emu.set_track(30).unwrap();
        assert_eq!(emu.head().physical_track, 60);
        assert_eq!(emu.head().last_phase, 2);
        assert_eq!(emu.cache().selected_track(), Some(30));
        assert!(matches!(emu.set_track(35), Err(EmulatorError::TrackOutOfRange(35))));
        let dump = emu.cache_sector(0).unwrap();
        assert_eq!(dump.bytes.len(), SLOT_BYTES);
        assert_eq!(dump.track, Some(BRING_UP_TRACK));
    }

    #[test]
    fn test_persist_failure_is_not_fatal() {
        let (mut emu, pins, _image) = setup();
        emu.storage_mut().fail_writes = true;
        position_after_address(&mut emu, 0);
        pins.set_write_enabled(true);
        emu.on_write_request_changed();
        play(&mut emu, &WriteStream::data_field(&[0x99; SECTOR_BYTES]));
        pins.set_write_enabled(false);
        emu.on_write_request_changed();
        let report = emu.flush().unwrap().unwrap();
        assert_eq!(report.decoded_count(), 16);
        assert_eq!(emu.read_sector(BRING_UP_TRACK, 0).unwrap(), [0x99; SECTOR_BYTES]);
        assert!(emu.status().snapshot().last_persisted.is_none());
    }

    #[test]
    fn test_sim_controller_writes_sector() {
        let pins = SimPins::new();
        let mut storage = MemoryStorage::new();
        storage.insert("blank.dsk", vec![0u8; DSK_SIZE]);
        let mut emu = FloppyEmulator::new(pins.clone(), storage, EmulatorOptions::default());
        emu.load_named("blank.dsk").unwrap();
        let mut controller = SimController::new(pins);

        let mut data = [0u8; SECTOR_BYTES];
        rand::thread_rng().fill(&mut data[..]);
        let outcome = controller.write_sector(&mut emu, 5, 11, &data);
        assert!(matches!(outcome, Some(CaptureOutcome::Installed { sector: 11, .. })));
        assert_eq!(emu.logical_track(), 5);

        emu.flush().unwrap();
        assert_eq!(emu.read_sector(5, 11).unwrap(), data);
        assert_eq!(emu.storage().saved_tracks().len(), 1);
    }
}
