//! 書き込みキャプチャエンジン
//!
//! 書き込み許可（WE）がアサートされている間、書き込みラインのフラックス遷移と
//! 4µsサンプルタイマーからビット列を復元し、1フィールド分のバイト列を組み立てる。
//! WE解除時にデータフィールドならキャッシュの該当スロットへ書き込む。
//!
//! 状態: Idle -> LocatingSector -> Sampling -> Flushing -> Idle
//!
//! 遷移割り込みとタイマー割り込みは同じバイト組み立て状態を更新する。
//! 呼び出し側はこの構造体を単一の所有者（クリティカルセクション内）から操作すること。

use crate::disk_log::{self, NibbleRing};
use crate::nic::InterleaveTable;
use crate::track::{EncodedTrack, ADDRESS_PROLOGUE, DATA_PROLOGUE};
use std::fmt;

/// キャプチャバッファの上限
pub const CAPTURE_MAX: usize = 350;

/// セクタ位置を後方に探す範囲（バイト）
pub const LOCATE_WINDOW: usize = 450;

/// リセット後、この番号のビットは捨てる（フォーマット上の余剰ビット）
pub const SKIP_BIT: u32 = 17;

/// ビットセル長（ナノ秒）
pub const BIT_CELL_NS: u32 = 4000;

/// 同期バイト
const SYNC_BYTE: u8 = 0xD5;

/// キャプチャの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    LocatingSector,
    Sampling,
    Flushing,
}

/// キャプチャを捨てた理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// D5 が見つからなかった
    NoSync,
    /// 3バイト未満
    TooShort,
    /// アドレスフィールド（D5 AA 96）
    AddressField,
    /// D5 AA AD で始まらない
    NotDataField,
    /// 書き込み先セクタが特定できなかった
    UnknownSector,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NoSync => write!(f, "NO_SYNC"),
            DropReason::TooShort => write!(f, "TOO_SHORT"),
            DropReason::AddressField => write!(f, "ADDRESS_FIELD"),
            DropReason::NotDataField => write!(f, "NOT_DATA_FIELD"),
            DropReason::UnknownSector => write!(f, "UNKNOWN_SECTOR"),
        }
    }
}

/// キャプチャ完了時の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// キャッシュへ書き込んだ
    Installed { slot: u8, sector: u8, bytes: usize },
    /// 捨てた（応答チャネルがないので黙って捨てる）
    Dropped(DropReason),
}

/// キャプチャ統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub installed: u32,
    pub no_sync: u32,
    pub address_fields: u32,
    pub unknown_sector: u32,
    /// 短すぎる・データフィールドでない
    pub malformed: u32,
}

impl CaptureStats {
    fn record(&mut self, outcome: &CaptureOutcome) {
        match outcome {
            CaptureOutcome::Installed { .. } => self.installed += 1,
            CaptureOutcome::Dropped(DropReason::NoSync) => self.no_sync += 1,
            CaptureOutcome::Dropped(DropReason::AddressField) => self.address_fields += 1,
            CaptureOutcome::Dropped(DropReason::UnknownSector) => self.unknown_sector += 1,
            CaptureOutcome::Dropped(_) => self.malformed += 1,
        }
    }

    /// 捨てたキャプチャの合計
    pub fn dropped(&self) -> u32 {
        self.no_sync + self.address_fields + self.unknown_sector + self.malformed
    }
}

/// 4µsサンプルタイマーのモデル
///
/// 遷移があると位相をリセットし、次の満了を次セルの中ほどに合わせる。
/// 満了のたびに「遷移なし」= 0 ビットとなる。
#[derive(Debug, Clone, Default)]
pub struct SampleTimer {
    armed: bool,
    now_ns: u64,
    next_ns: u64,
}

impl SampleTimer {
    /// 起動（最初の満了はセルの中央）
    pub fn arm(&mut self) {
        self.armed = true;
        self.now_ns = 0;
        self.next_ns = (BIT_CELL_NS / 2) as u64;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// 遷移による位相リセット
    pub fn resync(&mut self) {
        self.next_ns = self.now_ns + (BIT_CELL_NS + BIT_CELL_NS / 2) as u64;
    }

    /// 時間を進め、その間の満了回数を返す
    pub fn elapse(&mut self, ns: u32) -> u32 {
        if !self.armed {
            return 0;
        }
        let target = self.now_ns + ns as u64;
        let mut expiries = 0;
        while self.next_ns <= target {
            expiries += 1;
            self.next_ns += BIT_CELL_NS as u64;
        }
        self.now_ns = target;
        expiries
    }
}

/// 書き込みキャプチャエンジン
pub struct WriteCaptureEngine {
    state: CaptureState,
    timer: SampleTimer,
    /// 書き込み先の物理スロット
    slot: Option<u8>,
    /// 書き込み先の論理セクタ
    sector: Option<u8>,
    /// 開始時のリーダー位置（バイト）
    start_offset: usize,
    /// シフトレジスタ
    data: u8,
    /// 同期後、現在のバイトに入ったビット数
    bit_count: u8,
    /// リセット後に処理したビット数（余剰ビット判定用）
    bits_processed: u32,
    synced: bool,
    buf: [u8; CAPTURE_MAX],
    len: usize,
    stats: CaptureStats,
    ring: NibbleRing,
}

impl Default for WriteCaptureEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteCaptureEngine {
    pub fn new() -> Self {
        WriteCaptureEngine {
            state: CaptureState::Idle,
            timer: SampleTimer::default(),
            slot: None,
            sector: None,
            start_offset: 0,
            data: 0,
            bit_count: 0,
            bits_processed: 0,
            synced: false,
            buf: [0; CAPTURE_MAX],
            len: 0,
            stats: CaptureStats::default(),
            ring: NibbleRing::new(CAPTURE_MAX),
        }
    }

    #[inline]
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// キャプチャ中か（Idle以外）
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state != CaptureState::Idle
    }

    /// 特定した物理スロット
    pub fn slot(&self) -> Option<u8> {
        self.slot
    }

    /// 特定した論理セクタ
    pub fn sector(&self) -> Option<u8> {
        self.sector
    }

    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// 組み立て済みバイト列
    pub fn captured(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// 直近のキャプチャバイト（古い順）
    pub fn recent_bytes(&self, n: usize) -> Vec<u8> {
        self.ring.last_n(n)
    }

    /// WEアサート: 書き込み先セクタを特定してサンプリングを開始
    ///
    /// `track` はリーダーが送出していたトラック、`offset` は停止位置（バイト）。
    /// 特定できた物理スロットを返す。
    pub fn begin(&mut self, track: &EncodedTrack, offset: usize) -> Option<u8> {
        self.state = CaptureState::LocatingSector;
        self.start_offset = offset;

        // 範囲外のセクタ番号（データ中の偽プロローグ）は未特定扱い
        let located = track
            .locate_address_backward(offset, LOCATE_WINDOW)
            .and_then(|(_, slot)| {
                InterleaveTable::physical_to_logical(slot).map(|sector| (slot, sector))
            });
        self.slot = located.map(|(slot, _)| slot);
        self.sector = located.map(|(_, sector)| sector);

        self.data = 0;
        self.bit_count = 0;
        self.bits_processed = 0;
        self.synced = false;
        self.len = 0;

        self.timer.arm();
        self.state = CaptureState::Sampling;
        disk_log::log_capture_start(track.track(), offset, self.slot, self.sector);
        self.slot
    }

    /// 書き込みラインの遷移（ビット1）
    #[inline]
    pub fn on_transition(&mut self) {
        if self.state != CaptureState::Sampling {
            return;
        }
        self.timer.resync();
        self.push_bit(true);
    }

    /// サンプルタイマー満了（遷移なし = ビット0）
    #[inline]
    pub fn on_timer_expiry(&mut self) {
        if self.state != CaptureState::Sampling {
            return;
        }
        self.push_bit(false);
    }

    /// タイマーモデルの時間を進める（満了分だけ0を入れる）
    pub fn elapse(&mut self, ns: u32) {
        if self.state != CaptureState::Sampling {
            return;
        }
        for _ in 0..self.timer.elapse(ns) {
            self.push_bit(false);
        }
    }

    #[inline]
    fn push_bit(&mut self, bit: bool) {
        self.bits_processed = self.bits_processed.saturating_add(1);
        if self.bits_processed == SKIP_BIT {
            return;
        }

        self.data = (self.data << 1) | bit as u8;

        if !self.synced {
            // バイト境界がまだないので毎ビット照合
            if self.data == SYNC_BYTE {
                self.synced = true;
                self.buf[0] = SYNC_BYTE;
                self.len = 1;
                self.data = 0;
                self.bit_count = 0;
                self.bits_processed = 0;
            }
            return;
        }

        self.bit_count += 1;
        if self.bit_count == 8 {
            if self.len < CAPTURE_MAX {
                self.buf[self.len] = self.data;
                self.len += 1;
            }
            self.data = 0;
            self.bit_count = 0;
        }
    }

    /// WE解除: サンプルタイマーを止める
    pub fn stop_sampling(&mut self) {
        if self.state == CaptureState::Sampling {
            self.timer.disarm();
            self.state = CaptureState::Flushing;
        }
    }

    /// フィールド完了処理（データフィールドならキャッシュへ書き込む）
    pub fn complete(&mut self, track: &mut EncodedTrack) -> CaptureOutcome {
        self.stop_sampling();
        let outcome = self.classify();
        let outcome = match outcome {
            Ok(slot) => {
                let bytes = track.install_data_field(slot, &self.buf[..self.len]);
                CaptureOutcome::Installed {
                    slot,
                    sector: self.sector.unwrap_or(slot),
                    bytes,
                }
            }
            Err(reason) => CaptureOutcome::Dropped(reason),
        };

        for &b in &self.buf[..self.len] {
            self.ring.push(b);
        }
        self.stats.record(&outcome);
        disk_log::log_capture_end(track.track(), &outcome, self.len);
        if disk_log::is_enabled(disk_log::DiskLogLevel::NIBBLE) {
            self.ring.dump(self.len.min(64));
        }

        self.state = CaptureState::Idle;
        outcome
    }

    /// WE解除時の一連の処理
    pub fn end(&mut self, track: &mut EncodedTrack) -> CaptureOutcome {
        self.stop_sampling();
        self.complete(track)
    }

    fn classify(&self) -> Result<u8, DropReason> {
        if !self.synced {
            return Err(DropReason::NoSync);
        }
        let field = &self.buf[..self.len];
        if field.len() < 3 {
            return Err(DropReason::TooShort);
        }
        if field[..3] == ADDRESS_PROLOGUE {
            return Err(DropReason::AddressField);
        }
        if field[..3] != DATA_PROLOGUE {
            return Err(DropReason::NotDataField);
        }
        self.slot.ok_or(DropReason::UnknownSector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::{decode_6and2, encode_sector, SECTOR_BYTES};
    use crate::sim::{FluxEvent, WriteStream};
    use crate::track::{TrackEncoder, DATA_FIELD_OFFSET, SLOT_BYTES};
    use rand::Rng;

    fn blank_track(track: u8) -> Box<EncodedTrack> {
        let mut encoded = EncodedTrack::boxed();
        encoded.rebuild(&TrackEncoder::default(), &[0u8; 4096], track);
        encoded
    }

    /// セル単位で遷移/満了を直接入れる
    fn feed_cells(engine: &mut WriteCaptureEngine, stream: &WriteStream) {
        for &bit in stream.bits() {
            if bit {
                engine.on_transition();
            } else {
                engine.on_timer_expiry();
            }
        }
    }

    /// 時間軸で入れる（タイマーモデル経由）
    fn feed_timed(engine: &mut WriteCaptureEngine, stream: &WriteStream) {
        for event in stream.flux_events() {
            match event {
                FluxEvent::Transition => engine.on_transition(),
                FluxEvent::Elapse(ns) => engine.elapse(ns),
            }
        }
    }

    fn random_sector() -> [u8; SECTOR_BYTES] {
        let mut sector = [0u8; SECTOR_BYTES];
        rand::thread_rng().fill(&mut sector[..]);
        sector
    }

    #[test]
    fn test_data_field_capture_installs_sector() {
        let mut track = blank_track(6);
        let mut engine = WriteCaptureEngine::new();
        let slot = 9u8;
        let offset = slot as usize * SLOT_BYTES + 47;
        assert_eq!(engine.begin(&track, offset), Some(slot));
        assert_eq!(engine.sector(), InterleaveTable::physical_to_logical(slot));

        let sector = random_sector();
        feed_cells(&mut engine, &WriteStream::data_field(&sector));
        assert!(engine.is_synced());
        assert_eq!(&engine.captured()[..3], &DATA_PROLOGUE);
        assert_eq!(decode_6and2(&engine.captured()[3..]), Ok(sector));

        let outcome = engine.end(&mut track);
        assert_eq!(
            outcome,
            CaptureOutcome::Installed { slot, sector: 3, bytes: 349 }
        );
        assert!(track.is_dirty());
        assert_eq!(track.decode_slot(slot), Ok(sector));
        assert_eq!(engine.state(), CaptureState::Idle);
        assert_eq!(engine.stats().installed, 1);
    }

    #[test]
    fn test_timed_capture_matches_cell_capture() {
        let mut track = blank_track(0);
        let mut engine = WriteCaptureEngine::new();
        engine.begin(&track, 2 * SLOT_BYTES + 50);
        let sector = random_sector();
        feed_timed(&mut engine, &WriteStream::data_field(&sector));
        assert_eq!(decode_6and2(&engine.captured()[3..]), Ok(sector));
        assert!(matches!(engine.end(&mut track), CaptureOutcome::Installed { slot: 2, .. }));
    }

    #[test]
    fn test_skip_bit_is_discarded_after_sync() {
        let mut engine = WriteCaptureEngine::new();
        engine.begin(&blank_track(0), 50);
        // 余剰ビットを入れずに流すと AD 以降が1ビットずれる
        let mut bits = Vec::new();
        for byte in [0xFFu8, 0xFF, 0xFF, 0xD5, 0xAA, 0xAD, 0x96, 0x96] {
            for i in (0..8).rev() {
                bits.push(byte >> i & 1 != 0);
            }
        }
        for bit in bits {
            if bit {
                engine.on_transition();
            } else {
                engine.on_timer_expiry();
            }
        }
        assert_eq!(&engine.captured()[..3], &[0xD5, 0xAA, 0xAD]);
        assert_ne!(engine.captured()[3], 0x96);
    }

    #[test]
    fn test_sync_found_with_sliding_window() {
        let mut engine = WriteCaptureEngine::new();
        engine.begin(&blank_track(0), 50);
        // 先頭の半端なビットの後でも D5 を見つける
        let stream = WriteStream::new().raw_bits(&[false, true, true]).sync(4).bytes(&[0xD5, 0xAA, 0xAD]);
        feed_cells(&mut engine, &stream);
        assert!(engine.is_synced());
        assert_eq!(engine.captured(), &[0xD5, 0xAA, 0xAD]);
    }

    #[test]
    fn test_address_field_is_dropped() {
        let mut track = blank_track(4);
        let before = *track.bytes();
        let mut engine = WriteCaptureEngine::new();
        engine.begin(&track, 3 * SLOT_BYTES + 20);
        let stream = WriteStream::new().sync(5).bytes(&[0xD5, 0xAA, 0x96, 0xFF, 0xFE]);
        feed_cells(&mut engine, &stream);
        assert_eq!(
            engine.end(&mut track),
            CaptureOutcome::Dropped(DropReason::AddressField)
        );
        assert!(!track.is_dirty());
        assert_eq!(track.bytes()[..], before[..]);
        assert_eq!(engine.stats().address_fields, 1);
    }

    #[test]
    fn test_unknown_sector_is_dropped() {
        let mut track = blank_track(4);
        // プロローグを全部消して探索を失敗させる
        for slot in 0..16 {
            track.bytes_mut()[slot * SLOT_BYTES + 34] = 0xFF;
        }
        let mut engine = WriteCaptureEngine::new();
        assert_eq!(engine.begin(&track, 100), None);
        feed_cells(&mut engine, &WriteStream::data_field(&[0u8; SECTOR_BYTES]));
        assert_eq!(
            engine.end(&mut track),
            CaptureOutcome::Dropped(DropReason::UnknownSector)
        );
        assert!(!track.is_dirty());
    }

    #[test]
    fn test_stray_prologue_with_bad_sector_is_dropped() {
        let mut track = blank_track(4);
        // スロット2のデータ中に偽のアドレスプロローグ（セクタ番号 $FF）
        let forged = 2 * SLOT_BYTES + DATA_FIELD_OFFSET + 20;
        let bytes = track.bytes_mut();
        bytes[forged..forged + 3].copy_from_slice(&[0xD5, 0xAA, 0x96]);
        bytes[forged + 7] = 0xFF;
        bytes[forged + 8] = 0xFF;

        let mut engine = WriteCaptureEngine::new();
        assert_eq!(engine.begin(&track, forged + 20), None);
        assert_eq!(engine.sector(), None);
        feed_cells(&mut engine, &WriteStream::data_field(&random_sector()));
        assert_eq!(
            engine.end(&mut track),
            CaptureOutcome::Dropped(DropReason::UnknownSector)
        );
        assert!(!track.is_dirty());
        assert_eq!(engine.stats().installed, 0);
        assert_eq!(engine.stats().unknown_sector, 1);
    }

    #[test]
    fn test_no_sync_is_dropped() {
        let mut track = blank_track(1);
        let mut engine = WriteCaptureEngine::new();
        engine.begin(&track, 60);
        feed_cells(&mut engine, &WriteStream::new().sync(40));
        assert_eq!(engine.end(&mut track), CaptureOutcome::Dropped(DropReason::NoSync));
        assert_eq!(engine.stats().dropped(), 1);
    }

    #[test]
    fn test_buffer_is_capped() {
        let mut track = blank_track(1);
        let mut engine = WriteCaptureEngine::new();
        engine.begin(&track, 60);
        let sector = encode_sector(&random_sector());
        let stream = WriteStream::new()
            .sync(5)
            .bytes(&DATA_PROLOGUE)
            .bytes(&sector)
            .bytes(&[0xDE, 0xAA, 0xEB, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        feed_cells(&mut engine, &stream);
        assert_eq!(engine.captured().len(), CAPTURE_MAX);
        engine.end(&mut track);
        // 349バイトを超えた分はスロットの外に書かない
        assert_eq!(engine.slot(), Some(0));
        assert_eq!(track.bytes()[DATA_FIELD_OFFSET + 349], 0xFF);
    }

    #[test]
    fn test_events_ignored_when_idle() {
        let mut engine = WriteCaptureEngine::new();
        engine.on_transition();
        engine.on_timer_expiry();
        engine.elapse(100_000);
        assert_eq!(engine.state(), CaptureState::Idle);
        assert!(engine.captured().is_empty());
    }

    #[test]
    fn test_sample_timer_model() {
        let mut timer = SampleTimer::default();
        assert_eq!(timer.elapse(10_000), 0);
        timer.arm();
        assert_eq!(timer.elapse(1_999), 0);
        assert_eq!(timer.elapse(1), 1);
        timer.resync();
        assert_eq!(timer.elapse(5_999), 0);
        assert_eq!(timer.elapse(1), 1);
        assert_eq!(timer.elapse(8_000), 2);
        timer.disarm();
        assert!(!timer.is_armed());
    }
}
