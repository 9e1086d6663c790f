//! ドライブ診断ログ
//!
//! 原則:
//! 1. ログは「現象」ではなく「判断」を記録
//! 2. 状態遷移のみ記録（ビット単位の処理は記録しない）
//! 3. レベル分離: FLOW / STATE / DECIDE / NIBBLE
//!
//! 出力は `log` クレート経由。カテゴリが無効ならフォーマットもしない。

use crate::capture::CaptureOutcome;
use crate::line::LineMode;
use crate::track::SlotError;
use crate::track_cache::ReconcileReport;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// ログカテゴリ
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DiskLogLevel: u32 {
        /// L1: 何が起きているか（人間向け）
        const FLOW   = 0b0001;
        /// L2: 状態遷移（開発者向け）
        const STATE  = 0b0010;
        /// L2: 判断（破棄・書き戻し）
        const DECIDE = 0b0100;
        /// L3: 生データ（短時間のみ）
        const NIBBLE = 0b1000;
    }
}

/// グローバルログレベル
static LOG_LEVEL: AtomicU32 = AtomicU32::new(0);

/// ログレベルを設定
pub fn set_log_level(level: DiskLogLevel) {
    LOG_LEVEL.store(level.bits(), Ordering::Relaxed);
}

/// 現在のログレベルを取得
pub fn get_log_level() -> DiskLogLevel {
    DiskLogLevel::from_bits_truncate(LOG_LEVEL.load(Ordering::Relaxed))
}

/// ログレベルが有効かチェック
#[inline]
pub fn is_enabled(flag: DiskLogLevel) -> bool {
    (LOG_LEVEL.load(Ordering::Relaxed) & flag.bits()) != 0
}

/// カテゴリ名の並び（"flow+state"、"flow,decide"、"all"、"none"）をパース
///
/// 知らない名前は無視する。
pub fn parse_level(s: &str) -> DiskLogLevel {
    let mut level = DiskLogLevel::empty();

    for part in s.to_lowercase().split(['+', ',']) {
        match part.trim() {
            "flow" => level |= DiskLogLevel::FLOW,
            "state" => level |= DiskLogLevel::STATE,
            "decide" => level |= DiskLogLevel::DECIDE,
            "nibble" => level |= DiskLogLevel::NIBBLE,
            "all" => level = DiskLogLevel::all(),
            _ => {}
        }
    }

    level
}

/// ニブルリングバッファ（最後のN個を保持）
pub struct NibbleRing {
    buf: Vec<u8>,
    pos: usize,
    capacity: usize,
}

impl NibbleRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: vec![0; capacity],
            pos: 0,
            capacity,
        }
    }

    pub fn push(&mut self, nibble: u8) {
        self.buf[self.pos % self.capacity] = nibble;
        self.pos += 1;
    }

    /// 最新からN個を取得（古い順）
    pub fn last_n(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.capacity).min(self.pos);
        let mut result = Vec::with_capacity(n);
        for i in 0..n {
            let idx = (self.pos - n + i) % self.capacity;
            result.push(self.buf[idx]);
        }
        result
    }

    /// ダンプ出力
    pub fn dump(&self, n: usize) {
        if !is_enabled(DiskLogLevel::NIBBLE) {
            return;
        }
        let data = self.last_n(n);
        log::info!("[DUMP] Last {} nibbles:", data.len());
        for line in data.chunks(16) {
            let hex: Vec<String> = line.iter().map(|b| format!("{:02X}", b)).collect();
            log::info!("[DUMP] {}", hex.join(" "));
        }
    }
}

impl Default for NibbleRing {
    fn default() -> Self {
        Self::new(256)
    }
}

fn track_label(track: Option<u8>) -> String {
    match track {
        Some(t) => t.to_string(),
        None => "-".to_string(),
    }
}

// ============================================================
// ログ出力関数
// ============================================================

/// [FLOW] イメージ読み込み
pub fn log_image_loaded(name: &str, bytes: usize) {
    if is_enabled(DiskLogLevel::FLOW) {
        log::info!("[DISK] Image loaded: {} ({} bytes)", name, bytes);
    }
}

/// [STATE] トラック変更
pub fn log_track_change(from: u8, to: u8) {
    if is_enabled(DiskLogLevel::STATE) {
        log::info!("[STATE] Track {} -> {}", from, to);
    }
}

/// [STATE] ヘッド強制移動（デバッグ）
pub fn log_track_forced(track: u8, phase: u8) {
    if is_enabled(DiskLogLevel::STATE) {
        log::info!("[STATE] Track forced to {} (phase {})", track, phase);
    }
}

/// [STATE] キャッシュ入れ替え（周回境界）
pub fn log_cache_swap(front: Option<u8>, back: Option<u8>) {
    if is_enabled(DiskLogLevel::STATE) {
        log::info!(
            "[STATE] Cache swap: now streaming T={} (was T={})",
            track_label(front),
            track_label(back)
        );
    }
}

/// [STATE] ラインモード切り替え
pub fn log_line_mode(from: LineMode, to: LineMode) {
    if is_enabled(DiskLogLevel::STATE) {
        log::info!("[STATE] Line {} -> {}", from, to);
    }
}

/// [FLOW] キャプチャ開始
pub fn log_capture_start(track: Option<u8>, offset: usize, slot: Option<u8>, sector: Option<u8>) {
    if is_enabled(DiskLogLevel::FLOW) {
        match (slot, sector) {
            (Some(slot), Some(sector)) => log::info!(
                "[WRITE] Start T={} pos={} slot={} S={}",
                track_label(track),
                offset,
                slot,
                sector
            ),
            _ => log::info!(
                "[WRITE] Start T={} pos={} sector unknown",
                track_label(track),
                offset
            ),
        }
    }
}

/// [FLOW]/[DECIDE] キャプチャ終了
pub fn log_capture_end(track: Option<u8>, outcome: &CaptureOutcome, len: usize) {
    match outcome {
        CaptureOutcome::Installed { slot, sector, bytes } => {
            if is_enabled(DiskLogLevel::FLOW) {
                log::info!(
                    "[WRITE] Installed T={} slot={} S={} ({} bytes)",
                    track_label(track),
                    slot,
                    sector,
                    bytes
                );
            }
        }
        CaptureOutcome::Dropped(reason) => {
            if is_enabled(DiskLogLevel::DECIDE) {
                log::info!(
                    "[WRITE] Dropped T={}: {} ({} bytes captured)",
                    track_label(track),
                    reason,
                    len
                );
            }
        }
    }
}

/// [DECIDE] 書き戻しでスキップしたセクタ
pub fn log_reconcile_skip(track: u8, slot: u8, sector: u8, error: &SlotError) {
    if is_enabled(DiskLogLevel::DECIDE) {
        log::info!(
            "[SYNC] Skip T={} slot={} S={}: {}",
            track,
            slot,
            sector,
            error
        );
    }
}

/// [DECIDE] 書き戻し結果
pub fn log_reconcile(report: &ReconcileReport) {
    if is_enabled(DiskLogLevel::DECIDE) {
        log::info!(
            "[SYNC] Reconciled T={}: {} decoded, {} skipped",
            report.track,
            report.decoded_count(),
            report.failed_count()
        );
    }
}

/// [FLOW] トラック保存
pub fn log_track_persisted(name: &str, track: u8) {
    if is_enabled(DiskLogLevel::FLOW) {
        log::info!("[SAVE] {} T={} written", name, track);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nibble_ring() {
        let mut ring = NibbleRing::new(8);
        for i in 0..10 {
            ring.push(i as u8);
        }
        let last4 = ring.last_n(4);
        assert_eq!(last4, vec![6, 7, 8, 9]);
        assert_eq!(ring.last_n(20).len(), 8);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("none"), DiskLogLevel::empty());
        assert_eq!(
            parse_level("flow+decide"),
            DiskLogLevel::FLOW | DiskLogLevel::DECIDE
        );
        assert_eq!(parse_level("STATE, nibble"), DiskLogLevel::STATE | DiskLogLevel::NIBBLE);
        assert_eq!(parse_level("all"), DiskLogLevel::all());
        assert_eq!(parse_level("bogus"), DiskLogLevel::empty());
    }

    #[test]
    fn test_log_level() {
        set_log_level(DiskLogLevel::FLOW | DiskLogLevel::STATE);
        assert!(is_enabled(DiskLogLevel::FLOW));
        assert!(is_enabled(DiskLogLevel::STATE));
        assert!(!is_enabled(DiskLogLevel::DECIDE));
        assert!(!is_enabled(DiskLogLevel::NIBBLE));
        assert_eq!(get_log_level(), DiskLogLevel::FLOW | DiskLogLevel::STATE);
        set_log_level(DiskLogLevel::empty());
    }
}
