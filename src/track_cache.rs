//! トラックキャッシュ
//!
//! ヘッド位置に対応する1トラック分のエンコード済みイメージを保持する。
//! 表（front）はリーダーが送出中のバッファ、裏（back）は再構築用。
//! 裏で組み立てたトラックはリーダーが1周して先頭に戻った時点で表に出す
//! （送出中のサイクルを途中で書き換えない）。

use crate::disk_log;
use crate::image::{DiskImage, SECTORS_PER_TRACK};
use crate::nic::InterleaveTable;
use crate::track::{EncodedTrack, SlotError, TrackEncoder};

/// 書き戻し（リコンサイル）の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// 書き戻したトラック
    pub track: u8,
    /// 生イメージへ反映した論理セクタ（ビットマスク）
    pub decoded: u16,
    /// デコードに失敗してスキップした論理セクタ（ビットマスク）
    pub failed: u16,
}

impl ReconcileReport {
    pub fn decoded_count(&self) -> u32 {
        self.decoded.count_ones()
    }

    pub fn failed_count(&self) -> u32 {
        self.failed.count_ones()
    }
}

/// エンコード済みトラックのダブルバッファ
pub struct TrackCache {
    encoder: TrackEncoder,
    front: Box<EncodedTrack>,
    back: Box<EncodedTrack>,
    /// 裏バッファが次の周回で表に出る
    pending: bool,
}

impl TrackCache {
    pub fn new(encoder: TrackEncoder) -> Self {
        TrackCache {
            encoder,
            front: EncodedTrack::boxed(),
            back: EncodedTrack::boxed(),
            pending: false,
        }
    }

    pub fn encoder(&self) -> &TrackEncoder {
        &self.encoder
    }

    /// リーダーが送出中のトラック
    #[inline]
    pub fn front(&self) -> &EncodedTrack {
        &self.front
    }

    /// キャプチャの書き込み先
    #[inline]
    pub fn front_mut(&mut self) -> &mut EncodedTrack {
        &mut self.front
    }

    /// 送出中のトラック番号
    pub fn cached_track(&self) -> Option<u8> {
        self.front.track()
    }

    /// 選択済みのトラック番号（表に出る前の裏バッファを含む）
    pub fn selected_track(&self) -> Option<u8> {
        if self.pending {
            self.back.track()
        } else {
            self.front.track()
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.front.is_dirty()
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// 全バッファを無効化（イメージ差し替え時）
    pub fn invalidate(&mut self) {
        self.front.invalidate();
        self.back.invalidate();
        self.pending = false;
    }

    /// トラックを選択する
    ///
    /// 選択中と同じなら何もしない。異なる場合、表がダーティなら先に生イメージへ
    /// 書き戻してから、裏バッファを新しいトラックで組み立てる。
    /// 書き戻しを行った場合はその結果を返す。
    pub fn select(&mut self, track: u8, image: &mut DiskImage) -> Option<ReconcileReport> {
        if self.selected_track() == Some(track) {
            return None;
        }
        let report = self.reconcile(image);
        self.rebuild(track, image);
        report
    }

    /// 選択中のトラックを生イメージから作り直す（デバッグ書き込み後など）
    pub fn refresh(&mut self, image: &mut DiskImage) -> Option<ReconcileReport> {
        let track = self.selected_track()?;
        let report = self.reconcile(image);
        self.rebuild(track, image);
        report
    }

    /// 表バッファがダーティなら全スロットを生イメージへ書き戻す
    ///
    /// 失敗したスロットはそのセクタだけスキップし、残りは続行する。
    pub fn reconcile(&mut self, image: &mut DiskImage) -> Option<ReconcileReport> {
        if !self.front.is_dirty() {
            return None;
        }
        let track = self.front.track()?;
        let mut report = ReconcileReport { track, decoded: 0, failed: 0 };

        for slot in 0..SECTORS_PER_TRACK as u8 {
            let logical = match InterleaveTable::physical_to_logical(slot) {
                Some(s) => s,
                None => continue,
            };
            match self.front.decode_slot(slot) {
                Ok(data) => {
                    if image.write_sector(track, logical, &data) {
                        report.decoded |= 1 << logical;
                    }
                }
                Err(e) => {
                    report.failed |= 1 << logical;
                    if !matches!(e, SlotError::OutOfRange) {
                        disk_log::log_reconcile_skip(track, slot, logical, &e);
                    }
                }
            }
        }

        self.front.clear_dirty();
        disk_log::log_reconcile(&report);
        Some(report)
    }

    /// 裏バッファを組み立てる
    ///
    /// 表が無効（ロード直後）なら待たずに即座に入れ替える。
    fn rebuild(&mut self, track: u8, image: &DiskImage) {
        let raw = image.track(track).unwrap_or(&[]);
        self.back.rebuild(&self.encoder, raw, track);
        self.pending = true;
        if self.front.track().is_none() {
            self.publish_pending();
        }
    }

    /// 保留中の裏バッファを表に出す（リーダーの周回境界で呼ぶ）
    ///
    /// 入れ替えた場合 true。
    pub fn publish_pending(&mut self) -> bool {
        if !self.pending {
            return false;
        }
        std::mem::swap(&mut self.front, &mut self.back);
        self.pending = false;
        disk_log::log_cache_swap(self.front.track(), self.back.track());
        true
    }
}
