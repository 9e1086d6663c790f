//! ビットストリームリーダー
//!
//! キャッシュ表バッファのバイト列を MSB ファーストで 4µs/ビットで送出し、
//! 末尾に達したら先頭へ戻って送り続ける。実機ではタイマー駆動のシリアライザと
//! 循環転送で動くので、CPU が関与するのは周回境界の再起動だけ。

use crate::track::TRACK_BITS;
use crate::track_cache::TrackCache;

/// 1ビットの周期（マイクロ秒）
pub const BIT_PERIOD_US: u32 = 4;

/// ビットストリームリーダー
#[derive(Debug, Clone, Default)]
pub struct BitstreamReader {
    running: bool,
    /// トラック内のビット位置
    bit_pos: usize,
    /// 周回数
    wraps: u64,
    /// ビットに満たない経過時間（µs）
    carry_us: u32,
}

impl BitstreamReader {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// 先頭から送出を開始する（一時停止からの再開も常に先頭から）
    pub fn start(&mut self) {
        self.running = true;
        self.bit_pos = 0;
        self.carry_us = 0;
    }

    /// 停止して現在のバイト位置を返す
    pub fn stop(&mut self) -> usize {
        self.running = false;
        self.byte_offset()
    }

    #[inline]
    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    #[inline]
    pub fn byte_offset(&self) -> usize {
        self.bit_pos / 8
    }

    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    /// 読み出し位置を直接設定する（テスト・シミュレーション用）
    pub fn seek_bit(&mut self, bit: usize) {
        self.bit_pos = bit % TRACK_BITS;
    }

    /// 次の1ビットを送出する
    ///
    /// 停止中は常に0（ラインはLow）。
    #[inline]
    pub fn next_bit(&mut self, cache: &mut TrackCache) -> bool {
        if !self.running {
            return false;
        }
        let bit = cache.front().track().is_some() && cache.front().bit(self.bit_pos);
        self.bit_pos += 1;
        if self.bit_pos >= TRACK_BITS {
            self.wrap(cache);
        }
        bit
    }

    /// 経過時間ぶん回転を進める（送出ビットを誰も見ていない間の回転）
    ///
    /// 進めたビット数を返す。
    pub fn advance(&mut self, elapsed_us: u32, cache: &mut TrackCache) -> usize {
        if !self.running {
            return 0;
        }
        let total = self.carry_us as u64 + elapsed_us as u64;
        let bits = (total / BIT_PERIOD_US as u64) as usize;
        self.carry_us = (total % BIT_PERIOD_US as u64) as u32;

        let pos = self.bit_pos + bits;
        if pos >= TRACK_BITS {
            // 何周しても入れ替えは1回で十分
            self.wraps += (pos / TRACK_BITS) as u64 - 1;
            self.bit_pos = pos % TRACK_BITS;
            self.wrap_restart(cache);
        } else {
            self.bit_pos = pos;
        }
        bits
    }

    fn wrap(&mut self, cache: &mut TrackCache) {
        self.bit_pos = 0;
        self.wrap_restart(cache);
    }

    /// 周回境界の再起動処理（保留中のキャッシュ入れ替えをここで反映）
    #[inline]
    fn wrap_restart(&mut self, cache: &mut TrackCache) {
        self.wraps += 1;
        cache.publish_pending();
    }
}
