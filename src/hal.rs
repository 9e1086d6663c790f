//! ドライブ側の入力ピン
//!
//! コントローラから来る信号: ステッパーフェーズ PH0-PH3、ドライブ選択（負論理）、
//! 書き込み許可（負論理）。書き込みデータと読み出しデータはエミュレータの
//! 割り込み入口・`read_bit` 側で扱う。

/// ドライブ入力ピンの読み取り
pub trait DrivePins {
    /// フェーズ入力（bit0 = PH0 ... bit3 = PH3）
    fn phase_bits(&self) -> u8;

    /// /ENABLE の生レベル（Low = 選択）
    fn select_level(&self) -> bool;

    /// /WREQ の生レベル（Low = 書き込み）
    fn write_request_level(&self) -> bool;

    /// ドライブが選択されているか
    #[inline]
    fn is_selected(&self) -> bool {
        !self.select_level()
    }

    /// 書き込み許可がアサートされているか
    #[inline]
    fn is_write_enabled(&self) -> bool {
        !self.write_request_level()
    }
}

impl<P: DrivePins + ?Sized> DrivePins for &P {
    fn phase_bits(&self) -> u8 {
        (**self).phase_bits()
    }

    fn select_level(&self) -> bool {
        (**self).select_level()
    }

    fn write_request_level(&self) -> bool {
        (**self).write_request_level()
    }
}
