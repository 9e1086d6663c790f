//! ステッパーモーター位置トラッカー
//!
//! コントローラが駆動する4相ステッパーのフェーズ信号（PH0-PH3）だけから
//! ヘッド位置を推定する。実機のトラック0センサーは存在しない。

/// 論理トラック数
pub const TRACKS: usize = 35;

/// 物理トラック（ハーフトラック単位）の最大値
pub const MAX_PHYSICAL_TRACK: u8 = 69;

/// 論理トラックの最大値
pub const MAX_LOGICAL_TRACK: u8 = (TRACKS - 1) as u8;

/// 1ホット（ビットが1つだけ立っている）フェーズ値をフェーズ番号に変換
///
/// 0x00や複数相同時ONは遷移中のノイズとして無視する。
#[inline]
pub fn one_hot_phase(sample: u8) -> Option<u8> {
    match sample & 0x0F {
        0b0001 => Some(0),
        0b0010 => Some(1),
        0b0100 => Some(2),
        0b1000 => Some(3),
        _ => None,
    }
}

/// ヘッド状態
///
/// `logical_track` は常に `physical_track >> 1` から導出する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadState {
    /// 物理トラック（0-69）
    pub physical_track: u8,
    /// 現在のフェーズ（0-3）
    pub phase: u8,
    /// 最後に受理したフェーズ（方向判定用）
    pub last_phase: u8,
}

impl Default for HeadState {
    fn default() -> Self {
        HeadState {
            physical_track: 0,
            phase: 0,
            last_phase: 0,
        }
    }
}

impl HeadState {
    /// 論理トラック（0-34）
    #[inline(always)]
    pub fn logical_track(&self) -> u8 {
        (self.physical_track >> 1).min(MAX_LOGICAL_TRACK)
    }

    /// トラック0にいるか（センサーがないのでソフトウェア判定）
    #[inline]
    pub fn is_at_track0(&self) -> bool {
        self.physical_track == 0
    }
}

/// フェーズサンプル処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    /// 1ホットでないサンプル（無視）
    Ignored,
    /// 前回と同じフェーズ
    Unchanged,
    /// 隣接しないフェーズへのジャンプ（位置は変えない）
    Skipped,
    /// ヘッド移動（クランプで実際には動かなかった場合も含む）
    Stepped { from: u8, to: u8 },
}

impl StepEvent {
    /// 論理トラックが変わったか
    pub fn changed_track(&self) -> bool {
        match *self {
            StepEvent::Stepped { from, to } => (from >> 1) != (to >> 1),
            _ => false,
        }
    }
}

/// ステッパーフェーズからヘッド位置を追跡する
#[derive(Debug, Clone, Default)]
pub struct StepperPositionTracker {
    head: HeadState,
}

impl StepperPositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在のヘッド状態
    #[inline]
    pub fn head(&self) -> HeadState {
        self.head
    }

    /// 論理トラック（0-34）
    #[inline]
    pub fn logical_track(&self) -> u8 {
        self.head.logical_track()
    }

    /// 物理トラック（0-69）
    #[inline]
    pub fn physical_track(&self) -> u8 {
        self.head.physical_track
    }

    /// 4ビットのフェーズサンプルを処理
    ///
    /// 前進: PH0->PH1->PH2->PH3->PH0、後退はその逆。
    pub fn sample(&mut self, phases: u8) -> StepEvent {
        let ofs = match one_hot_phase(phases) {
            Some(ofs) => ofs,
            None => return StepEvent::Ignored,
        };

        let last = self.head.last_phase;
        if ofs == last {
            return StepEvent::Unchanged;
        }

        let from = self.head.physical_track;
        let event = if ofs == (last + 1) & 3 {
            let to = from.saturating_add(1).min(MAX_PHYSICAL_TRACK);
            StepEvent::Stepped { from, to }
        } else if ofs == (last + 3) & 3 {
            StepEvent::Stepped { from, to: from.saturating_sub(1) }
        } else {
            StepEvent::Skipped
        };

        if let StepEvent::Stepped { to, .. } = event {
            self.head.physical_track = to;
        }
        self.head.last_phase = ofs;
        self.head.phase = ofs;
        event
    }

    /// トラックを強制設定（デバッグ用）
    ///
    /// フェーズはハードウェアの現在値から再同期する（1ホットでなければ据え置き）。
    pub fn force_track(&mut self, track: u8, phases: u8) -> bool {
        if track > MAX_LOGICAL_TRACK {
            return false;
        }
        self.head.physical_track = track * 2;
        self.resync_phase(phases);
        true
    }

    /// フェーズだけをハードウェアに合わせる（位置は変えない）
    pub fn resync_phase(&mut self, phases: u8) {
        if let Some(ofs) = one_hot_phase(phases) {
            self.head.phase = ofs;
            self.head.last_phase = ofs;
        }
    }

    /// 起動時トラックへリセット
    ///
    /// フェーズ信号が無効（0x00等）ならPH0を仮定し、最初の有効フェーズで同期する。
    pub fn reset_to(&mut self, track: u8, phases: u8) {
        let track = track.min(MAX_LOGICAL_TRACK);
        let ofs = one_hot_phase(phases).unwrap_or(0);
        self.head = HeadState {
            physical_track: track * 2,
            phase: ofs,
            last_phase: ofs,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORWARD: [u8; 4] = [0b0001, 0b0010, 0b0100, 0b1000];

    fn tracker_at(track: u8) -> StepperPositionTracker {
        let mut t = StepperPositionTracker::new();
        t.reset_to(track, 0b0001);
        t
    }

    #[test]
    fn test_forward_steps() {
        let mut t = tracker_at(5);
        assert_eq!(t.physical_track(), 10);
        for n in 1..=7usize {
            t.sample(FORWARD[n % 4]);
        }
        assert_eq!(t.physical_track(), 17);
        assert_eq!(t.logical_track(), 8);
    }

    #[test]
    fn test_backward_steps() {
        let mut t = tracker_at(5);
        for n in 1..=4usize {
            t.sample(FORWARD[(4 - n % 4) % 4]);
        }
        assert_eq!(t.physical_track(), 6);
    }

    #[test]
    fn test_clamp_at_both_ends() {
        let mut t = tracker_at(0);
        for n in 1..=6usize {
            t.sample(FORWARD[(4 - n % 4) % 4]);
        }
        assert_eq!(t.physical_track(), 0);
        assert!(t.head().is_at_track0());

        let mut t = tracker_at(34);
        for n in 1..=10usize {
            t.sample(FORWARD[n % 4]);
        }
        assert_eq!(t.physical_track(), MAX_PHYSICAL_TRACK);
        assert_eq!(t.logical_track(), MAX_LOGICAL_TRACK);
    }

    #[test]
    fn test_non_adjacent_jump_updates_last_phase_only() {
        let mut t = tracker_at(10);
        assert_eq!(t.sample(0b0100), StepEvent::Skipped);
        assert_eq!(t.physical_track(), 20);
        assert_eq!(t.head().last_phase, 2);
        // PH2 -> PH3 は前進として扱われる
        t.sample(0b1000);
        assert_eq!(t.physical_track(), 21);
    }

    #[test]
    fn test_noise_is_ignored() {
        let mut t = tracker_at(3);
        for noise in [0x00, 0x03, 0x05, 0x0F, 0x0C] {
            assert_eq!(t.sample(noise), StepEvent::Ignored);
        }
        assert_eq!(t.sample(0b0001), StepEvent::Unchanged);
        assert_eq!(t.physical_track(), 6);
    }

    #[test]
    fn test_track_change_detection() {
        let mut t = tracker_at(3);
        let e = t.sample(0b0010);
        assert_eq!(e, StepEvent::Stepped { from: 6, to: 7 });
        assert!(!e.changed_track());
        let e = t.sample(0b0100);
        assert!(e.changed_track());
        assert_eq!(t.logical_track(), 4);
    }

    #[test]
    fn test_force_track_resyncs_phase() {
        let mut t = tracker_at(0);
        assert!(t.force_track(20, 0b1000));
        assert_eq!(t.physical_track(), 40);
        assert_eq!(t.head().last_phase, 3);
        assert!(!t.force_track(35, 0b0001));
        assert_eq!(t.logical_track(), 20);
    }
}
