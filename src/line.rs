//! 読み出しライン調停
//!
//! 物理的に1本のラインとそのタイミング資源を、リーダー（Read）と
//! 書き込みキャプチャ（Write）で排他的に使う。リーダーの停止・再開は
//! 必ずここを通す。

use crate::disk_log;
use crate::reader::BitstreamReader;
use std::fmt;

/// ラインの使用モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    /// リーダーがラインを駆動
    Read,
    /// キャプチャがタイミング資源を使用（リーダー停止）
    Write,
}

impl fmt::Display for LineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineMode::Read => write!(f, "READ"),
            LineMode::Write => write!(f, "WRITE"),
        }
    }
}

/// ライン調停器
#[derive(Debug, Clone)]
pub struct LineArbiter {
    mode: LineMode,
    /// モード切り替え回数
    switches: u32,
}

impl Default for LineArbiter {
    fn default() -> Self {
        LineArbiter {
            mode: LineMode::Read,
            switches: 0,
        }
    }
}

impl LineArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn mode(&self) -> LineMode {
        self.mode
    }

    pub fn switches(&self) -> u32 {
        self.switches
    }

    /// Writeモードへ入る
    ///
    /// リーダーを完全に止めてから切り替え、停止位置（バイト）を返す。
    /// すでにWriteモードなら None。
    pub fn enter_write(&mut self, reader: &mut BitstreamReader) -> Option<usize> {
        if self.mode == LineMode::Write {
            return None;
        }
        let offset = reader.stop();
        self.mode = LineMode::Write;
        self.switches += 1;
        disk_log::log_line_mode(LineMode::Read, LineMode::Write);
        Some(offset)
    }

    /// Readモードへ戻る（リーダーは先頭から再開）
    ///
    /// すでにReadモードなら false。
    pub fn exit_write(&mut self, reader: &mut BitstreamReader) -> bool {
        if self.mode == LineMode::Read {
            return false;
        }
        self.mode = LineMode::Read;
        reader.start();
        self.switches += 1;
        disk_log::log_line_mode(LineMode::Write, LineMode::Read);
        true
    }

    /// リーダーの稼働状態とモードが一致しているか
    pub fn is_consistent(&self, reader: &BitstreamReader) -> bool {
        reader.is_running() == (self.mode == LineMode::Read)
    }
}
