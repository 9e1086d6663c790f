//! トラックエンコーダ / エンコード済みトラックイメージ
//!
//! 16セクタ分の生データから、コントローラが読み取る NIC 形式の
//! トラックイメージ（6656バイト）を組み立てる。
//!
//! 1セクタ = 416バイト:
//! ```text
//!   +0   同期バイト FF ×22
//!   +22  セルフシンクパターン ×12
//!   +34  アドレスプロローグ D5 AA 96
//!   +37  ボリューム/トラック/セクタ/チェックサム（4-and-4, 8バイト）
//!   +45  アドレスエピローグ DE AA EB
//!   +48  同期バイト FF ×5
//!   +53  データプロローグ D5 AA AD
//!   +56  6-and-2 データ（343バイト）
//!   +399 データエピローグ DE AA EB
//!   +402 同期バイト FF ×14
//! ```

use crate::nic::{
    decode_6and2, encode_6and2, nibblize, unnibblize, InterleaveTable, NicError, NIC_FIELD_BYTES,
    SECTOR_BYTES,
};
use crate::image::SECTORS_PER_TRACK;
use std::fmt;

/// 1セクタ分のエンコード済みバイト数
pub const SLOT_BYTES: usize = 416;

/// 1トラック分のエンコード済みバイト数
pub const TRACK_BYTES: usize = SECTORS_PER_TRACK * SLOT_BYTES; // 6656

/// 1トラック分のビット数（1周）
pub const TRACK_BITS: usize = TRACK_BYTES * 8; // 53248

/// デフォルトボリューム番号
pub const DEFAULT_VOLUME: u8 = 0xFE;

pub const ADDRESS_PROLOGUE: [u8; 3] = [0xD5, 0xAA, 0x96];
pub const DATA_PROLOGUE: [u8; 3] = [0xD5, 0xAA, 0xAD];
pub const EPILOGUE: [u8; 3] = [0xDE, 0xAA, 0xEB];

/// セルフシンクパターン（10ビット同期 FF をビット詰めしたもの）
const SELF_SYNC: [u8; 12] = [
    0x03, 0xFC, 0xFF, 0x3F, 0xCF, 0xF3, 0xFC, 0xFF, 0x3F, 0xCF, 0xF3, 0xFC,
];

const LEAD_SYNC: usize = 22;
const GAP2_SYNC: usize = 5;
const TRAIL_SYNC: usize = 14;

/// スロット先頭からアドレスプロローグまで
pub const ADDRESS_FIELD_OFFSET: usize = LEAD_SYNC + SELF_SYNC.len(); // 34

/// スロット先頭からデータプロローグまで
pub const DATA_FIELD_OFFSET: usize = ADDRESS_FIELD_OFFSET + 3 + 8 + 3 + GAP2_SYNC; // 53

/// スロット先頭から6-and-2データまで
pub const DATA_OFFSET: usize = DATA_FIELD_OFFSET + 3; // 56

/// キャプチャしたデータフィールドとして書き戻す最大長（プロローグ+データ+エピローグ）
pub const DATA_FIELD_MAX: usize = 3 + NIC_FIELD_BYTES + 3; // 349

/// アドレスフィールドの内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressField {
    pub volume: u8,
    pub track: u8,
    pub sector: u8,
    pub checksum: u8,
}

impl AddressField {
    pub fn new(volume: u8, track: u8, sector: u8) -> Self {
        AddressField {
            volume,
            track,
            sector,
            checksum: volume ^ track ^ sector,
        }
    }

    /// プロローグ（D5 AA 96）から始まるバイト列を解析
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 11 || bytes[..3] != ADDRESS_PROLOGUE {
            return None;
        }
        Some(AddressField {
            volume: unnibblize(bytes[3], bytes[4]),
            track: unnibblize(bytes[5], bytes[6]),
            sector: unnibblize(bytes[7], bytes[8]),
            checksum: unnibblize(bytes[9], bytes[10]),
        })
    }

    /// チェックサムが一致するか
    pub fn is_valid(&self) -> bool {
        self.volume ^ self.track ^ self.sector == self.checksum
    }
}

/// データフィールド復元の失敗理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    /// スロット番号が範囲外
    OutOfRange,
    /// 期待位置に D5 AA AD がない
    MissingPrologue,
    /// 6-and-2 デコード失敗
    Decode(NicError),
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotError::OutOfRange => write!(f, "slot out of range"),
            SlotError::MissingPrologue => write!(f, "data prologue not found"),
            SlotError::Decode(e) => write!(f, "{}", e),
        }
    }
}

/// バイト列への書き込み（溢れた分は捨てる）
struct TrackWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> TrackWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        TrackWriter { buf, pos: 0 }
    }

    #[inline]
    fn put(&mut self, byte: u8) {
        if let Some(slot) = self.buf.get_mut(self.pos) {
            *slot = byte;
            self.pos += 1;
        }
    }

    fn put_all(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put(b);
        }
    }

    fn fill(&mut self, byte: u8, count: usize) {
        for _ in 0..count {
            self.put(byte);
        }
    }

    fn put_nibblized(&mut self, value: u8) {
        self.put_all(&nibblize(value));
    }

    fn put_6and2(&mut self, data: &[u8; SECTOR_BYTES]) {
        let start = self.pos.min(self.buf.len());
        let written = encode_6and2(data, &mut self.buf[start..]);
        self.pos += written;
    }

    /// 末尾の不足分を0で埋める
    ///
    /// 不足が1バイト以下なら埋めない（最終セクタを壊さないため）。
    fn finish(mut self) -> usize {
        let len = self.buf.len();
        if self.pos + 1 < len {
            self.buf[self.pos..].fill(0);
            self.pos = len;
        }
        self.pos
    }
}

/// トラックエンコーダ
#[derive(Debug, Clone, Copy)]
pub struct TrackEncoder {
    /// アドレスフィールドに書くボリューム番号
    pub volume: u8,
}

impl Default for TrackEncoder {
    fn default() -> Self {
        TrackEncoder { volume: DEFAULT_VOLUME }
    }
}

impl TrackEncoder {
    pub fn new(volume: u8) -> Self {
        TrackEncoder { volume }
    }

    /// 生トラック（論理セクタ順 16×256バイト）をエンコード
    ///
    /// `raw` が4096バイトに満たない場合、不足分は0として扱う。
    pub fn encode_into(&self, raw: &[u8], track: u8, out: &mut [u8; TRACK_BYTES]) {
        let mut w = TrackWriter::new(&mut out[..]);

        for slot in 0..SECTORS_PER_TRACK as u8 {
            // 物理スロット -> 論理セクタ（インターリーブ）
            let logical = InterleaveTable::physical_to_logical(slot).unwrap_or(slot);
            let mut src = [0u8; SECTOR_BYTES];
            let start = logical as usize * SECTOR_BYTES;
            if start < raw.len() {
                let end = (start + SECTOR_BYTES).min(raw.len());
                src[..end - start].copy_from_slice(&raw[start..end]);
            }

            w.fill(0xFF, LEAD_SYNC);
            w.put_all(&SELF_SYNC);

            // アドレスフィールド（セクタ番号は物理スロット）
            let addr = AddressField::new(self.volume, track, slot);
            w.put_all(&ADDRESS_PROLOGUE);
            w.put_nibblized(addr.volume);
            w.put_nibblized(addr.track);
            w.put_nibblized(addr.sector);
            w.put_nibblized(addr.checksum);
            w.put_all(&EPILOGUE);

            w.fill(0xFF, GAP2_SYNC);

            // データフィールド
            w.put_all(&DATA_PROLOGUE);
            w.put_6and2(&src);
            w.put_all(&EPILOGUE);

            w.fill(0xFF, TRAIL_SYNC);
        }

        w.finish();
    }

    /// エンコードしたトラックを返す（常に6656バイト）
    pub fn encode(&self, raw: &[u8], track: u8) -> Box<[u8; TRACK_BYTES]> {
        let mut out = Box::new([0u8; TRACK_BYTES]);
        self.encode_into(raw, track, &mut out);
        out
    }
}

/// エンコード済みトラックイメージ（キャッシュ1本分）
#[derive(Clone)]
pub struct EncodedTrack {
    bytes: [u8; TRACK_BYTES],
    /// 内容のトラック番号（None = 無効）
    track: Option<u8>,
    /// キャプチャで書き換えられ、まだ生イメージに戻していない
    dirty: bool,
}

impl Default for EncodedTrack {
    fn default() -> Self {
        EncodedTrack {
            bytes: [0; TRACK_BYTES],
            track: None,
            dirty: false,
        }
    }
}

impl EncodedTrack {
    /// ヒープ上に確保
    pub fn boxed() -> Box<Self> {
        Box::default()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8; TRACK_BYTES] {
        &self.bytes
    }

    #[inline]
    pub fn track(&self) -> Option<u8> {
        self.track
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// 無効化（トラック番号なし、クリーン）
    pub fn invalidate(&mut self) {
        self.track = None;
        self.dirty = false;
    }

    /// 生トラックから作り直す
    pub fn rebuild(&mut self, encoder: &TrackEncoder, raw: &[u8], track: u8) {
        encoder.encode_into(raw, track, &mut self.bytes);
        self.track = Some(track);
        self.dirty = false;
    }

    /// 指定ビット（MSBファースト）
    #[inline(always)]
    pub fn bit(&self, index: usize) -> bool {
        let byte = self.bytes[(index / 8) % TRACK_BYTES];
        (byte >> (7 - (index % 8))) & 1 != 0
    }

    /// 物理スロットのエンコード済みバイト列（416バイト）
    pub fn slot(&self, slot: u8) -> Option<&[u8]> {
        let start = slot as usize * SLOT_BYTES;
        self.bytes.get(start..start + SLOT_BYTES)
    }

    /// 位置 `from` から後方に `window` バイトまでアドレスプロローグを探す（循環）
    ///
    /// 見つかればプロローグ位置と、+7/+8 から復元した物理セクタ番号を返す。
    pub fn locate_address_backward(&self, from: usize, window: usize) -> Option<(usize, u8)> {
        let at = |pos: usize| self.bytes[pos % TRACK_BYTES];
        let from = from % TRACK_BYTES;
        for back in 0..window {
            let pos = (from + TRACK_BYTES * 2 - back) % TRACK_BYTES;
            if at(pos) == ADDRESS_PROLOGUE[0]
                && at(pos + 1) == ADDRESS_PROLOGUE[1]
                && at(pos + 2) == ADDRESS_PROLOGUE[2]
            {
                return Some((pos, unnibblize(at(pos + 7), at(pos + 8))));
            }
        }
        None
    }

    /// キャプチャしたデータフィールド（D5 AA AD から）を物理スロットへ書き込む
    ///
    /// 書き込んだバイト数を返し、1バイト以上書けばダーティにする。
    pub fn install_data_field(&mut self, slot: u8, field: &[u8]) -> usize {
        if slot as usize >= SECTORS_PER_TRACK {
            return 0;
        }
        let pos = slot as usize * SLOT_BYTES + DATA_FIELD_OFFSET;
        let len = field.len().min(DATA_FIELD_MAX);
        self.bytes[pos..pos + len].copy_from_slice(&field[..len]);
        if len > 0 {
            self.dirty = true;
        }
        len
    }

    /// 物理スロットのデータフィールドを256バイトに復元
    pub fn decode_slot(&self, slot: u8) -> Result<[u8; SECTOR_BYTES], SlotError> {
        if slot as usize >= SECTORS_PER_TRACK {
            return Err(SlotError::OutOfRange);
        }
        let start = slot as usize * SLOT_BYTES;
        let prologue = start + DATA_FIELD_OFFSET;
        if self.bytes[prologue..prologue + 3] != DATA_PROLOGUE {
            return Err(SlotError::MissingPrologue);
        }
        let data = start + DATA_OFFSET;
        decode_6and2(&self.bytes[data..data + NIC_FIELD_BYTES]).map_err(SlotError::Decode)
    }

    /// 物理スロットのアドレスフィールドを解析
    pub fn address_of(&self, slot: u8) -> Option<AddressField> {
        let start = slot as usize * SLOT_BYTES + ADDRESS_FIELD_OFFSET;
        self.bytes.get(start..start + 11).and_then(AddressField::parse)
    }

    /// テスト・デバッグ用に生バイトを書き換える
    #[cfg(test)]
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8; TRACK_BYTES] {
        &mut self.bytes
    }
}
