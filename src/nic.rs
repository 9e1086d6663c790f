//! NIC 6-and-2 コーデック
//!
//! Disk II コントローラが読み書きする自己同期（self-clocking）バイト列と
//! 生セクタデータ（256バイト）の相互変換。
//! テーブル類はすべて固定データで、状態を持たない。

use std::fmt;

/// 1セクタの生データサイズ
pub const SECTOR_BYTES: usize = 256;

/// 6-and-2 エンコード後のデータフィールド長（86 + 256 + 1）
pub const NIC_FIELD_BYTES: usize = 343;

/// 補助バイト（下位2ビット群）の数
const AUX_BYTES: usize = 86;

/// 6-and-2エンコーディングテーブル
///
/// 最上位ビットは常に1、連続する0ビットは最大1つ。
/// コントローラ互換のため標準テーブルとバイト単位で一致させること。
pub const NIB_TABLE: [u8; 64] = [
    0x96, 0x97, 0x9A, 0x9B, 0x9D, 0x9E, 0x9F, 0xA6,
    0xA7, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, 0xB2, 0xB3,
    0xB4, 0xB5, 0xB6, 0xB7, 0xB9, 0xBA, 0xBB, 0xBC,
    0xBD, 0xBE, 0xBF, 0xCB, 0xCD, 0xCE, 0xCF, 0xD3,
    0xD6, 0xD7, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE,
    0xDF, 0xE5, 0xE6, 0xE7, 0xE9, 0xEA, 0xEB, 0xEC,
    0xED, 0xEE, 0xEF, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6,
    0xF7, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

/// 逆引きテーブルの無効マーカー
pub const INVALID_NIB: u8 = 0xFF;

/// 6-and-2デコードテーブル（エンコード済みバイト -> 6ビット値）
pub const INV_TABLE: [u8; 256] = build_inverse_table();

const fn build_inverse_table() -> [u8; 256] {
    let mut table = [INVALID_NIB; 256];
    let mut i = 0;
    while i < NIB_TABLE.len() {
        table[NIB_TABLE[i] as usize] = i as u8;
        i += 1;
    }
    table
}

/// 下位2ビットの並べ替えテーブル（bit 0-1 / 2-3 / 4-5 に配置、D0とD1を入れ替え）
const FLIP_BIT1: [u8; 4] = [0, 2, 1, 3];
const FLIP_BIT2: [u8; 4] = [0, 8, 4, 12];
const FLIP_BIT3: [u8; 4] = [0, 32, 16, 48];

/// FLIP_BITxの逆変換（2ビット値の入れ替えは自己逆）
#[inline(always)]
fn unflip(bits: u8) -> u8 {
    FLIP_BIT1[(bits & 0x03) as usize]
}

/// DOS 3.3セクターインターリーブ（物理スロット -> 論理セクタ）
const SECTOR_SCRAMBLE: [u8; 16] = [0, 7, 14, 6, 13, 5, 12, 4, 11, 3, 10, 2, 9, 1, 8, 15];

/// 物理スロット（トラック上の位置）と論理セクタ番号の対応表
pub struct InterleaveTable;

impl InterleaveTable {
    /// スロット数
    pub const LEN: usize = SECTOR_SCRAMBLE.len();

    /// 物理スロット -> 論理セクタ
    #[inline]
    pub fn physical_to_logical(slot: u8) -> Option<u8> {
        SECTOR_SCRAMBLE.get(slot as usize).copied()
    }

    /// 論理セクタ -> 物理スロット
    pub fn logical_to_physical(sector: u8) -> Option<u8> {
        SECTOR_SCRAMBLE
            .iter()
            .position(|&s| s == sector)
            .map(|slot| slot as u8)
    }
}

/// 4-and-4 エンコード（アドレスフィールド用）
///
/// byte1 = 奇数ビット (D7,D5,D3,D1) | 0xAA、byte2 = 偶数ビット (D6,D4,D2,D0) | 0xAA
#[inline]
pub fn nibblize(value: u8) -> [u8; 2] {
    [0xAA | (value >> 1), 0xAA | value]
}

/// 4-and-4 デコード
#[inline]
pub fn unnibblize(odd: u8, even: u8) -> u8 {
    ((odd & 0x55) << 1) | (even & 0x55)
}

/// 6-and-2 デコードエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicError {
    /// 入力が343バイトに満たない
    TooShort { len: usize },
    /// テーブルに存在しないバイト
    InvalidCode { position: usize, code: u8 },
}

impl fmt::Display for NicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NicError::TooShort { len } => {
                write!(f, "data field too short: {} bytes (need {})", len, NIC_FIELD_BYTES)
            }
            NicError::InvalidCode { position, code } => {
                write!(f, "invalid 6-and-2 code ${:02X} at offset {}", code, position)
            }
        }
    }
}

impl std::error::Error for NicError {}

/// 6-and-2エンコーディング
///
/// 256バイト -> 343バイト。`out` は343バイト以上であること。
/// 出力先が短い場合は書ける所まで書いて打ち切る（戻り値は書き込んだバイト数）。
pub fn encode_6and2(data: &[u8; SECTOR_BYTES], out: &mut [u8]) -> usize {
    let mut written = 0;
    let mut ox = 0u8;
    let mut emit = |x: u8, out: &mut [u8]| {
        if let Some(slot) = out.get_mut(written) {
            *slot = NIB_TABLE[((x ^ ox) & 0x3F) as usize];
            written += 1;
        }
        ox = x;
    };

    // 補助バイト: data[i], data[i+86], data[i+172] の下位2ビット
    for i in 0..AUX_BYTES {
        let c = data.get(i + 172).copied().unwrap_or(0);
        let x = FLIP_BIT1[(data[i] & 3) as usize]
            | FLIP_BIT2[(data[i + 86] & 3) as usize]
            | FLIP_BIT3[(c & 3) as usize];
        emit(x, out);
    }

    // メインデータ（上位6ビット）
    for &byte in data.iter() {
        emit(byte >> 2, out);
    }

    // 最終チェックサム
    if let Some(slot) = out.get_mut(written) {
        *slot = NIB_TABLE[(ox & 0x3F) as usize];
        written += 1;
    }

    written
}

/// 6-and-2エンコーディング（配列を返す版）
pub fn encode_sector(data: &[u8; SECTOR_BYTES]) -> [u8; NIC_FIELD_BYTES] {
    let mut out = [0u8; NIC_FIELD_BYTES];
    encode_6and2(data, &mut out);
    out
}

/// 6-and-2エンコードされたデータをデコード
///
/// `encoded` はデータプロローグ（D5 AA AD）直後からの343バイト以上。
/// 344バイト目以降（エピローグ等）は無視する。
pub fn decode_6and2(encoded: &[u8]) -> Result<[u8; SECTOR_BYTES], NicError> {
    if encoded.len() < NIC_FIELD_BYTES {
        return Err(NicError::TooShort { len: encoded.len() });
    }

    // XORチェーンを解いて6ビット値に戻す
    let mut values = [0u8; NIC_FIELD_BYTES];
    let mut ox = 0u8;
    for (i, &code) in encoded[..NIC_FIELD_BYTES].iter().enumerate() {
        let raw = INV_TABLE[code as usize];
        if raw == INVALID_NIB {
            return Err(NicError::InvalidCode { position: i, code });
        }
        values[i] = raw ^ ox;
        ox = values[i];
    }

    let mut data = [0u8; SECTOR_BYTES];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = values[AUX_BYTES + i] << 2;
    }

    // 補助ビットを結合して完全な8ビットデータを復元
    for (i, &x) in values[..AUX_BYTES].iter().enumerate() {
        data[i] |= unflip(x);
        data[i + 86] |= unflip(x >> 2);
        if let Some(byte) = data.get_mut(i + 172) {
            *byte |= unflip(x >> 4);
        }
    }

    Ok(data)
}
