//! 生ディスクイメージ（DSK/DO形式のリニアバイト列）
//!
//! トラック × セクタ × 256バイト。セクタ内容の正本はここにある。

use crate::nic::SECTOR_BYTES;
use crate::stepper::TRACKS;

/// ディスクの定数
pub const SECTORS_PER_TRACK: usize = 16;
pub const BYTES_PER_TRACK: usize = SECTORS_PER_TRACK * SECTOR_BYTES;
pub const DSK_SIZE: usize = TRACKS * BYTES_PER_TRACK; // 143360 bytes

/// 生ディスクイメージ
///
/// 起動時に一度だけ確保し、ロード時は中身を丸ごと置き換える。
#[derive(Clone)]
pub struct DiskImage {
    data: Box<[u8]>,
}

impl Default for DiskImage {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskImage {
    pub fn new() -> Self {
        // 140KBをスタックに置かないようヒープに確保（長さは常にDSK_SIZE）
        DiskImage {
            data: vec![0u8; DSK_SIZE].into_boxed_slice(),
        }
    }

    /// イメージを置き換える（短ければ0埋め、長ければ切り詰め）
    ///
    /// 実際にコピーしたバイト数を返す。
    pub fn load(&mut self, bytes: &[u8]) -> usize {
        let len = bytes.len().min(DSK_SIZE);
        self.data[..len].copy_from_slice(&bytes[..len]);
        self.data[len..].fill(0);
        len
    }

    /// 全体をクリア
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// イメージ全体
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    /// トラック・セクタのオフセット
    #[inline]
    fn sector_offset(track: u8, sector: u8) -> Option<usize> {
        if (track as usize) < TRACKS && (sector as usize) < SECTORS_PER_TRACK {
            Some(track as usize * BYTES_PER_TRACK + sector as usize * SECTOR_BYTES)
        } else {
            None
        }
    }

    /// セクタを参照
    pub fn sector(&self, track: u8, sector: u8) -> Option<&[u8; SECTOR_BYTES]> {
        let offset = Self::sector_offset(track, sector)?;
        self.data[offset..offset + SECTOR_BYTES].try_into().ok()
    }

    /// セクタを上書き
    pub fn write_sector(&mut self, track: u8, sector: u8, bytes: &[u8; SECTOR_BYTES]) -> bool {
        match Self::sector_offset(track, sector) {
            Some(offset) => {
                self.data[offset..offset + SECTOR_BYTES].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// トラック全体（4096バイト）
    pub fn track(&self, track: u8) -> Option<&[u8]> {
        let offset = Self::sector_offset(track, 0)?;
        Some(&self.data[offset..offset + BYTES_PER_TRACK])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_pads_and_truncates() {
        let mut image = DiskImage::new();
        assert_eq!(image.load(&[0x5A; 1000]), 1000);
        assert_eq!(image.as_bytes()[999], 0x5A);
        assert_eq!(image.as_bytes()[1000], 0);

        let big = vec![0x11u8; DSK_SIZE + 77];
        assert_eq!(image.load(&big), DSK_SIZE);
        assert!(image.as_bytes().iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_sector_access() {
        let mut image = DiskImage::new();
        let data = [0xC3u8; SECTOR_BYTES];
        assert!(image.write_sector(34, 15, &data));
        assert_eq!(image.sector(34, 15), Some(&data));
        assert_eq!(image.as_bytes()[DSK_SIZE - 1], 0xC3);
        assert!(!image.write_sector(35, 0, &data));
        assert!(image.sector(0, 16).is_none());
        assert_eq!(image.track(1).map(|t| t.len()), Some(BYTES_PER_TRACK));
    }
}
