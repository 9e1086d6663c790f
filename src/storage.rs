//! ディスクイメージの保存先
//!
//! イメージの読み込みと、書き戻し時のトラック単位保存を行う。
//! 呼ばれるのはロード時とリコンサイル時だけで、リアルタイム処理の外。

use crate::image::{BYTES_PER_TRACK, DSK_SIZE};
use crate::stepper::TRACKS;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// 対応する拡張子
pub const IMAGE_EXTENSIONS: [&str; 2] = ["dsk", "do"];

/// 保存先のエラー
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    NotFound(String),
    InvalidName(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "I/O error: {}", e),
            StorageError::NotFound(name) => write!(f, "image not found: {}", name),
            StorageError::InvalidName(name) => write!(f, "invalid image name: {}", name),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

/// イメージの保存先
pub trait StorageBackend {
    /// イメージ全体を読み込む
    fn load_image(&mut self, name: &str) -> Result<Vec<u8>, StorageError>;

    /// 1トラック分（4096バイト）を `track * 4096` の位置へ書き込む
    fn save_track(&mut self, name: &str, track: u8, bytes: &[u8]) -> Result<(), StorageError>;

    /// 利用可能なイメージ名
    fn list_images(&self) -> Result<Vec<String>, StorageError>;
}

fn check_track(name: &str, track: u8, bytes: &[u8]) -> Result<(), StorageError> {
    if track as usize >= TRACKS || bytes.len() != BYTES_PER_TRACK {
        return Err(StorageError::InvalidName(format!(
            "{} (track {}, {} bytes)",
            name,
            track,
            bytes.len()
        )));
    }
    Ok(())
}

/// ディレクトリ内の .dsk/.do ファイル
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        FileStorage {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 名前からパスを求める（ディレクトリ外は拒否）
    ///
    /// 絶対パスはそのまま使う（CLI から直接指定された場合）。
    pub fn path_for(&self, name: &str) -> Result<PathBuf, StorageError> {
        let path = Path::new(name);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        if name.is_empty()
            || path
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(path))
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

impl StorageBackend for FileStorage {
    fn load_image(&mut self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        let data = fs::read(&path)?;
        if data.len() != DSK_SIZE {
            log::warn!(
                "Image {:?} is {} bytes (expected {}), padding/truncating",
                path,
                data.len(),
                DSK_SIZE
            );
        }
        Ok(data)
    }

    fn save_track(&mut self, name: &str, track: u8, bytes: &[u8]) -> Result<(), StorageError> {
        check_track(name, track, bytes)?;
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(track as u64 * BYTES_PER_TRACK as u64))?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }

    fn list_images(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && has_image_extension(&path) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// メモリ上の保存先（テスト・デモ用）
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    images: HashMap<String, Vec<u8>>,
    /// 保存されたトラック（名前, トラック）の履歴
    saved: Vec<(String, u8)>,
    /// 書き込みを失敗させる
    pub fail_writes: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, bytes: Vec<u8>) {
        self.images.insert(name.to_string(), bytes);
    }

    pub fn image(&self, name: &str) -> Option<&[u8]> {
        self.images.get(name).map(|v| v.as_slice())
    }

    pub fn saved_tracks(&self) -> &[(String, u8)] {
        &self.saved
    }
}

impl StorageBackend for MemoryStorage {
    fn load_image(&mut self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.images
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    fn save_track(&mut self, name: &str, track: u8, bytes: &[u8]) -> Result<(), StorageError> {
        check_track(name, track, bytes)?;
        if self.fail_writes {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "write protected",
            )));
        }
        let image = self
            .images
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        if image.len() < DSK_SIZE {
            image.resize(DSK_SIZE, 0);
        }
        let start = track as usize * BYTES_PER_TRACK;
        image[start..start + BYTES_PER_TRACK].copy_from_slice(bytes);
        self.saved.push((name.to_string(), track));
        Ok(())
    }

    fn list_images(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.images.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
