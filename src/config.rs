//! 設定ファイル管理モジュール
//!
//! エミュレータの設定をJSON形式で永続化

use crate::disk_log::{self, DiskLogLevel};
use crate::emulator::{EmulatorOptions, BRING_UP_TRACK};
use crate::stepper::MAX_LOGICAL_TRACK;
use crate::track::DEFAULT_VOLUME;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 設定ファイルのデフォルトファイル名
const CONFIG_FILENAME: &str = "a2floppy_config.json";

/// 実行ファイルのディレクトリを取得
pub fn get_exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// 相対パスを実行ファイルディレクトリからの絶対パスに解決
pub fn resolve_path(relative: &str) -> PathBuf {
    let path = Path::new(relative);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        get_exe_dir().join(relative)
    }
}

/// 設定ファイルのパスを取得
pub fn get_config_path() -> PathBuf {
    get_exe_dir().join(CONFIG_FILENAME)
}

/// エミュレータ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// ディスクイメージディレクトリ
    #[serde(default = "default_image_dir")]
    pub image_dir: String,
    /// 最後に使用したイメージ
    #[serde(default)]
    pub last_image: Option<String>,
    /// ロード時のヘッド位置（0-34）
    #[serde(default = "default_bring_up_track")]
    pub bring_up_track: u8,
    /// アドレスフィールドのボリューム番号
    #[serde(default = "default_volume")]
    pub volume: u8,
    /// 書き戻したトラックをイメージファイルへ保存
    #[serde(default = "default_persist_tracks")]
    pub persist_tracks: bool,
    /// 診断ログのカテゴリ（"flow", "state", "decide", "nibble", "all"）
    #[serde(default)]
    pub disk_log: Vec<String>,
}

fn default_image_dir() -> String { "disks".to_string() }
fn default_bring_up_track() -> u8 { BRING_UP_TRACK }
fn default_volume() -> u8 { DEFAULT_VOLUME }
fn default_persist_tracks() -> bool { true }

impl Default for Config {
    fn default() -> Self {
        Config {
            image_dir: default_image_dir(),
            last_image: None,
            bring_up_track: default_bring_up_track(),
            volume: default_volume(),
            persist_tracks: default_persist_tracks(),
            disk_log: Vec::new(),
        }
    }
}

impl Config {
    /// 設定ファイルを読み込む（実行ファイルと同じディレクトリから）
    pub fn load() -> Self {
        Self::load_from(get_config_path())
    }

    /// オプション指定で設定ファイルを読み込む
    ///
    /// 読み込んだ設定と、保存時に使うパスを返す。
    pub fn load_with_options(config_path: Option<&str>) -> (Self, PathBuf) {
        let path = match config_path {
            Some(path) => PathBuf::from(path),
            None => get_config_path(),
        };
        (Self::load_from(&path), path)
    }

    /// 指定したパスから設定を読み込む
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => config.sanitized(),
                Err(e) => {
                    log::warn!(
                        "Failed to parse config {:?}: {}, using defaults",
                        path.as_ref(),
                        e
                    );
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    /// 設定ファイルを保存する（実行ファイルと同じディレクトリに）
    pub fn save(&self) -> Result<(), String> {
        self.save_to(get_config_path())
    }

    /// 指定したパスに設定を保存する
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, json)
            .map_err(|e| format!("Failed to write config: {}", e))?;
        Ok(())
    }

    /// 範囲外の値を丸める
    fn sanitized(mut self) -> Self {
        self.bring_up_track = self.bring_up_track.min(MAX_LOGICAL_TRACK);
        self
    }

    /// イメージディレクトリの絶対パスを取得
    pub fn image_dir_path(&self) -> PathBuf {
        resolve_path(&self.image_dir)
    }

    /// ディレクトリが存在しなければ作成
    pub fn ensure_directories(&self) {
        let dir = self.image_dir_path();
        if !dir.exists() {
            if let Err(e) = fs::create_dir_all(&dir) {
                log::warn!("Failed to create {:?}: {}", dir, e);
            }
        }
    }

    /// 診断ログのカテゴリ
    pub fn disk_log_level(&self) -> DiskLogLevel {
        disk_log::parse_level(&self.disk_log.join(","))
    }

    /// エミュレータへ渡す設定
    pub fn emulator_options(&self) -> EmulatorOptions {
        EmulatorOptions {
            bring_up_track: self.bring_up_track.min(MAX_LOGICAL_TRACK),
            volume: self.volume,
            persist_tracks: self.persist_tracks,
        }
    }
}
