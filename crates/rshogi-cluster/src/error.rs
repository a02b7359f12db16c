//! 起動時のエラー型。
//!
//! 起動後の失敗 (古い出力、読めない行、MultiPV の時間切れなど) はエラーに
//! せず、ログと `info string` で知らせるだけにする。

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    /// 設定ファイルが見つからない
    #[error("configuration file not found (searched: {searched:?})")]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("failed to parse TOML configuration {path}: {source}")]
    TomlConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to parse JSON configuration {path}: {source}")]
    JsonConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// 設定の中身が不正
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn engine '{name}' at {path}: {source}")]
    Spawn {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
