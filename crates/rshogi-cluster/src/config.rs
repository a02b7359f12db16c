//! クラスタ設定の読み込み。
//!
//! TOML を基本とし、拡張子が `.json` のファイルは JSON として読む。
//! JSON は従来のプロキシの `proxy-setting.json` (camelCase のキー、
//! `arguments` が 1 本の文字列) もそのまま受け付ける。
//! 起動時に一度だけ読み、以後は変更しない。

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{ClusterError, ClusterResult};
use crate::time_budget::TimeOptions;

/// 設定ファイルを探すときの既定のファイル名 (先にあるものを優先)。
pub const DEFAULT_CONFIG_NAMES: [&str; 3] =
    ["rshogi-cluster.toml", "rshogi-cluster.json", "proxy-setting.json"];

/// setoption の上書き 1 件。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OptionOverride {
    pub name: String,
    pub value: String,
}

/// 下流エンジン 1 本の起動設定。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineDescriptor {
    #[serde(alias = "engineName")]
    pub name: String,
    #[serde(alias = "fileName")]
    pub path: PathBuf,
    /// 文字列なら空白で区切る
    #[serde(default, alias = "arguments", deserialize_with = "deserialize_args")]
    pub args: Vec<String>,
    #[serde(default, alias = "workingDirectory")]
    pub working_directory: Option<PathBuf>,
    /// 詰み専門エンジン。合議には加わらず `go mate infinite` で詰みだけを探す。
    #[serde(default, alias = "mateEngine")]
    pub mate_specialist: bool,
    /// 上流の本来の go を受け取って時間を管理する役。
    #[serde(default, alias = "timeKeeper")]
    pub time_keeper: bool,
    /// `position` と `go` をエコーするエンジンか。`false` なら送った時点で受理済みとみなす。
    #[serde(default = "default_true", alias = "echoCommands")]
    pub echo_commands: bool,
    #[serde(default, alias = "optionOverrides", deserialize_with = "null_as_empty")]
    pub option_overrides: Vec<OptionOverride>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Arguments {
    Line(String),
    List(Vec<String>),
}

fn deserialize_args<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<Arguments>::deserialize(deserializer)? {
        Some(Arguments::Line(line)) => line.split_whitespace().map(str::to_string).collect(),
        Some(Arguments::List(list)) => list,
        None => Vec::new(),
    })
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// MultiPV 探索 (先読み局面の候補手列挙) の時間設定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MultiPvSettings {
    pub search_time_ms: u64,
    /// 探索時間に足す待ち時間の余裕
    pub timeout_margin_ms: u64,
    /// 探索中のエンジンに stop を送ってから止まるまで待つ時間
    pub stop_timeout_ms: u64,
}

impl Default for MultiPvSettings {
    fn default() -> Self {
        Self {
            search_time_ms: 1000,
            timeout_margin_ms: 1000,
            stop_timeout_ms: 3000,
        }
    }
}

impl MultiPvSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.search_time_ms + self.timeout_margin_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterSettings {
    #[serde(default, alias = "logDirectory")]
    pub log_directory: Option<PathBuf>,
    /// 手の空いたエンジンで相手番の候補局面を先読みする
    #[serde(default, alias = "multiPonder")]
    pub multi_ponder: bool,
    #[serde(default)]
    pub time: TimeOptions,
    #[serde(default, alias = "multiPv")]
    pub multi_pv: MultiPvSettings,
    pub engines: Vec<EngineDescriptor>,
}

impl ClusterSettings {
    /// ファイルから読む。拡張子 `.json` なら JSON、それ以外は TOML。
    pub fn from_file(path: &Path) -> ClusterResult<Self> {
        let contents = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let settings: ClusterSettings = if is_json {
            serde_json::from_str(&contents).map_err(|source| ClusterError::JsonConfig {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            toml::from_str(&contents).map_err(|source| ClusterError::TomlConfig {
                path: path.to_path_buf(),
                source,
            })?
        };
        settings.validate()?;
        Ok(settings)
    }

    /// 明示されたパス、なければ実行ファイルのディレクトリ、カレントディレクトリの順に探す。
    pub fn load(explicit: Option<&Path>) -> ClusterResult<(Self, PathBuf)> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(ClusterError::ConfigNotFound {
                    searched: vec![path.to_path_buf()],
                });
            }
            return Ok((Self::from_file(path)?, path.to_path_buf()));
        }
        let mut dirs = Vec::new();
        if let Some(dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
            dirs.push(dir);
        }
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }
        let candidates = candidate_paths(&dirs);
        match candidates.iter().find(|path| path.is_file()) {
            Some(path) => Ok((Self::from_file(path)?, path.clone())),
            None => Err(ClusterError::ConfigNotFound {
                searched: candidates,
            }),
        }
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if self.engines.is_empty() {
            return Err(ClusterError::InvalidConfig("no engines configured".to_string()));
        }
        if self.engines.iter().all(|engine| engine.mate_specialist) {
            return Err(ClusterError::InvalidConfig(
                "at least one engine must not be a mate specialist".to_string(),
            ));
        }
        Ok(())
    }
}

fn candidate_paths(dirs: &[PathBuf]) -> Vec<PathBuf> {
    dirs.iter()
        .flat_map(|dir| DEFAULT_CONFIG_NAMES.iter().map(move |name| dir.join(name)))
        .collect()
}
