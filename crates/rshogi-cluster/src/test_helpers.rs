//! テスト用の共通部品。プロセスの代わりにチャネルでセッションを作る。

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::{Receiver, unbounded};
use parking_lot::Mutex;

use crate::config::{ClusterSettings, EngineDescriptor, MultiPvSettings};
use crate::output::UpstreamSink;
use crate::session::EngineSession;
use crate::time_budget::TimeOptions;

/// 上流へ書いた行を記録する。
#[derive(Default)]
pub struct CapturingSink {
    lines: Mutex<Vec<String>>,
}

impl CapturingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 記録した行を取り出して空にする。
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }
}

impl UpstreamSink for CapturingSink {
    fn send_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// エコーを返すエンジンの設定。
pub fn descriptor(name: &str) -> EngineDescriptor {
    EngineDescriptor {
        name: name.to_string(),
        path: PathBuf::from(name),
        args: Vec::new(),
        working_directory: None,
        mate_specialist: false,
        time_keeper: false,
        echo_commands: true,
        option_overrides: Vec::new(),
    }
}

/// エコーを返さず、送った時点で受理済みとみなすエンジンの設定。
pub fn trusted(name: &str) -> EngineDescriptor {
    EngineDescriptor {
        echo_commands: false,
        ..descriptor(name)
    }
}

pub fn session(index: usize, descriptor: EngineDescriptor) -> (EngineSession, Receiver<String>) {
    let (tx, rx) = unbounded();
    (EngineSession::new(index, &descriptor, tx), rx)
}

/// 届いているコマンドをすべて取り出す。
pub fn drain(rx: &Receiver<String>) -> Vec<String> {
    rx.try_iter().collect()
}

pub fn settings(engines: Vec<EngineDescriptor>, multi_ponder: bool) -> ClusterSettings {
    ClusterSettings {
        log_directory: None,
        multi_ponder,
        time: TimeOptions::default(),
        multi_pv: MultiPvSettings::default(),
        engines,
    }
}
