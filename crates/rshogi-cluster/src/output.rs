//! 上流 (コントローラ) への出力。

use std::io::{self, Write};

/// 上流へ 1 行ずつ書き出す先。テストでは書いた行を記録する実装に差し替える。
pub trait UpstreamSink: Send + Sync {
    fn send_line(&self, line: &str);

    fn info_string(&self, message: &str) {
        self.send_line(&format!("info string {message}"));
    }
}

/// 標準出力に書き、1 行ごとに flush する。
#[derive(Debug, Default)]
pub struct StdoutSink;

impl UpstreamSink for StdoutSink {
    fn send_line(&self, line: &str) {
        log::debug!("proxy -> upstream: {line}");
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        if let Err(err) = writeln!(handle, "{line}").and_then(|_| handle.flush()) {
            log::error!("failed to write to stdout: {err}");
        }
    }
}
