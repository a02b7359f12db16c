//! ログの初期化。
//!
//! stdout は USI プロトコル専用なので、ログは stderr かログファイルにだけ出す。

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

/// 1 レコードごとに flush するファイル。異常終了しても末尾を失わない。
pub struct FlushingFileWriter {
    file: File,
}

impl FlushingFileWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::create(path)?,
        })
    }
}

impl Write for FlushingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.file.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// ログファイル名 `rshogi-cluster.<日時>.pid=<pid>.log`。
pub fn log_file_name(started: DateTime<Local>, pid: u32) -> String {
    format!(
        "rshogi-cluster.{}.pid={}.log",
        started.format("%Y-%m-%d-%H-%M-%S"),
        pid
    )
}

/// ロガーを初期化する。`log_directory` があればそこへ書き、作ったファイルのパスを返す。
pub fn init(debug: bool, log_directory: Option<&Path>) -> Result<Option<PathBuf>> {
    let level = if debug { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, level),
    );
    builder
        .format(|buf, record| {
            writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args())
        })
        .write_style(env_logger::WriteStyle::Never);

    let path = match log_directory {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let path = dir.join(log_file_name(Local::now(), std::process::id()));
            let writer = FlushingFileWriter::create(&path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            builder.target(env_logger::Target::Pipe(Box::new(writer)));
            Some(path)
        }
        None => {
            builder.target(env_logger::Target::Stderr);
            None
        }
    };
    builder
        .try_init()
        .context("logger is already initialized")?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn log_file_name_carries_timestamp_and_pid() {
        let started = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            log_file_name(started, 4242),
            "rshogi-cluster.2024-03-09-07-05-01.pid=4242.log"
        );
    }

    #[test]
    fn flushing_writer_persists_every_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let mut writer = FlushingFileWriter::create(&path).unwrap();
        writer.write_all(b"[INFO] first\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[INFO] first\n");
    }
}
