//! 下流エンジンのプロセス管理。

use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::EngineDescriptor;
use crate::error::{ClusterError, ClusterResult};

pub const ENGINE_QUIT_TIMEOUT: Duration = Duration::from_millis(300);
pub const ENGINE_QUIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 起動したエンジンプロセスと、その標準入出力。
pub struct EngineProcess {
    pub name: String,
    child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl EngineProcess {
    pub fn spawn(descriptor: &EngineDescriptor) -> ClusterResult<Self> {
        let spawn_error = |source| ClusterError::Spawn {
            name: descriptor.name.clone(),
            path: descriptor.path.clone(),
            source,
        };
        let mut cmd = Command::new(&descriptor.path);
        if !descriptor.args.is_empty() {
            cmd.args(&descriptor.args);
        }
        if let Some(dir) = &descriptor.working_directory {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;
        let missing = |what: &str| {
            spawn_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("no {what}"),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        log::info!(
            "spawned engine '{}' ({}) pid={}",
            descriptor.name,
            descriptor.path.display(),
            child.id()
        );
        Ok(Self {
            name: descriptor.name.clone(),
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    pub fn into_parts(self) -> (ExitHandle, ChildStdin, ChildStdout, ChildStderr) {
        let handle = ExitHandle {
            name: self.name,
            child: self.child,
        };
        (handle, self.stdin, self.stdout, self.stderr)
    }
}

/// 標準入出力を切り離した後のプロセス。終了待ちにだけ使う。
pub struct ExitHandle {
    name: String,
    child: Child,
}

impl ExitHandle {
    /// `quit` 送信後の終了を少し待ち、終わらなければ kill する。
    pub fn shutdown(mut self) {
        let deadline = Instant::now() + ENGINE_QUIT_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                log::info!("engine '{}' exited: {status}", self.name);
                return;
            }
            thread::sleep(ENGINE_QUIT_POLL_INTERVAL);
        }
        log::warn!("engine '{}' did not exit after quit; killing", self.name);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
