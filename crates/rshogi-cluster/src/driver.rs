//! プロセスとスレッドを組み立ててメインループを回す。
//!
//! スレッド構成:
//! - エンジンごとに 書き込み / stdout 読み取り / stderr 読み捨て
//! - 上流 stdin の読み取り (終了時は join せず切り離す)
//! - 合議の締め切り監視
//! - multi ponder の割り当てワーカー
//!
//! メインループは stdin スレッドから届いた行を 1 行ずつコーディネータへ渡す。

use std::io::{self, BufRead, BufReader, BufWriter};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver};

use crate::config::ClusterSettings;
use crate::coordinator::{Coordinator, Flow, PartitionJob};
use crate::output::UpstreamSink;
use crate::process::{EngineProcess, ExitHandle};
use crate::session::{run_writer, EngineSession};

/// 締め切り監視の周期。
pub const DEADLINE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 上流を stdin で受け付けて動かす。
pub fn run(settings: &ClusterSettings, sink: Arc<dyn UpstreamSink>) -> Result<()> {
    run_with(settings, BufReader::new(io::stdin()), sink)
}

/// 上流の入力を `input` から読んで動かす。`quit` か入力の終わりで戻る。
pub fn run_with<R>(settings: &ClusterSettings, input: R, sink: Arc<dyn UpstreamSink>) -> Result<()>
where
    R: BufRead + Send + 'static,
{
    let processes = spawn_all(settings)?;

    let mut sessions = Vec::with_capacity(processes.len());
    let mut exit_handles = Vec::with_capacity(processes.len());
    let mut engine_threads: Vec<JoinHandle<()>> = Vec::new();
    let mut outputs = Vec::with_capacity(processes.len());
    for (index, (descriptor, process)) in settings.engines.iter().zip(processes).enumerate() {
        let (handle, stdin, stdout, stderr) = process.into_parts();
        let (tx, rx) = unbounded::<String>();
        sessions.push(EngineSession::new(index, descriptor, tx));
        exit_handles.push(handle);
        engine_threads.push(
            thread::Builder::new()
                .name(format!("engine{index}-writer"))
                .spawn(move || run_writer(index, rx, BufWriter::new(stdin)))
                .context("failed to spawn writer thread")?,
        );
        outputs.push((stdout, stderr));
    }

    let (partition_tx, partition_rx) = unbounded::<PartitionJob>();
    let coordinator = Arc::new(Coordinator::new(
        settings,
        sessions,
        sink,
        Some(partition_tx),
        rand::random(),
    ));
    log::info!(
        "cluster started: {} engines, multi_ponder={}",
        settings.engines.len(),
        settings.multi_ponder
    );

    for (index, (stdout, stderr)) in outputs.into_iter().enumerate() {
        let reader = Arc::clone(&coordinator);
        engine_threads.push(
            thread::Builder::new()
                .name(format!("engine{index}-reader"))
                .spawn(move || {
                    for line in BufReader::new(stdout).lines() {
                        match line {
                            Ok(line) => reader.handle_engine_line(index, &line),
                            Err(err) => {
                                log::warn!("engine[{index}]: read error: {err}");
                                break;
                            }
                        }
                    }
                    reader.session_exited(index);
                })
                .context("failed to spawn reader thread")?,
        );
        engine_threads.push(
            thread::Builder::new()
                .name(format!("engine{index}-stderr"))
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(|line| line.ok()) {
                        log::debug!("engine[{index}] stderr: {line}");
                    }
                })
                .context("failed to spawn stderr thread")?,
        );
    }

    let commands = spawn_stdin_reader(input)?;

    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let watcher = {
        let coordinator = Arc::clone(&coordinator);
        thread::Builder::new()
            .name("deadline-watcher".to_string())
            .spawn(move || watch_deadline(&coordinator, &shutdown_rx))
            .context("failed to spawn deadline watcher")?
    };

    let partitioner = {
        let coordinator = Arc::clone(&coordinator);
        thread::Builder::new()
            .name("partition-worker".to_string())
            .spawn(move || {
                for job in partition_rx.iter() {
                    coordinator.run_partition(&job);
                }
                log::debug!("partition worker finished");
            })
            .context("failed to spawn partition worker")?
    };

    for line in commands.iter() {
        if coordinator.handle_command(&line) == Flow::Quit {
            break;
        }
    }

    log::info!("shutting down");
    coordinator.close_partition();
    drop(shutdown_tx);
    join(watcher, "deadline watcher");
    for handle in exit_handles {
        handle.shutdown();
    }
    join(partitioner, "partition worker");
    for handle in engine_threads {
        join(handle, "engine I/O");
    }
    Ok(())
}

/// すべてのエンジンを起動する。1 本でも失敗したら起動済みのものを片付けてエラーにする。
fn spawn_all(settings: &ClusterSettings) -> Result<Vec<EngineProcess>> {
    let mut processes = Vec::with_capacity(settings.engines.len());
    for descriptor in &settings.engines {
        match EngineProcess::spawn(descriptor) {
            Ok(process) => processes.push(process),
            Err(err) => {
                for process in processes {
                    let (handle, _stdin, _stdout, _stderr) = process.into_parts();
                    ExitHandle::shutdown(handle);
                }
                return Err(err).with_context(|| format!("cannot start engine '{}'", descriptor.name));
            }
        }
    }
    Ok(processes)
}

/// 上流の行をチャネルへ流す。入力が終わったら `quit` を流す。
fn spawn_stdin_reader<R>(input: R) -> Result<Receiver<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = unbounded::<String>();
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in input.lines() {
                match line {
                    Ok(line) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        log::error!("failed to read stdin: {err}");
                        break;
                    }
                }
            }
            log::info!("stdin closed");
            let _ = tx.send("quit".to_string());
        })
        .context("failed to spawn stdin reader")?;
    Ok(rx)
}

fn watch_deadline(coordinator: &Coordinator, shutdown: &Receiver<()>) {
    loop {
        select! {
            recv(shutdown) -> _ => break,
            default(DEADLINE_POLL_INTERVAL) => coordinator.check_deadline(),
        }
    }
    log::debug!("deadline watcher finished");
}

fn join(handle: JoinHandle<()>, what: &str) {
    if handle.join().is_err() {
        log::error!("{what} thread panicked");
    }
}
