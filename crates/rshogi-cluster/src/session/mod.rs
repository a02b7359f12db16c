//! 下流エンジン 1 本分のセッション。
//!
//! 送信はキューに積むだけで呼び出し側をブロックしない。キューは専用の
//! 書き込みスレッド ([`run_writer`]) が FIFO で吐き出す。
//!
//! セッションは「最後に指示した局面と go」(expected) と「エンジンが受け取ったと
//! エコーしてきた局面と go」(actual) を持ち、両者が一致していて探索世代も最新の
//! ときだけ、そのエンジンの読み筋を信用する。

pub mod completion;
pub mod multipv;
pub mod options;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::config::{EngineDescriptor, MultiPvSettings};
use crate::protocol::{join, normalize};

pub use completion::SearchCompletion;
pub use multipv::MultiPvCollector;
pub use options::OptionOverrides;

/// 1 エンジンの最新の最善手と読み筋。探索開始ごとに丸ごと作り直す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestMoveRecord {
    pub best_move: Option<String>,
    pub ponder: Option<String>,
    pub score: i32,
    /// 最後に採用した `info ... pv ...` 行のトークン
    pub pv_line: Vec<String>,
    pub nps: u64,
    pub nodes: u64,
}

impl Default for BestMoveRecord {
    fn default() -> Self {
        Self {
            best_move: None,
            ponder: None,
            score: i32::MIN,
            pv_line: Vec::new(),
            nps: 0,
            nodes: 0,
        }
    }
}

/// セッションに最後に指示した探索の状態。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub position: String,
    pub search: String,
    pub in_flight: bool,
}

impl Expectation {
    /// `position` で `go ponder` の探索が走っているか。
    pub fn is_pondering(&self, position: &str) -> bool {
        self.in_flight && self.position == position && self.search.starts_with("go ponder")
    }
}

/// MultiPV 探索の結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiPvOutcome {
    pub moves: Vec<String>,
    pub timed_out: bool,
}

#[derive(Debug, Default)]
struct SyncState {
    expected_position: String,
    expected_search: String,
    actual_position: String,
    actual_search: String,
    multi_pv: Option<MultiPvCollector>,
}

impl SyncState {
    fn synced(&self) -> bool {
        self.expected_position == self.actual_position && self.expected_search == self.actual_search
    }
}

pub struct EngineSession {
    index: usize,
    name: String,
    mate_specialist: bool,
    time_keeper: bool,
    echo_commands: bool,
    overrides: OptionOverrides,
    commands: Sender<String>,
    sync: Mutex<SyncState>,
    completion: SearchCompletion,
    alive: AtomicBool,
}

impl EngineSession {
    pub fn new(index: usize, descriptor: &EngineDescriptor, commands: Sender<String>) -> Self {
        Self {
            index,
            name: descriptor.name.clone(),
            mate_specialist: descriptor.mate_specialist,
            time_keeper: descriptor.time_keeper,
            echo_commands: descriptor.echo_commands,
            overrides: OptionOverrides::new(descriptor.option_overrides.clone()),
            commands,
            sync: Mutex::new(SyncState::default()),
            completion: SearchCompletion::new(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_mate_specialist(&self) -> bool {
        self.mate_specialist
    }

    /// 設定で時間管理役に指定されているか。
    pub fn prefers_time_keeping(&self) -> bool {
        self.time_keeper
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// プロセスの終了を記録する。すでに終了済みなら `false`。
    pub fn mark_exited(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        if was_alive {
            // 終了したエンジンを待っている MultiPV 探索を起こす
            self.completion.complete();
        }
        was_alive
    }

    /// コマンドを送信キューに積む。setoption は上書き表を通す。
    pub fn write(&self, line: &str) {
        let line = self.overrides.rewrite(line);
        log::debug!("proxy -> engine[{}]: {}", self.index, line);
        if self.commands.send(line).is_err() {
            log::warn!("engine[{}] {}: command queue is closed", self.index, self.name);
        }
    }

    /// 探索中なら `stop` を送る。
    pub fn stop_if_searching(&self) -> bool {
        let _sync = self.sync.lock();
        if self.completion.in_flight() {
            self.write("stop");
            true
        } else {
            false
        }
    }

    /// 新しい探索を指示する。探索中なら先に `stop` を送る。戻り値は探索番号。
    pub fn dispatch(&self, position: &str, go: &str) -> u64 {
        let mut sync = self.sync.lock();
        self.dispatch_locked(&mut sync, position, go)
    }

    fn dispatch_locked(&self, sync: &mut SyncState, position: &str, go: &str) -> u64 {
        let position = normalize(position);
        let go = normalize(go);
        if self.completion.in_flight() {
            self.write("stop");
        }
        if sync.multi_pv.take().is_some() {
            // MultiPV 探索を打ち切って通常の探索に切り替える
            self.write("setoption name MultiPV value 1");
        }
        if self.echo_commands {
            sync.actual_position.clear();
            sync.actual_search.clear();
        } else {
            sync.actual_position = position.clone();
            sync.actual_search = go.clone();
        }
        self.write(&position);
        let ticket = self.completion.issue();
        self.write(&go);
        sync.expected_position = position;
        sync.expected_search = go;
        ticket
    }

    /// エコー行 (`position ...` / `info string position ...` / `info string go ...`) なら
    /// actual を更新して `true`。それ以外の `info string` は対象外。
    pub fn observe_echo<S: AsRef<str>>(&self, tokens: &[S]) -> bool {
        let head: Vec<&str> = tokens.iter().take(3).map(AsRef::as_ref).collect();
        let echoed = match head.as_slice() {
            ["position", ..] => 0,
            ["info", "string", "position" | "go"] => 2,
            _ => return false,
        };
        let text = join(&tokens[echoed..]);
        let mut sync = self.sync.lock();
        if head[echoed] == "position" {
            sync.actual_position = text;
        } else {
            sync.actual_search = text;
        }
        true
    }

    /// 最新の探索の出力を受け付けられる状態なら、その探索の局面を返す。
    /// MultiPV 探索の出力は合議に使わないので `None`。
    pub fn fresh_position(&self) -> Option<String> {
        let sync = self.sync.lock();
        self.fresh_locked(&sync)
    }

    fn fresh_locked(&self, sync: &SyncState) -> Option<String> {
        let fresh = sync.synced() && self.completion.is_current() && sync.multi_pv.is_none();
        fresh.then(|| sync.expected_position.clone())
    }

    /// `bestmove` / `checkmate` を受け取ったときに呼ぶ。探索を完了扱いにし、
    /// それが最新の探索だったならその局面を返す。
    pub fn finish_search(&self) -> Option<String> {
        let sync = self.sync.lock();
        let fresh = self.fresh_locked(&sync);
        self.completion.complete();
        fresh
    }

    /// MultiPV 探索中なら info 行を候補手として取り込む。
    pub fn feed_multi_pv<S: AsRef<str>>(&self, tokens: &[S]) -> bool {
        let mut sync = self.sync.lock();
        if sync.multi_pv.is_none() {
            return false;
        }
        if !(sync.synced() && self.completion.is_current()) {
            // MultiPV 探索の前の探索の残り
            return true;
        }
        let Some(collector) = sync.multi_pv.as_mut() else {
            return false;
        };
        let was_complete = collector.is_complete();
        collector.feed(tokens);
        if !was_complete && collector.is_complete() {
            // 候補手が揃ったので bestmove を返させて待ち手を起こす
            log::debug!("engine[{}]: MultiPV candidates are complete", self.index);
            self.write("stop");
        }
        true
    }

    pub fn expectation(&self) -> Expectation {
        let sync = self.sync.lock();
        Expectation {
            position: sync.expected_position.clone(),
            search: sync.expected_search.clone(),
            in_flight: self.completion.in_flight(),
        }
    }

    /// `position` を `width` 本の MultiPV で短時間探索し、候補手を返す。
    ///
    /// 探索中なら止めて終わるまで待ってから始める。候補手が揃うか探索が
    /// 終わるまで待ち、時間切れでもその時点で集まっている候補手を返す。
    /// `cancelled` は送信の直前ごとに同期ロックの中で確かめ、`true` なら
    /// 何も送らずに `None` を返す。
    pub fn search_with_multi_variation(
        &self,
        position: &str,
        width: usize,
        settings: &MultiPvSettings,
        cancelled: impl Fn() -> bool,
    ) -> Option<MultiPvOutcome> {
        {
            let _sync = self.sync.lock();
            if cancelled() {
                return None;
            }
            if self.completion.in_flight() {
                self.write("stop");
            }
        }
        if !self.completion.wait_idle(settings.stop_timeout()) {
            log::warn!("engine[{}]: search did not stop before MultiPV", self.index);
        }
        let go = format!("go btime 0 wtime 0 byoyomi {}", settings.search_time_ms);
        let ticket = {
            let mut sync = self.sync.lock();
            // 止めるのを待っている間に本来の探索が割り込んでいれば譲る
            if cancelled() {
                return None;
            }
            self.write(&format!("setoption name MultiPV value {width}"));
            let ticket = self.dispatch_locked(&mut sync, position, &go);
            sync.multi_pv = Some(MultiPvCollector::new(width));
            ticket
        };
        let finished = self.completion.wait_for(ticket, settings.wait_timeout());
        let collector = {
            let mut sync = self.sync.lock();
            // 別の探索に切り替わっていれば、そちらが MultiPV を戻している
            if self.completion.latest() != ticket {
                return Some(MultiPvOutcome {
                    moves: Vec::new(),
                    timed_out: !finished,
                });
            }
            if !finished && self.completion.in_flight() {
                self.write("stop");
            }
            self.write("setoption name MultiPV value 1");
            sync.multi_pv.take()
        };
        let moves = collector.map(MultiPvCollector::into_moves).unwrap_or_default();
        if !finished {
            log::warn!(
                "engine[{}]: MultiPV search timed out with {} of {} moves",
                self.index,
                moves.len(),
                width
            );
        }
        Some(MultiPvOutcome {
            moves,
            timed_out: !finished,
        })
    }
}

/// 送信キューを吐き出す書き込みスレッドの本体。`quit` を書いたら終わる。
pub fn run_writer<W: Write>(index: usize, commands: Receiver<String>, mut sink: W) {
    for line in commands.iter() {
        let result = writeln!(sink, "{line}").and_then(|_| sink.flush());
        if let Err(err) = result {
            log::warn!("engine[{index}]: failed to write '{line}': {err}");
            break;
        }
        if line == "quit" {
            break;
        }
    }
    log::debug!("engine[{index}]: writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{descriptor, drain, session};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::protocol::split;

    #[test]
    fn dispatch_sends_position_then_go() {
        let (session, rx) = session(0, descriptor("a"));
        let ticket = session.dispatch("position  startpos", "go btime 0 wtime 0 byoyomi 1000");
        assert_eq!(ticket, 1);
        assert_eq!(
            drain(&rx),
            vec!["position startpos", "go btime 0 wtime 0 byoyomi 1000"]
        );
        // エコー前は受け付けない
        assert_eq!(session.fresh_position(), None);
        assert!(session.observe_echo(&split("position startpos")));
        assert_eq!(session.fresh_position(), None);
        assert!(session.observe_echo(&split("info string go btime 0 wtime 0 byoyomi 1000")));
        assert_eq!(session.fresh_position().as_deref(), Some("position startpos"));
    }

    #[test]
    fn redispatch_stops_running_search_and_rejects_old_output() {
        let (session, rx) = session(0, descriptor("a"));
        session.dispatch("position startpos", "go infinite");
        session.observe_echo(&split("position startpos"));
        session.observe_echo(&split("info string go infinite"));
        drain(&rx);

        session.dispatch("position startpos moves 7g7f", "go infinite");
        assert_eq!(drain(&rx), vec!["stop", "position startpos moves 7g7f", "go infinite"]);
        // 古い探索の bestmove は最新ではない
        assert_eq!(session.finish_search(), None);
        session.observe_echo(&split("position startpos moves 7g7f"));
        session.observe_echo(&split("info string go infinite"));
        assert_eq!(
            session.finish_search().as_deref(),
            Some("position startpos moves 7g7f")
        );
        assert!(!session.expectation().in_flight);
    }

    #[test]
    fn unechoed_expected_position_is_stale() {
        let (session, _rx) = session(0, descriptor("a"));
        session.dispatch("position startpos moves 1g1f", "go infinite");
        assert_eq!(session.finish_search(), None);
    }

    #[test]
    fn trusted_engine_is_synced_on_dispatch() {
        let mut desc = descriptor("a");
        desc.echo_commands = false;
        let (session, _rx) = session(0, desc);
        session.dispatch("position startpos", "go infinite");
        assert_eq!(session.fresh_position().as_deref(), Some("position startpos"));
    }

    #[test]
    fn write_applies_option_overrides() {
        let mut desc = descriptor("a");
        desc.option_overrides.push(crate::config::OptionOverride {
            name: "Threads".to_string(),
            value: "2".to_string(),
        });
        let (session, rx) = session(0, desc);
        session.write("setoption name Threads value 8");
        session.write("isready");
        assert_eq!(drain(&rx), vec!["setoption name Threads value 2", "isready"]);
    }

    #[test]
    fn multi_variation_collects_candidates() {
        let mut desc = descriptor("a");
        desc.echo_commands = false;
        let (session, rx) = session(0, desc);
        let session = Arc::new(session);
        let settings = MultiPvSettings {
            search_time_ms: 50,
            timeout_margin_ms: 2000,
            stop_timeout_ms: 100,
        };
        let worker = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                session.search_with_multi_variation("position startpos", 2, &settings, || false)
            })
        };
        // go が送られてから候補手を流す
        let mut sent = Vec::new();
        while !sent.iter().any(|l: &String| l.starts_with("go ")) {
            sent.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(sent[0], "setoption name MultiPV value 2");
        assert!(session.feed_multi_pv(&split("info depth 5 multipv 1 score cp 30 pv 7g7f 3c3d")));
        assert!(drain(&rx).is_empty());
        assert!(session.feed_multi_pv(&split("info depth 5 multipv 2 score cp 20 pv 2g2f")));
        // 揃った時点で探索を切り上げさせる
        assert_eq!(drain(&rx), vec!["stop"]);
        assert!(session.feed_multi_pv(&split("info depth 6 multipv 1 score cp 31 pv 7g7f 3c3d")));
        assert!(drain(&rx).is_empty());
        // MultiPV 探索の bestmove は合議に使わない
        assert_eq!(session.finish_search(), None);
        let outcome = worker.join().unwrap().unwrap();
        assert_eq!(outcome.moves, vec!["7g7f", "2g2f"]);
        assert!(!outcome.timed_out);
        assert!(drain(&rx).contains(&"setoption name MultiPV value 1".to_string()));
        assert!(!session.feed_multi_pv(&split("info depth 6 multipv 1 pv 7g7f")));
    }

    #[test]
    fn multi_variation_timeout_returns_partial_result() {
        let mut desc = descriptor("a");
        desc.echo_commands = false;
        let (session, rx) = session(0, desc);
        let settings = MultiPvSettings {
            search_time_ms: 10,
            timeout_margin_ms: 10,
            stop_timeout_ms: 10,
        };
        let outcome = session
            .search_with_multi_variation("position startpos", 3, &settings, || false)
            .unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.moves.is_empty());
        let sent = drain(&rx);
        assert_eq!(sent.last().map(String::as_str), Some("setoption name MultiPV value 1"));
        assert!(sent.contains(&"stop".to_string()));
    }

    #[test]
    fn cancelled_multi_variation_sends_nothing() {
        let mut desc = descriptor("a");
        desc.echo_commands = false;
        let (session, rx) = session(0, desc);
        session.dispatch("position startpos", "go ponder");
        drain(&rx);
        let settings = MultiPvSettings {
            search_time_ms: 10,
            timeout_margin_ms: 10,
            stop_timeout_ms: 10,
        };
        assert_eq!(
            session.search_with_multi_variation("position startpos moves 7g7f", 2, &settings, || true),
            None
        );
        assert!(drain(&rx).is_empty());
        assert_eq!(session.expectation().search, "go ponder");
    }

    #[test]
    fn multi_variation_yields_when_cancelled_while_stopping() {
        let mut desc = descriptor("a");
        desc.echo_commands = false;
        let (session, rx) = session(0, desc);
        session.dispatch("position startpos", "go ponder");
        drain(&rx);
        let settings = MultiPvSettings {
            search_time_ms: 10,
            timeout_margin_ms: 10,
            stop_timeout_ms: 10,
        };
        // 1 回目 (stop の前) は通し、2 回目 (MultiPV を始める前) で打ち切る
        let checks = std::cell::Cell::new(0);
        let outcome = session.search_with_multi_variation("position startpos moves 7g7f", 2, &settings, || {
            checks.set(checks.get() + 1);
            checks.get() > 1
        });
        assert_eq!(outcome, None);
        assert_eq!(checks.get(), 2);
        assert_eq!(drain(&rx), vec!["stop"]);
        assert_eq!(session.expectation().position, "position startpos");
    }

    #[test]
    fn echo_is_recognized_only_at_line_head() {
        let (session, _rx) = session(0, descriptor("a"));
        session.dispatch("position startpos moves 7g7f", "go infinite");
        // 途中に position を含むだけの info string はエコーではない
        assert!(!session.observe_echo(&split("info string book hit position startpos moves 7g7f")));
        assert!(!session.observe_echo(&split("info depth 3 string position startpos")));
        assert!(session.observe_echo(&split("info string position startpos moves 7g7f")));
        assert!(session.observe_echo(&split("info string go infinite")));
        assert_eq!(session.fresh_position().as_deref(), Some("position startpos moves 7g7f"));
    }

    #[test]
    fn writer_stops_after_quit() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send("usi".to_string()).unwrap();
        tx.send("quit".to_string()).unwrap();
        tx.send("isready".to_string()).unwrap();
        let mut buf = Vec::new();
        run_writer(0, rx, &mut buf);
        assert_eq!(String::from_utf8(buf).unwrap(), "usi\nquit\n");
    }
}
