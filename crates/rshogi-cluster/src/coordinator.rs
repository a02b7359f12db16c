//! 上流コマンドと下流エンジンの出力を突き合わせ、合議と割り当てを行う。
//!
//! ロックの取得順は 調停ロック (`upstream`) → セッションの同期ロック →
//! 探索完了カウンタ の順に固定する。逆順に取ることはない。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::config::{ClusterSettings, MultiPvSettings};
use crate::consensus::{decide, vote_summary, CHECKMATE_SCORE, MATE_SCORE};
use crate::output::UpstreamSink;
use crate::partition::{partition, Assignment, PartitionRequest, PonderPool};
use crate::position::{child_position, split_last_move, ParsedPosition};
use crate::protocol::{
    contains, index_of, join, normalize, parse_after, parse_upstream_command, replace_after, split,
    value_after, GoParams, UpstreamCommand,
};
use crate::session::{EngineSession, Expectation};
use crate::state::UpstreamSession;
use crate::time_budget::{max_time, ClockState};

/// 読み筋を上流へ表示する最小間隔。
pub const DISPLAY_INTERVAL: Duration = Duration::from_millis(200);
/// これより浅い読み筋は間隔を空けずに表示する (詰みの早期表示のため)。
const ALWAYS_DISPLAY_DEPTH: i32 = 3;

/// コマンド処理後にメインループを続けるか。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// 割り当てワーカーへ渡す依頼。`generation` が古くなったら捨てる。
#[derive(Debug, Clone)]
pub struct PartitionJob {
    pub generation: u64,
    pub request: PartitionRequest,
}

pub struct Coordinator {
    sessions: Vec<EngineSession>,
    upstream: Mutex<UpstreamSession>,
    sink: Arc<dyn UpstreamSink>,
    multi_ponder: bool,
    multi_pv: MultiPvSettings,
    partition_tx: Mutex<Option<Sender<PartitionJob>>>,
    generation: AtomicU64,
}

impl Coordinator {
    pub fn new(
        settings: &ClusterSettings,
        sessions: Vec<EngineSession>,
        sink: Arc<dyn UpstreamSink>,
        partition_tx: Option<Sender<PartitionJob>>,
        seed: u64,
    ) -> Self {
        let upstream = UpstreamSession::new(sessions.len(), settings.time, seed);
        Self {
            sessions,
            upstream: Mutex::new(upstream),
            sink,
            multi_ponder: settings.multi_ponder,
            multi_pv: settings.multi_pv,
            partition_tx: Mutex::new(partition_tx),
            generation: AtomicU64::new(0),
        }
    }

    pub fn sessions(&self) -> &[EngineSession] {
        &self.sessions
    }

    fn live_sessions(&self) -> impl Iterator<Item = &EngineSession> {
        self.sessions.iter().filter(|s| s.is_alive())
    }

    fn broadcast(&self, line: &str) {
        for session in self.live_sessions() {
            session.write(line);
        }
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// 進行中の割り当てを打ち切る。
    fn cancel_partition(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ------------------------------------------------------------------
    // 上流コマンド
    // ------------------------------------------------------------------

    /// 上流の 1 行を処理する。
    pub fn handle_command(&self, line: &str) -> Flow {
        log::debug!("upstream -> proxy: {line}");
        let command = match parse_upstream_command(line) {
            Ok(command) => command,
            Err(err) => {
                log::warn!("ignoring malformed command '{line}': {err}");
                return Flow::Continue;
            }
        };
        match command {
            UpstreamCommand::Usi => self.broadcast("usi"),
            UpstreamCommand::IsReady => self.on_isready(),
            UpstreamCommand::SetOption { name, value } => {
                self.on_setoption(&normalize(line), &name, value.as_deref())
            }
            UpstreamCommand::UsiNewGame => self.broadcast("usinewgame"),
            UpstreamCommand::Position(position) => self.upstream.lock().position = position,
            UpstreamCommand::Go(params) => self.on_go(&normalize(line), params),
            UpstreamCommand::PonderHit => self.on_ponderhit(),
            UpstreamCommand::Stop => self.on_stop(),
            UpstreamCommand::GameOver => self.on_gameover(&normalize(line)),
            UpstreamCommand::Quit => {
                self.on_quit();
                return Flow::Quit;
            }
            UpstreamCommand::Other(raw) => self.broadcast(&raw),
        }
        Flow::Continue
    }

    fn on_isready(&self) {
        let mut upstream = self.upstream.lock();
        upstream.ready.iter_mut().for_each(|r| *r = false);
        upstream.awaiting_ready = true;
        self.broadcast("isready");
        self.evaluate_ready(&mut upstream);
    }

    /// 生きている全セッションが readyok を返していれば上流へ readyok を返す。
    fn evaluate_ready(&self, upstream: &mut UpstreamSession) {
        if !upstream.awaiting_ready {
            return;
        }
        let all_ready = self
            .sessions
            .iter()
            .all(|s| !s.is_alive() || upstream.ready[s.index()]);
        if all_ready {
            upstream.awaiting_ready = false;
            self.sink.send_line("readyok");
        }
    }

    fn on_setoption(&self, line: &str, name: &str, value: Option<&str>) {
        if let Some(value) = value {
            let mut upstream = self.upstream.lock();
            if upstream.time.apply_setoption(name, value) {
                log::info!("time option {name} = {value}");
            }
        }
        self.broadcast(line);
    }

    fn on_go(&self, line: &str, params: GoParams) {
        let mut upstream = self.upstream.lock();
        self.cancel_partition();
        let position = upstream.position.clone();
        if position.is_empty() {
            log::warn!("go received before position");
            self.sink.info_string("go received before position");
            self.sink.send_line("bestmove resign");
            return;
        }
        upstream.begin_search(params.clone());
        self.sink.info_string(&position);

        let time_keeper = if self.multi_ponder {
            self.promote_time_keeper(&position, line, params.ponder)
        } else {
            self.start_lazy_search(&position, line)
        };
        upstream.time_keeper = time_keeper;
        let Some(time_keeper) = time_keeper else {
            log::warn!("no engine is running");
            self.sink.info_string("no engine is running");
            self.decide_locked(&mut upstream);
            return;
        };
        for session in self.live_sessions().filter(|s| s.is_mate_specialist()) {
            session.dispatch(&position, "go mate infinite");
        }
        if !params.ponder {
            self.arm_deadline(&mut upstream);
        }

        if self.multi_ponder {
            let available = self.ponder_candidates(Some(time_keeper));
            let request = if params.ponder {
                // 相手の予想手を指す前の局面から先読みを張り直す
                split_last_move(&position).map(|(root, predicted)| PartitionRequest {
                    root,
                    predicted: Some(predicted),
                    available,
                    covered: vec![position.clone()],
                })
            } else {
                Some(PartitionRequest {
                    root: position.clone(),
                    predicted: None,
                    available,
                    covered: Vec::new(),
                })
            };
            if let Some(request) = request {
                self.request_partition(request);
            }
        }
    }

    /// 時間管理役を選ぶ。設定で指定されたものを優先し、なければ詰み専門以外の先頭。
    fn pick_time_keeper(&self) -> Option<usize> {
        let mut candidates = self.live_sessions().filter(|s| !s.is_mate_specialist());
        let first = candidates.next()?;
        if first.prefers_time_keeping() {
            return Some(first.index());
        }
        let preferred = candidates.find(|s| s.prefers_time_keeping());
        Some(preferred.unwrap_or(first).index())
    }

    /// 全エンジンで同じ局面を探索する。時間管理役だけが上流の go を受け取る。
    fn start_lazy_search(&self, position: &str, go: &str) -> Option<usize> {
        let time_keeper = self.pick_time_keeper()?;
        for session in self.live_sessions().filter(|s| !s.is_mate_specialist()) {
            if session.index() == time_keeper {
                session.dispatch(position, go);
            } else {
                session.dispatch(position, "go infinite");
            }
        }
        Some(time_keeper)
    }

    /// 先読みが当たっているエンジンがあればそれを、なければ先頭のエンジンを
    /// 時間管理役にする。
    fn promote_time_keeper(&self, position: &str, go: &str, ponder: bool) -> Option<usize> {
        let hit = self
            .live_sessions()
            .filter(|s| !s.is_mate_specialist())
            .find(|s| s.expectation().is_pondering(position));
        if let Some(session) = hit {
            log::info!("engine[{}] promoted by ponder hit", session.index());
            if !ponder {
                session.write("ponderhit");
            }
            return Some(session.index());
        }
        let time_keeper = self.pick_time_keeper()?;
        self.sessions[time_keeper].dispatch(position, go);
        Some(time_keeper)
    }

    /// 現在の go と局面から合議の締め切りを決める。
    fn arm_deadline(&self, upstream: &mut UpstreamSession) {
        upstream.deadline = None;
        let Some(go) = upstream.current_go.clone() else {
            return;
        };
        let now = Instant::now();
        if let Some(movetime) = go.movetime {
            upstream.deadline = Some(now + Duration::from_millis(movetime.max(0) as u64));
            return;
        }
        if go.is_unclocked() || go.nodes.is_some() || go.depth.is_some() {
            return;
        }
        let parsed = match ParsedPosition::parse(&upstream.position) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("cannot derive ply from '{}': {err}", upstream.position);
                return;
            }
        };
        let (remaining, increment) = go.clock_for(parsed.black_to_move());
        let clock = ClockState {
            remaining: remaining.unwrap_or(0),
            byoyomi: go.byoyomi.unwrap_or(0),
            increment,
            ply: parsed.game_ply(),
        };
        let budget = max_time(&upstream.time, &clock);
        for line in &budget.trace {
            log::info!("{line}");
            self.sink.info_string(line);
        }
        upstream.deadline = Some(now + Duration::from_millis(budget.max_time_ms.max(0) as u64));
    }

    fn on_ponderhit(&self) {
        let mut upstream = self.upstream.lock();
        if !(upstream.state.is_thinking() && upstream.pondering) {
            log::warn!("ponderhit without a ponder search");
            return;
        }
        self.cancel_partition();
        upstream.pondering = false;
        if let Some(go) = upstream.current_go.as_mut() {
            go.ponder = false;
        }
        if let Some(go) = upstream.current_go.clone() {
            if !go.is_unclocked() {
                upstream.last_clocked_go = Some(go);
            }
        }
        let time_keeper = upstream.time_keeper;
        if let Some(index) = time_keeper {
            self.sessions[index].write("ponderhit");
        }
        self.arm_deadline(&mut upstream);
        if upstream.pending_decision {
            self.decide_locked(&mut upstream);
            return;
        }
        if self.multi_ponder {
            let request = PartitionRequest {
                root: upstream.position.clone(),
                predicted: None,
                available: self.ponder_candidates(time_keeper),
                covered: Vec::new(),
            };
            self.request_partition(request);
        }
    }

    fn on_stop(&self) {
        let mut upstream = self.upstream.lock();
        if upstream.state.is_thinking() {
            log::info!("stop requested");
            self.decide_locked(&mut upstream);
        } else {
            log::debug!("stop ignored while stopped");
        }
    }

    fn on_gameover(&self, line: &str) {
        let mut upstream = self.upstream.lock();
        self.cancel_partition();
        if upstream.state.is_thinking() {
            upstream.finish_search();
        }
        for session in self.live_sessions() {
            session.stop_if_searching();
        }
        self.broadcast(line);
    }

    fn on_quit(&self) {
        let mut upstream = self.upstream.lock();
        self.cancel_partition();
        self.close_partition();
        if upstream.state.is_thinking() {
            upstream.finish_search();
        }
        // 落ちたエンジンの書き込みスレッドも quit で終わらせる
        for session in &self.sessions {
            session.write("quit");
        }
    }

    // ------------------------------------------------------------------
    // 下流エンジンの出力
    // ------------------------------------------------------------------

    /// エンジン `index` の出力 1 行を処理する。
    pub fn handle_engine_line(&self, index: usize, line: &str) {
        let Some(session) = self.sessions.get(index) else {
            return;
        };
        log::debug!("engine[{index}] -> proxy: {line}");
        let tokens = split(line);
        let Some(head) = tokens.first() else {
            return;
        };
        match head.as_str() {
            "readyok" => self.on_readyok(index),
            _ if session.observe_echo(&tokens) => {}
            "info" if tokens.get(1).map(String::as_str) != Some("string") => {
                self.on_info(session, line, &tokens)
            }
            "bestmove" => self.on_bestmove(session, &tokens),
            "checkmate" => self.on_checkmate(session, &tokens),
            // 識別情報は 1 本分だけ見せる
            "id" | "option" | "usiok" => {
                if index == 0 {
                    self.sink.send_line(line);
                }
            }
            _ => self.sink.send_line(line),
        }
    }

    fn on_readyok(&self, index: usize) {
        let mut upstream = self.upstream.lock();
        if !upstream.awaiting_ready {
            return;
        }
        upstream.ready[index] = true;
        self.evaluate_ready(&mut upstream);
    }

    fn on_info(&self, session: &EngineSession, line: &str, tokens: &[String]) {
        if !contains(tokens, "depth") || !contains(tokens, "pv") {
            return;
        }
        // 定跡の候補手一覧
        if line.contains("%)") {
            return;
        }
        if session.feed_multi_pv(tokens) {
            return;
        }
        let mut guard = self.upstream.lock();
        let upstream = &mut *guard;
        if !upstream.state.is_thinking() || session.is_mate_specialist() {
            return;
        }
        let Some(position) = session.fresh_position() else {
            return;
        };
        if position != upstream.position {
            return;
        }
        if contains(tokens, "lowerbound") || contains(tokens, "upperbound") {
            return;
        }
        let Some(depth) = parse_after::<i32, _>(tokens, "depth") else {
            return;
        };
        let record = &mut upstream.records[session.index()];
        if depth == 0 {
            // 詰まされている
            record.best_move = Some("resign".to_string());
            record.ponder = None;
            record.score = -MATE_SCORE;
            return;
        }
        let Some(pv) = index_of(tokens, "pv") else {
            return;
        };
        let Some(first) = tokens.get(pv + 1) else {
            return;
        };
        record.best_move = Some(first.clone());
        record.ponder = tokens.get(pv + 2).cloned();
        if let Some(score) = parse_score(tokens) {
            record.score = score;
        }
        if let Some(nps) = parse_after::<u64, _>(tokens, "nps") {
            record.nps = nps;
        }
        if let Some(nodes) = parse_after::<u64, _>(tokens, "nodes") {
            record.nodes = nodes;
        }
        record.pv_line = tokens.to_vec();

        let now = Instant::now();
        let cooled = upstream
            .last_display
            .is_none_or(|last| now.duration_since(last) >= DISPLAY_INTERVAL);
        if (depth < ALWAYS_DISPLAY_DEPTH || cooled) && depth > upstream.depth {
            upstream.depth = depth;
            upstream.last_display = Some(now);
            self.sink.info_string(&vote_summary(&upstream.records));
            let total = upstream.total_nps().to_string();
            self.sink.send_line(&join(&replace_after(tokens, "nps", &total)));
        }
    }

    fn on_bestmove(&self, session: &EngineSession, tokens: &[String]) {
        let mut guard = self.upstream.lock();
        let upstream = &mut *guard;
        let fresh = session.finish_search();
        if !upstream.state.is_thinking() {
            return;
        }
        let Some(position) = fresh else {
            log::debug!("engine[{}]: stale bestmove discarded", session.index());
            return;
        };
        if position != upstream.position || session.is_mate_specialist() {
            return;
        }
        let Some(best_move) = tokens.get(1) else {
            return;
        };
        let index = session.index();
        if best_move == "resign" || best_move == "win" {
            for record in &mut upstream.records {
                record.best_move = Some(best_move.clone());
                record.ponder = None;
            }
        } else {
            let record = &mut upstream.records[index];
            record.best_move = Some(best_move.clone());
            record.ponder = value_after(tokens, "ponder").map(str::to_string);
        }
        if upstream.time_keeper == Some(index) {
            self.trigger_decision(upstream);
        }
    }

    fn on_checkmate(&self, session: &EngineSession, tokens: &[String]) {
        let mut guard = self.upstream.lock();
        let upstream = &mut *guard;
        let fresh = session.finish_search();
        if !upstream.state.is_thinking() {
            return;
        }
        let Some(position) = fresh else {
            return;
        };
        if position != upstream.position {
            return;
        }
        let Some(first) = tokens.get(1) else {
            return;
        };
        if matches!(first.as_str(), "nomate" | "notimplemented" | "timeout") {
            log::info!("engine[{}]: {}", session.index(), join(tokens));
            return;
        }
        self.sink.info_string(&join(tokens));
        let index = session.index();
        let record = &mut upstream.records[index];
        record.best_move = Some(first.clone());
        record.ponder = tokens.get(2).cloned();
        record.score = CHECKMATE_SCORE;
        if session.is_mate_specialist() || upstream.time_keeper == Some(index) {
            self.trigger_decision(upstream);
        }
    }

    /// ponder 中なら ponderhit まで合議を待つ。
    fn trigger_decision(&self, upstream: &mut UpstreamSession) {
        if upstream.pondering {
            log::info!("decision deferred until ponderhit");
            upstream.pending_decision = true;
        } else {
            self.decide_locked(upstream);
        }
    }

    /// 合議して上流へ bestmove を返し、状態を戻す。調停ロックを持って呼ぶ。
    fn decide_locked(&self, upstream: &mut UpstreamSession) {
        let decision = decide(&upstream.records, &mut upstream.rng);
        if let Some(source) = decision.source {
            let pv_line = &upstream.records[source].pv_line;
            if !pv_line.is_empty() {
                let total = upstream.total_nps().to_string();
                self.sink.send_line(&join(&replace_after(pv_line, "nps", &total)));
            }
        }
        log::info!(
            "decision: {} (votes: {})",
            decision.to_usi(),
            vote_summary(&upstream.records)
        );
        self.sink.send_line(&decision.to_usi());

        let position = upstream.position.clone();
        upstream.finish_search();
        self.cancel_partition();
        for session in self.live_sessions() {
            // multi ponder では先読み中のエンジンはそのまま読ませる
            if !self.multi_ponder || session.expectation().position == position {
                session.stop_if_searching();
            }
        }

        if self.multi_ponder && decision.best_move != "resign" && decision.best_move != "win" {
            match child_position(&position, &decision.best_move) {
                Ok(root) => self.request_partition(PartitionRequest {
                    root,
                    predicted: decision.ponder.clone(),
                    available: self.ponder_candidates(None),
                    covered: Vec::new(),
                }),
                Err(err) => log::warn!("cannot extend '{position}': {err}"),
            }
        }
    }

    /// 合議の締め切りを過ぎていれば合議する。締め切り監視スレッドから呼ぶ。
    pub fn check_deadline(&self) {
        let mut upstream = self.upstream.lock();
        if upstream.deadline_passed(Instant::now()) {
            log::info!("decision deadline reached");
            self.decide_locked(&mut upstream);
        }
    }

    /// エンジン `index` のプロセスが終了した。
    pub fn session_exited(&self, index: usize) {
        let Some(session) = self.sessions.get(index) else {
            return;
        };
        if !session.mark_exited() {
            return;
        }
        log::warn!("engine[{index}] {} exited", session.name());
        self.sink
            .info_string(&format!("engine[{index}] {} exited", session.name()));
        let mut upstream = self.upstream.lock();
        upstream.records[index] = Default::default();
        self.evaluate_ready(&mut upstream);
    }

    // ------------------------------------------------------------------
    // multi ponder
    // ------------------------------------------------------------------

    /// 先読みに回せるエンジン。
    fn ponder_candidates(&self, exclude: Option<usize>) -> Vec<usize> {
        self.live_sessions()
            .filter(|s| !s.is_mate_specialist() && Some(s.index()) != exclude)
            .map(EngineSession::index)
            .collect()
    }

    fn request_partition(&self, request: PartitionRequest) {
        let job = PartitionJob {
            generation: self.current_generation(),
            request,
        };
        if let Some(tx) = self.partition_tx.lock().as_ref() {
            if tx.send(job).is_err() {
                log::warn!("partition worker is gone");
            }
        }
    }

    /// 割り当てワーカーへの送信を止める。ワーカーは残りを処理して終わる。
    pub fn close_partition(&self) {
        self.partition_tx.lock().take();
    }

    /// 割り当てを 1 回実行する。割り当てワーカーから呼ぶ。
    pub fn run_partition(&self, job: &PartitionJob) -> Vec<Assignment> {
        if job.generation != self.current_generation() {
            return Vec::new();
        }
        let pool = CoordinatorPool {
            coordinator: self,
            generation: job.generation,
        };
        let assignments = partition(&pool, &job.request);
        log::info!(
            "partition from '{}': {} sessions assigned{}",
            job.request.root,
            assignments.len(),
            if pool.is_cancelled() { " (cancelled)" } else { "" }
        );
        assignments
    }
}

/// `score cp N` / `score mate N` を評価値に直す。
fn parse_score(tokens: &[String]) -> Option<i32> {
    if let Some(cp) = parse_after::<i32, _>(tokens, "cp") {
        return Some(cp);
    }
    let raw = value_after(tokens, "mate")?;
    let negative = raw.starts_with('-');
    let plies: i32 = raw.trim_start_matches(['+', '-']).parse().unwrap_or(0);
    Some(if negative {
        -(MATE_SCORE - plies)
    } else {
        MATE_SCORE - plies
    })
}

struct CoordinatorPool<'a> {
    coordinator: &'a Coordinator,
    generation: u64,
}

impl PonderPool for CoordinatorPool<'_> {
    fn expectation(&self, session: usize) -> Expectation {
        self.coordinator.sessions[session].expectation()
    }

    fn multi_variation(&self, session: usize, position: &str, width: usize) -> Option<Vec<String>> {
        if self.is_cancelled() {
            return None;
        }
        let outcome = self.coordinator.sessions[session].search_with_multi_variation(
            position,
            width,
            &self.coordinator.multi_pv,
            || self.is_cancelled(),
        )?;
        if self.is_cancelled() {
            return None;
        }
        if outcome.timed_out {
            self.coordinator.sink.info_string(&format!(
                "multipv timed out: engine[{session}] returned {} of {width} moves for {position}",
                outcome.moves.len()
            ));
        }
        Some(outcome.moves)
    }

    fn assign(&self, session: usize, position: &str) -> bool {
        let upstream = self.coordinator.upstream.lock();
        if self.is_cancelled() {
            return false;
        }
        let go = upstream
            .last_clocked_go
            .as_ref()
            .map(GoParams::ponder_command)
            .unwrap_or_else(|| "go ponder".to_string());
        self.coordinator.sessions[session].dispatch(position, &go);
        true
    }

    fn is_cancelled(&self) -> bool {
        self.coordinator.current_generation() != self.generation
    }
}
