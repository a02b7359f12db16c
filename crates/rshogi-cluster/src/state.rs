//! 上流セッションの状態。すべて調停ロックの内側で読み書きする。

use std::fmt;
use std::time::Instant;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::protocol::GoParams;
use crate::session::BestMoveRecord;
use crate::time_budget::TimeOptions;

/// 上流から見た探索状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    /// 受け付けている探索が無い
    Stopped,
    /// go を受け取り、合議待ち
    Thinking,
}

impl UpstreamState {
    pub fn is_thinking(&self) -> bool {
        matches!(self, UpstreamState::Thinking)
    }
}

impl fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamState::Stopped => f.write_str("Stopped"),
            UpstreamState::Thinking => f.write_str("Thinking"),
        }
    }
}

/// 上流セッション 1 本分の共有状態。
pub struct UpstreamSession {
    pub state: UpstreamState,
    /// `go ponder` で考えている間は締め切りを設けず、合議も ponderhit まで待つ
    pub pondering: bool,
    /// 上流から最後に受け取った position 行
    pub position: String,
    /// 表示済みの読み筋の最大深さ
    pub depth: i32,
    /// 合議の締め切り。`None` なら無期限
    pub deadline: Option<Instant>,
    pub last_display: Option<Instant>,
    /// セッション番号ごとの最善手記録
    pub records: Vec<BestMoveRecord>,
    /// `isready` 以降に `readyok` を返したセッション
    pub ready: Vec<bool>,
    pub awaiting_ready: bool,
    /// 現在の探索の go
    pub current_go: Option<GoParams>,
    /// 時計情報を持つ直近の go (先読みの go ponder に使う)
    pub last_clocked_go: Option<GoParams>,
    /// ponder 中に合議の条件が揃った
    pub pending_decision: bool,
    /// 時間管理役のセッション
    pub time_keeper: Option<usize>,
    pub time: TimeOptions,
    pub rng: Xoshiro256PlusPlus,
}

impl UpstreamSession {
    pub fn new(session_count: usize, time: TimeOptions, seed: u64) -> Self {
        Self {
            state: UpstreamState::Stopped,
            pondering: false,
            position: String::new(),
            depth: 0,
            deadline: None,
            last_display: None,
            records: vec![BestMoveRecord::default(); session_count],
            ready: vec![false; session_count],
            awaiting_ready: false,
            current_go: None,
            last_clocked_go: None,
            pending_decision: false,
            time_keeper: None,
            time,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// 状態を遷移させ、変化をログに残す。
    pub fn transit(&mut self, next: UpstreamState) {
        if self.state != next {
            log::info!("upstream state: {} -> {}", self.state, next);
        }
        self.state = next;
    }

    pub fn clear_records(&mut self) {
        for record in &mut self.records {
            *record = BestMoveRecord::default();
        }
    }

    /// 探索開始時の状態にする。
    pub fn begin_search(&mut self, go: GoParams) {
        self.clear_records();
        self.depth = 0;
        self.last_display = None;
        self.deadline = None;
        self.pending_decision = false;
        self.pondering = go.ponder;
        if !go.ponder && !go.is_unclocked() {
            self.last_clocked_go = Some(go.clone());
        }
        self.current_go = Some(go);
        self.transit(UpstreamState::Thinking);
    }

    /// 合議後の状態に戻す。
    pub fn finish_search(&mut self) {
        self.transit(UpstreamState::Stopped);
        self.depth = 0;
        self.deadline = None;
        self.pondering = false;
        self.pending_decision = false;
        self.clear_records();
    }

    pub fn deadline_passed(&self, now: Instant) -> bool {
        self.state.is_thinking() && !self.pondering && self.deadline.is_some_and(|d| now >= d)
    }

    /// 表示中の全エンジンの nps の合計。
    pub fn total_nps(&self) -> u64 {
        self.records.iter().map(|r| r.nps).sum()
    }
}
