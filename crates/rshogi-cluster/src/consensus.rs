//! 各エンジンの最善手記録を 1 つの指し手にまとめる合議。
//!
//! 1. どのエンジンも指し手を持っていなければ投了。
//! 2. 誰かが `resign` なら投了、`win` なら勝ち宣言。
//! 3. 最大評価値が [`DECISIVE_SCORE`] を超えていればその手を即採用 (詰み筋)。
//! 4. それ以外は指し手ごとの票数で決め、同票は投票者の最大評価値で決める。
//! 5. 勝った手と評価値が一致する記録のうち、ponder を持つものを優先し、
//!    残りは一様乱数で選ぶ。

use rand::Rng;

use crate::session::BestMoveRecord;

/// 詰みスコアの基準値。`score mate N` は `±(MATE_SCORE - N)` に換算する。
pub const MATE_SCORE: i32 = 32000;
/// これを超える評価値は投票を経ずに採用する。
pub const DECISIVE_SCORE: i32 = 30000;
/// 詰み専門エンジンの `checkmate` に付ける評価値。
pub const CHECKMATE_SCORE: i32 = 100_000;

/// 合議の結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub best_move: String,
    pub ponder: Option<String>,
    /// 採用した記録のセッション番号。投了などで特定の記録に依らなければ `None`。
    pub source: Option<usize>,
}

impl Decision {
    fn without_source(best_move: &str) -> Self {
        Self {
            best_move: best_move.to_string(),
            ponder: None,
            source: None,
        }
    }

    /// 上流へ返す `bestmove ...` 行。
    pub fn to_usi(&self) -> String {
        match &self.ponder {
            Some(ponder) => format!("bestmove {} ponder {}", self.best_move, ponder),
            None => format!("bestmove {}", self.best_move),
        }
    }
}

/// 指し手ごとの集計 (出現順)。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    pub best_move: String,
    pub votes: usize,
    pub max_score: i32,
}

/// 指し手を持つ記録を票にまとめる。並びは最初に現れた順。
pub fn tally(records: &[BestMoveRecord]) -> Vec<Tally> {
    let mut tallies: Vec<Tally> = Vec::new();
    for record in records {
        let Some(mv) = &record.best_move else {
            continue;
        };
        match tallies.iter_mut().find(|t| &t.best_move == mv) {
            Some(entry) => {
                entry.votes += 1;
                entry.max_score = entry.max_score.max(record.score);
            }
            None => tallies.push(Tally {
                best_move: mv.clone(),
                votes: 1,
                max_score: record.score,
            }),
        }
    }
    tallies
}

/// 票の内訳を `<move>=<count>` の並びで返す。票の多い順。
pub fn vote_summary(records: &[BestMoveRecord]) -> String {
    let mut tallies = tally(records);
    // 安定ソートなので同票は出現順
    tallies.sort_by(|a, b| b.votes.cmp(&a.votes));
    tallies
        .iter()
        .map(|t| format!("{}={}", t.best_move, t.votes))
        .collect::<Vec<_>>()
        .join(" ")
}

/// 合議して指し手を決める。
pub fn decide<R: Rng>(records: &[BestMoveRecord], rng: &mut R) -> Decision {
    if records.iter().all(|r| r.best_move.is_none()) {
        return Decision::without_source("resign");
    }
    let has = |mv: &str| records.iter().any(|r| r.best_move.as_deref() == Some(mv));
    if has("resign") {
        return Decision::without_source("resign");
    }
    if has("win") {
        return Decision::without_source("win");
    }

    let mut decisive: Option<usize> = None;
    for (index, record) in records.iter().enumerate() {
        if record.best_move.is_none() || record.score <= DECISIVE_SCORE {
            continue;
        }
        if decisive.is_none_or(|best| record.score > records[best].score) {
            decisive = Some(index);
        }
    }
    if let Some(index) = decisive {
        return from_record(records, index);
    }

    let mut winner: Option<Tally> = None;
    for entry in tally(records) {
        let better = match &winner {
            None => true,
            Some(w) => (entry.votes, entry.max_score) > (w.votes, w.max_score),
        };
        if better {
            winner = Some(entry);
        }
    }
    let Some(winner) = winner else {
        return Decision::without_source("resign");
    };

    let matching: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            r.best_move.as_deref() == Some(winner.best_move.as_str()) && r.score == winner.max_score
        })
        .map(|(i, _)| i)
        .collect();
    let with_ponder: Vec<usize> = matching
        .iter()
        .copied()
        .filter(|&i| records[i].ponder.is_some())
        .collect();
    let pool = if with_ponder.is_empty() {
        &matching
    } else {
        &with_ponder
    };
    match pool.len() {
        0 => Decision::without_source(&winner.best_move),
        1 => from_record(records, pool[0]),
        n => from_record(records, pool[rng.random_range(0..n)]),
    }
}

fn from_record(records: &[BestMoveRecord], index: usize) -> Decision {
    let record = &records[index];
    Decision {
        best_move: record.best_move.clone().unwrap_or_else(|| "resign".to_string()),
        ponder: record.ponder.clone(),
        source: Some(index),
    }
}
