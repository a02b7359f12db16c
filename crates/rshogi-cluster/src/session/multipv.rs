//! MultiPV 探索の候補手の収集。

use crate::protocol::{contains, parse_after, value_after};

/// `info ... multipv N ... pv <move> ...` から N 番目の候補手を集める。
#[derive(Debug, Clone)]
pub struct MultiPvCollector {
    moves: Vec<Option<String>>,
}

impl MultiPvCollector {
    pub fn new(width: usize) -> Self {
        Self {
            moves: vec![None; width.max(1)],
        }
    }

    /// info 行を取り込む。候補手として使ったら `true`。
    pub fn feed<S: AsRef<str>>(&mut self, tokens: &[S]) -> bool {
        if contains(tokens, "lowerbound") || contains(tokens, "upperbound") {
            return false;
        }
        let Some(first) = value_after(tokens, "pv") else {
            return false;
        };
        let rank = parse_after::<usize, S>(tokens, "multipv").unwrap_or(1);
        if rank == 0 || rank > self.moves.len() {
            return false;
        }
        self.moves[rank - 1] = Some(first.to_string());
        true
    }

    /// すべての順位の候補手が埋まったか。
    pub fn is_complete(&self) -> bool {
        self.moves.iter().all(Option::is_some)
    }

    /// 埋まった候補手を順位順に返す。
    pub fn into_moves(self) -> Vec<String> {
        self.moves.into_iter().flatten().collect()
    }
}
