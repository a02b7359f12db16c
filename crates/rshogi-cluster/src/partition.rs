//! 手の空いたエンジンを先読み局面へ割り当てる (multi ponder)。
//!
//! 根から幅優先に進み、各局面で 1 台に MultiPV 探索をさせて候補手を得る。
//! 候補手ごとに子局面へ 1 台を割り当て、残りの台数を半分ずつ子へ配る。
//! MultiPV の幅は、その局面に配られた台数を 0 になるまで半分にした回数。
//!
//! すでにその子局面を `go ponder` で読んでいるエンジンがいれば送り直さずに使う。

use std::collections::VecDeque;

use crate::position::{child_position, is_within_subtree};
use crate::session::Expectation;

/// 割り当てに使うエンジン群。コーディネータが実装する。
pub trait PonderPool {
    fn expectation(&self, session: usize) -> Expectation;

    /// `position` を `width` 本の MultiPV で探索した候補手。打ち切られたら `None`。
    fn multi_variation(&self, session: usize, position: &str, width: usize) -> Option<Vec<String>>;

    /// `position` の `go ponder` を指示する。打ち切られたら `false`。
    fn assign(&self, session: usize, position: &str) -> bool;

    fn is_cancelled(&self) -> bool;
}

/// 割り当ての依頼。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequest {
    /// 相手番の局面
    pub root: String,
    /// 予想される相手の指し手。候補手の先頭に差し込む
    pub predicted: Option<String>,
    /// 割り当ててよいセッション
    pub available: Vec<usize>,
    /// 割り当て対象外のセッションがすでに読んでいる局面。台数だけ消費して送らない
    pub covered: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub session: usize,
    pub position: String,
    /// 既存の ponder をそのまま使った
    pub reused: bool,
}

/// `budget` 台を配るときの MultiPV の幅。
pub fn width_for(budget: usize) -> usize {
    (usize::BITS - budget.leading_zeros()) as usize
}

/// 割り当てを実行する。打ち切られた場合はそこまでの割り当てを返す。
pub fn partition<P: PonderPool + ?Sized>(pool: &P, request: &PartitionRequest) -> Vec<Assignment> {
    let mut assignments = Vec::new();
    let mut idle: Vec<usize> = request.available.clone();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    queue.push_back((request.root.clone(), idle.len() + request.covered.len()));

    while let Some((node, budget)) = queue.pop_front() {
        if pool.is_cancelled() || idle.is_empty() {
            break;
        }
        if budget == 0 {
            continue;
        }
        let width = width_for(budget);
        let query = take_session(pool, &mut idle, &request.root, None);
        let Some(mut moves) = pool.multi_variation(query, &node, width) else {
            break;
        };
        // 探索を終えたので再び割り当てられる
        idle.push(query);
        moves.retain(|mv| mv != "resign" && mv != "win");
        if node == request.root {
            if let Some(predicted) = &request.predicted {
                moves.retain(|mv| mv != predicted);
                moves.insert(0, predicted.clone());
            }
        }
        log::debug!("partition: {node} budget={budget} width={width} candidates={moves:?}");

        let mut remaining = budget;
        for mv in moves {
            if remaining == 0 || idle.is_empty() {
                break;
            }
            if pool.is_cancelled() {
                return assignments;
            }
            let child = match child_position(&node, &mv) {
                Ok(child) => child,
                Err(err) => {
                    log::warn!("partition: cannot extend '{node}' with '{mv}': {err}");
                    continue;
                }
            };
            let share = remaining.div_ceil(2);
            remaining -= share;
            if request.covered.contains(&child) {
                queue.push_back((child, share - 1));
                continue;
            }

            let session = take_session(pool, &mut idle, &request.root, Some(&child));
            let reused = pool.expectation(session).is_pondering(&child);
            if !reused && !pool.assign(session, &child) {
                return assignments;
            }
            assignments.push(Assignment {
                session,
                position: child.clone(),
                reused,
            });
            queue.push_back((child, share - 1));
        }
    }
    assignments
}

/// 待機中のセッションを 1 台取り出す。
///
/// `target` の ponder を走らせているものがあればそれを選ぶ。それ以外では、
/// 根の部分木の外を読んでいる (= 続けても役に立たない) ものを優先する。
fn take_session<P: PonderPool + ?Sized>(
    pool: &P,
    idle: &mut Vec<usize>,
    root: &str,
    target: Option<&str>,
) -> usize {
    let expectations: Vec<Expectation> = idle.iter().map(|&s| pool.expectation(s)).collect();
    let hit = target.and_then(|target| expectations.iter().position(|e| e.is_pondering(target)));
    let useless = || {
        expectations
            .iter()
            .position(|e| !(e.in_flight && is_within_subtree(&e.position, root)))
    };
    let index = hit.or_else(useless).unwrap_or(0);
    idle.remove(index)
}
