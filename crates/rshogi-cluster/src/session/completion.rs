//! 探索の世代管理。
//!
//! `go` を送るたびに `issue` し、`bestmove` / `checkmate` を受け取るたびに
//! `complete` する。`completed + 1 == issued` のときだけ、いま届いている出力は
//! 最新の探索に属する。古い探索の `bestmove` が遅れて届いても `completed` が
//! 1 つ進むだけで、次の探索の出力から先が新しい世代として扱われる。

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Counters {
    issued: u64,
    completed: u64,
}

/// 探索の発行数と完了数。完了待ちは `Condvar` で行う。
#[derive(Debug, Default)]
pub struct SearchCompletion {
    counters: Mutex<Counters>,
    changed: Condvar,
}

impl SearchCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新しい探索を発行し、その番号 (1 始まり) を返す。
    pub fn issue(&self) -> u64 {
        let mut counters = self.counters.lock();
        counters.issued += 1;
        counters.issued
    }

    /// 探索の完了を記録して待機者を起こす。発行数を超えては進めない。
    pub fn complete(&self) {
        let mut counters = self.counters.lock();
        if counters.completed < counters.issued {
            counters.completed += 1;
        }
        drop(counters);
        self.changed.notify_all();
    }

    /// 最後に発行した探索の番号。
    pub fn latest(&self) -> u64 {
        self.counters.lock().issued
    }

    pub fn in_flight(&self) -> bool {
        let counters = self.counters.lock();
        counters.completed < counters.issued
    }

    /// 最新の探索がまだ終わっておらず、それより前の探索はすべて終わっている。
    pub fn is_current(&self) -> bool {
        let counters = self.counters.lock();
        counters.completed + 1 == counters.issued
    }

    /// 番号 `ticket` の探索が終わるまで待つ。時間切れなら `false`。
    pub fn wait_for(&self, ticket: u64, timeout: Duration) -> bool {
        self.wait_until(timeout, |c| c.completed >= ticket)
    }

    /// 発行済みの探索がすべて終わるまで待つ。時間切れなら `false`。
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |c| c.completed >= c.issued)
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&Counters) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut counters = self.counters.lock();
        while !done(&counters) {
            if self.changed.wait_until(&mut counters, deadline).timed_out() {
                return done(&counters);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn late_bestmove_of_superseded_search_is_not_current() {
        let completion = SearchCompletion::new();
        assert!(!completion.in_flight());
        completion.issue();
        // stop を送って次の探索を発行した直後は、古い探索の出力が届きうる
        completion.issue();
        assert!(!completion.is_current());
        completion.complete();
        assert!(completion.is_current());
        completion.complete();
        assert!(!completion.in_flight());
        assert!(!completion.is_current());
    }

    #[test]
    fn complete_never_overtakes_issue() {
        let completion = SearchCompletion::new();
        completion.complete();
        completion.issue();
        assert!(completion.is_current());
    }

    #[test]
    fn wait_for_wakes_on_completion() {
        let completion = Arc::new(SearchCompletion::new());
        let ticket = completion.issue();
        let waiter = {
            let completion = Arc::clone(&completion);
            thread::spawn(move || completion.wait_for(ticket, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        completion.complete();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_idle_times_out() {
        let completion = SearchCompletion::new();
        completion.issue();
        let started = Instant::now();
        assert!(!completion.wait_idle(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(completion.wait_for(0, Duration::ZERO));
    }
}
