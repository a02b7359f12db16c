//! 1 手あたりの最大思考時間の計算。
//!
//! 合議の締め切りはここで決める。時間を管理する 1 台のエンジンが `bestmove`
//! を返さなくても、締め切りを過ぎればその時点の読み筋で合議する。

use serde::Deserialize;

/// `max_moves_to_draw = 0` (手数制限なし) のときに使う手数の上限。
pub const UNLIMITED_MAX_PLY: u32 = 100_000;

/// 1 局面から見る手数の地平。
const PLY_HORIZON: u32 = 126;
/// 残り手数の見積もりの上限。
const MAX_MOVES_TO_GO: i64 = 80;
/// 1 手ごとに差し引く安全マージン (ms)。
const PER_MOVE_MARGIN: i64 = 1000;
const MIN_BUDGET: i64 = 100;
const MIN_TIME_FLOOR: i64 = 1000;
const BASE_RATIO: f64 = 5.0;
const MAX_SHARE: f64 = 0.3;

/// 時間管理に関するオプション (USI setoption 相当)。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeOptions {
    pub network_delay: i64,
    pub network_delay2: i64,
    pub minimum_thinking_time: i64,
    /// 引き分けとなる手数。0 なら制限なし。
    pub max_moves_to_draw: u32,
}

impl Default for TimeOptions {
    fn default() -> Self {
        // YaneuraOu 準拠のデフォルト値
        Self {
            network_delay: 120,
            network_delay2: 1120,
            minimum_thinking_time: 2000,
            max_moves_to_draw: 0,
        }
    }
}

impl TimeOptions {
    pub fn max_ply(&self) -> u32 {
        if self.max_moves_to_draw == 0 {
            UNLIMITED_MAX_PLY
        } else {
            self.max_moves_to_draw
        }
    }

    /// 上流の setoption を反映する。時間管理のオプションでなければ `false`。
    pub fn apply_setoption(&mut self, name: &str, value: &str) -> bool {
        let Ok(parsed) = value.trim().parse::<i64>() else {
            return false;
        };
        match name {
            "NetworkDelay" => self.network_delay = parsed,
            "NetworkDelay2" => self.network_delay2 = parsed,
            "MinimumThinkingTime" => self.minimum_thinking_time = parsed,
            "MaxMovesToDraw" => self.max_moves_to_draw = parsed.max(0) as u32,
            _ => return false,
        }
        true
    }
}

/// 手番側の時計の状態。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClockState {
    pub remaining: i64,
    pub byoyomi: i64,
    pub increment: i64,
    /// 現在局面の手数 (1 始まり)
    pub ply: u32,
}

/// `max_time` の結果。`trace` は途中経過で、そのまま `info string` として流せる。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeBudget {
    pub max_time_ms: i64,
    pub trace: Vec<String>,
}

/// 最大思考時間 (ms) を求める。副作用は無い。
pub fn max_time(options: &TimeOptions, clock: &ClockState) -> TimeBudget {
    let mut trace = Vec::new();
    let remaining = clock.remaining;
    let byoyomi = clock.byoyomi;
    let increment = clock.increment;
    let ply = clock.ply as i64;

    let horizon = (options.max_ply() as i64).min(ply + PLY_HORIZON as i64);
    let remain_budget = (remaining + byoyomi - options.network_delay2).max(MIN_BUDGET);
    trace.push(format!("max_time: horizon={horizon} remain_budget={remain_budget}"));

    let moves_to_go = ((horizon - ply + 2) / 2).min(MAX_MOVES_TO_GO);
    trace.push(format!("max_time: moves_to_go={moves_to_go}"));
    if moves_to_go <= 0 {
        let max_time_ms = increment - options.network_delay2;
        trace.push(format!("max_time: result={max_time_ms} (past horizon)"));
        return TimeBudget { max_time_ms, trace };
    }
    if moves_to_go == 1 {
        trace.push(format!("max_time: result={remain_budget} (last move)"));
        return TimeBudget {
            max_time_ms: remain_budget,
            trace,
        };
    }

    let min_time = (options.minimum_thinking_time - options.network_delay).max(MIN_TIME_FLOOR);
    let remain_estimate = (remaining + increment * moves_to_go + byoyomi * moves_to_go
        - PER_MOVE_MARGIN * (moves_to_go + 1))
        .max(0);
    trace.push(format!("max_time: min_time={min_time} remain_estimate={remain_estimate}"));

    let mut ratio = BASE_RATIO;
    if increment == 0 && byoyomi == 0 {
        // 切れ負けで残り 5 分を切ったら攻めすぎない
        ratio = BASE_RATIO.min((remaining as f64 / 60000.0).max(1.0));
    }
    let mut target = min_time as f64 + remain_estimate as f64 * ratio / moves_to_go as f64;
    target = target.min(remain_estimate as f64 * MAX_SHARE);
    target = target.min(remain_budget as f64);
    trace.push(format!("max_time: ratio={ratio:.3} target={target:.1}"));

    if byoyomi > 0 && (remaining as f64) < byoyomi as f64 * 1.2 {
        target = (byoyomi + remaining) as f64;
        trace.push(format!("max_time: byoyomi dominates, target={target:.1}"));
    }

    let rounded = ((target / 1000.0).ceil() * 1000.0) as i64;
    let max_time_ms =
        (rounded.max(options.minimum_thinking_time) - options.network_delay).min(remain_budget);
    trace.push(format!("max_time: result={max_time_ms}"));
    TimeBudget { max_time_ms, trace }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(remaining: i64, byoyomi: i64, increment: i64, ply: u32) -> i64 {
        max_time(
            &TimeOptions::default(),
            &ClockState {
                remaining,
                byoyomi,
                increment,
                ply,
            },
        )
        .max_time_ms
    }

    #[test]
    fn byoyomi_only_uses_the_byoyomi() {
        // 5000 - NetworkDelay2 まで使い切る
        assert_eq!(budget(0, 5000, 0, 10), 3880);
    }

    #[test]
    fn sudden_death_with_little_time_floors_at_min_thinking_time() {
        assert_eq!(budget(30_000, 0, 0, 10), 1880);
        assert_eq!(budget(0, 0, 0, 10), 100);
    }

    #[test]
    fn increment_game_gets_a_reasonable_budget() {
        let t = budget(300_000, 0, 10_000, 40);
        assert!(t > 10_000, "budget {t} too small");
        assert!(t < 300_000);
        assert_eq!(t % 1000, 880);
    }

    #[test]
    fn last_move_before_horizon_uses_everything() {
        let options = TimeOptions {
            max_moves_to_draw: 100,
            ..TimeOptions::default()
        };
        let clock = ClockState {
            remaining: 60_000,
            byoyomi: 0,
            increment: 0,
            ply: 100,
        };
        assert_eq!(max_time(&options, &clock).max_time_ms, 58_880);
    }

    #[test]
    fn monotonic_in_remaining_time_and_bounded() {
        let configs = [(10_000, 0, 10), (0, 10_000, 10), (0, 0, 10), (5_000, 0, 80)];
        for (byoyomi, increment, ply) in configs {
            let mut previous = i64::MIN;
            for remaining in (0..=600_000).step_by(1000) {
                let t = budget(remaining, byoyomi, increment, ply);
                assert!(
                    t >= previous,
                    "not monotonic at remaining={remaining} byoyomi={byoyomi} inc={increment}: {previous} -> {t}"
                );
                let bound = (remaining + byoyomi - 1120).max(100);
                assert!(t <= bound, "{t} exceeds {bound}");
                previous = t;
            }
        }
    }

    #[test]
    fn trace_reports_every_step() {
        let result = max_time(
            &TimeOptions::default(),
            &ClockState {
                remaining: 0,
                byoyomi: 5000,
                increment: 0,
                ply: 10,
            },
        );
        assert!(result.trace.iter().any(|l| l.contains("moves_to_go=64")));
        assert!(result.trace.last().is_some_and(|l| l.ends_with("result=3880")));
    }

    #[test]
    fn setoption_updates_known_names_only() {
        let mut options = TimeOptions::default();
        assert!(options.apply_setoption("NetworkDelay2", "2000"));
        assert_eq!(options.network_delay2, 2000);
        assert!(options.apply_setoption("MaxMovesToDraw", "256"));
        assert_eq!(options.max_ply(), 256);
        assert!(!options.apply_setoption("USI_Hash", "256"));
        assert!(!options.apply_setoption("NetworkDelay", "abc"));
    }
}
