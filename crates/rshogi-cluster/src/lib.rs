//! 複数の USI エンジンを束ねて 1 本のエンジンとして振る舞う合議クラスタ。
//!
//! 上流 (将棋所などのコントローラ) からの USI セッションを N 本の下流エンジンへ
//! ファンアウトし、各エンジンの読み筋を合議して 1 つの `bestmove` にまとめる。
//! `multi_ponder` を有効にすると、手の空いたエンジンを相手番の候補局面へ
//! 割り当てて先読みさせる。

pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod logging;
pub mod output;
pub mod partition;
pub mod position;
pub mod process;
pub mod protocol;
pub mod session;
pub mod state;
pub mod time_budget;

#[cfg(test)]
mod test_helpers;

pub use config::{ClusterSettings, EngineDescriptor, MultiPvSettings, OptionOverride};
pub use consensus::{decide, Decision, DECISIVE_SCORE};
pub use coordinator::Coordinator;
pub use error::ClusterError;
pub use session::{BestMoveRecord, EngineSession};
pub use state::{UpstreamSession, UpstreamState};
pub use time_budget::{max_time, TimeBudget, TimeOptions};
