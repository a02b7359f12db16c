//! USI 行の分解・結合と、上流コマンドの解釈。
//!
//! 行は空白区切りのトークン列として扱う。下流エンジンの出力はキーワードの
//! 有無で分類するだけなので、ここでは状態を持たない純粋な関数だけを置く。

use std::str::FromStr;

use anyhow::{anyhow, Result};

/// 空白で行をトークンに分割する。連続した空白や前後の空白は無視する。
pub fn split(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

/// トークン列を 1 つの空白で連結する。
pub fn join<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut out = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(token.as_ref());
    }
    out
}

/// 行を正規化する (空白の連続を 1 つに畳む)。
pub fn normalize(line: &str) -> String {
    join(&split(line))
}

pub fn index_of<S: AsRef<str>>(tokens: &[S], key: &str) -> Option<usize> {
    tokens.iter().position(|t| t.as_ref() == key)
}

pub fn contains<S: AsRef<str>>(tokens: &[S], key: &str) -> bool {
    index_of(tokens, key).is_some()
}

/// `key` の直後のトークンを返す。
pub fn value_after<'a, S: AsRef<str>>(tokens: &'a [S], key: &str) -> Option<&'a str> {
    let idx = index_of(tokens, key)?;
    tokens.get(idx + 1).map(AsRef::as_ref)
}

/// `key` の直後のトークンを数値などとして読む。読めなければ `None`。
pub fn parse_after<T: FromStr, S: AsRef<str>>(tokens: &[S], key: &str) -> Option<T> {
    value_after(tokens, key)?.parse().ok()
}

/// `key` の直後のトークンを `value` に置き換えた新しいトークン列を返す。
pub fn replace_after<S: AsRef<str>>(tokens: &[S], key: &str, value: &str) -> Vec<String> {
    let mut out: Vec<String> = tokens.iter().map(|t| t.as_ref().to_string()).collect();
    if let Some(idx) = index_of(&out, key) {
        if idx + 1 < out.len() {
            out[idx + 1] = value.to_string();
        }
    }
    out
}

/// go コマンドのパラメータ。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoParams {
    pub ponder: bool,
    pub infinite: bool,
    /// `go mate ...` (詰み探索)
    pub mate: bool,
    pub btime: Option<i64>,
    pub wtime: Option<i64>,
    pub byoyomi: Option<i64>,
    pub binc: Option<i64>,
    pub winc: Option<i64>,
    pub movetime: Option<i64>,
    pub nodes: Option<u64>,
    pub depth: Option<u32>,
}

impl GoParams {
    /// `go` を除いたトークン列から読む。
    pub fn parse<S: AsRef<str>>(parts: &[S]) -> Result<Self> {
        let mut params = GoParams::default();
        let mut i = 0;
        while i < parts.len() {
            let key = parts[i].as_ref();
            match key {
                "ponder" => params.ponder = true,
                "infinite" => params.infinite = true,
                "mate" => {
                    params.mate = true;
                    // "go mate <ms|infinite>"
                    let next = parts.get(i + 1).map(AsRef::as_ref);
                    if next.is_some_and(|v| v == "infinite" || v.parse::<i64>().is_ok()) {
                        i += 1;
                    }
                }
                "btime" | "wtime" | "byoyomi" | "binc" | "winc" | "movetime" => {
                    let value = parse_number::<i64, S>(parts, i)?;
                    i += 1;
                    match key {
                        "btime" => params.btime = Some(value),
                        "wtime" => params.wtime = Some(value),
                        "byoyomi" => params.byoyomi = Some(value),
                        "binc" => params.binc = Some(value),
                        "winc" => params.winc = Some(value),
                        _ => params.movetime = Some(value),
                    }
                }
                "nodes" => {
                    params.nodes = Some(parse_number(parts, i)?);
                    i += 1;
                }
                "depth" => {
                    params.depth = Some(parse_number(parts, i)?);
                    i += 1;
                }
                other => log::debug!("ignoring unknown go token: {other}"),
            }
            i += 1;
        }
        Ok(params)
    }

    /// 手番側の持ち時間と加算時間。
    pub fn clock_for(&self, black_to_move: bool) -> (Option<i64>, i64) {
        if black_to_move {
            (self.btime, self.binc.unwrap_or(0))
        } else {
            (self.wtime, self.winc.unwrap_or(0))
        }
    }

    /// 時計情報を全く含まないか (`go infinite` / `go nodes` など)。
    pub fn is_unclocked(&self) -> bool {
        self.infinite
            || self.mate
            || (self.btime.is_none()
                && self.wtime.is_none()
                && self.byoyomi.is_none()
                && self.movetime.is_none())
    }

    /// この go を元に、先読み用の `go ponder ...` を組み立てる。
    ///
    /// 加算時間は半分に縮める。ponderhit 後にエンジンが加算を当てにして
    /// 使いすぎないようにするため。
    pub fn ponder_command(&self) -> String {
        let mut out = String::from("go ponder");
        let mut push = |key: &str, value: Option<i64>| {
            if let Some(v) = value {
                out.push_str(&format!(" {key} {v}"));
            }
        };
        push("btime", self.btime);
        push("wtime", self.wtime);
        push("byoyomi", self.byoyomi);
        push("binc", self.binc.map(|v| v / 2));
        push("winc", self.winc.map(|v| v / 2));
        out
    }
}

fn parse_number<T: FromStr, S: AsRef<str>>(parts: &[S], i: usize) -> Result<T> {
    let key = parts[i].as_ref();
    let raw = parts.get(i + 1).ok_or_else(|| anyhow!("go {key} requires a value"))?.as_ref();
    raw.parse().map_err(|_| anyhow!("invalid {key} value: {raw}"))
}

/// 上流 (コントローラ) から届くコマンド。
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamCommand {
    Usi,
    IsReady,
    SetOption { name: String, value: Option<String> },
    UsiNewGame,
    /// 正規化済みの `position ...` 行
    Position(String),
    Go(GoParams),
    PonderHit,
    Stop,
    GameOver,
    Quit,
    /// 解釈しないがそのまま全エンジンへ転送するコマンド
    Other(String),
}

/// 上流の 1 行を解釈する。空行はエラー。
pub fn parse_upstream_command(line: &str) -> Result<UpstreamCommand> {
    let parts = split(line);
    let Some(head) = parts.first() else {
        return Err(anyhow!("empty command"));
    };
    match head.as_str() {
        "usi" => Ok(UpstreamCommand::Usi),
        "isready" => Ok(UpstreamCommand::IsReady),
        "usinewgame" => Ok(UpstreamCommand::UsiNewGame),
        "ponderhit" => Ok(UpstreamCommand::PonderHit),
        "stop" => Ok(UpstreamCommand::Stop),
        "quit" => Ok(UpstreamCommand::Quit),
        "gameover" => Ok(UpstreamCommand::GameOver),
        "setoption" => parse_setoption(&parts[1..]),
        "position" => {
            if parts.len() < 2 {
                return Err(anyhow!("position requires 'startpos' or 'sfen'"));
            }
            Ok(UpstreamCommand::Position(join(&parts)))
        }
        "go" => Ok(UpstreamCommand::Go(GoParams::parse(&parts[1..])?)),
        _ => Ok(UpstreamCommand::Other(join(&parts))),
    }
}

fn parse_setoption(parts: &[String]) -> Result<UpstreamCommand> {
    // name <name> [value <value>]
    if parts.len() < 2 || parts[0] != "name" {
        return Err(anyhow!("invalid setoption format"));
    }
    let value_pos = index_of(parts, "value");
    let name = match value_pos {
        Some(pos) => join(&parts[1..pos]),
        None => join(&parts[1..]),
    };
    let value = value_pos
        .map(|pos| join(&parts[pos + 1..]))
        .filter(|v| !v.is_empty());
    Ok(UpstreamCommand::SetOption { name, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_collapse_whitespace() {
        let tokens = split("  info  depth 3\tpv 7g7f  ");
        assert_eq!(tokens, vec!["info", "depth", "3", "pv", "7g7f"]);
        assert_eq!(join(&tokens), "info depth 3 pv 7g7f");
        assert_eq!(normalize("bestmove   7g7f"), "bestmove 7g7f");
    }

    #[test]
    fn token_helpers_find_values() {
        let tokens = split("info depth 12 nodes 3400 nps 1200 score cp -35 pv 2g2f 8c8d");
        assert_eq!(value_after(&tokens, "depth"), Some("12"));
        assert_eq!(parse_after::<i32, _>(&tokens, "cp"), Some(-35));
        assert_eq!(parse_after::<u64, _>(&tokens, "missing"), None);

        let replaced = replace_after(&tokens, "nps", "9999");
        assert_eq!(value_after(&replaced, "nps"), Some("9999"));
        // 末尾のキーは置き換えようがないのでそのまま
        let tail = replace_after(&split("info nps"), "nps", "1");
        assert_eq!(tail, vec!["info", "nps"]);
    }

    #[test]
    fn parse_go_reads_clock_fields() {
        let cmd = parse_upstream_command("go ponder btime 60000 wtime 50000 byoyomi 10000").unwrap();
        let UpstreamCommand::Go(params) = cmd else {
            panic!("expected go");
        };
        assert!(params.ponder);
        assert_eq!(params.btime, Some(60_000));
        assert_eq!(params.wtime, Some(50_000));
        assert_eq!(params.byoyomi, Some(10_000));
        assert_eq!(params.clock_for(false), (Some(50_000), 0));
        assert!(!params.is_unclocked());
    }

    #[test]
    fn parse_go_rejects_missing_value() {
        assert!(parse_upstream_command("go btime").is_err());
        assert!(parse_upstream_command("go btime abc").is_err());
    }

    #[test]
    fn go_infinite_and_nodes_are_unclocked() {
        let params = GoParams::parse(&split("infinite")).unwrap();
        assert!(params.is_unclocked());
        let params = GoParams::parse(&split("nodes 10000")).unwrap();
        assert_eq!(params.nodes, Some(10_000));
        assert!(params.is_unclocked());
        let params = GoParams::parse(&split("mate infinite")).unwrap();
        assert!(params.mate);
    }

    #[test]
    fn ponder_command_halves_increments() {
        let params = GoParams::parse(&split("btime 60000 wtime 60000 binc 10000 winc 10000")).unwrap();
        assert_eq!(
            params.ponder_command(),
            "go ponder btime 60000 wtime 60000 binc 5000 winc 5000"
        );
        assert_eq!(GoParams::default().ponder_command(), "go ponder");
    }

    #[test]
    fn parse_setoption_with_spaces() {
        let cmd = parse_upstream_command("setoption name Book File value a b.db").unwrap();
        assert_eq!(
            cmd,
            UpstreamCommand::SetOption {
                name: "Book File".to_string(),
                value: Some("a b.db".to_string()),
            }
        );
        let cmd = parse_upstream_command("setoption name Clear Hash").unwrap();
        assert_eq!(
            cmd,
            UpstreamCommand::SetOption {
                name: "Clear Hash".to_string(),
                value: None,
            }
        );
    }

    #[test]
    fn unknown_commands_pass_through() {
        let cmd = parse_upstream_command("gameover win").unwrap();
        assert_eq!(cmd, UpstreamCommand::GameOver);
        let cmd = parse_upstream_command("d   ").unwrap();
        assert_eq!(cmd, UpstreamCommand::Other("d".to_string()));
        assert!(parse_upstream_command("   ").is_err());
        assert_eq!(
            parse_upstream_command("position  startpos moves 7g7f").unwrap(),
            UpstreamCommand::Position("position startpos moves 7g7f".to_string())
        );
    }
}
