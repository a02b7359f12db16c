//! USI `position` 行の分解と、子局面 / 親局面の導出。
//!
//! 盤面そのものは解釈しない。局面は「開始局面 + 指し手列」の文字列として扱い、
//! 先読みの割り当てに必要な操作 (1 手進める・1 手戻す・部分木判定) と、
//! 時間配分に必要な手数・手番だけを提供する。

use anyhow::{bail, Result};

use crate::protocol::{join, split};

/// USI position 行を分解した結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPosition {
    pub startpos: bool,
    pub sfen: Option<String>,
    pub moves: Vec<String>,
}

impl ParsedPosition {
    /// `position ...` 形式の行をパースする。先頭の `position` は省略可。
    pub fn parse(line: &str) -> Result<Self> {
        let tokens = split(line);
        let mut iter = tokens.iter().map(String::as_str).peekable();
        if iter.peek().is_some_and(|tok| *tok == "position") {
            iter.next();
        }
        let (startpos, sfen) = match iter.next() {
            Some("startpos") => (true, None),
            Some("sfen") => {
                let mut sfen_tokens = Vec::new();
                while let Some(token) = iter.peek() {
                    if *token == "moves" {
                        break;
                    }
                    sfen_tokens.push(*token);
                    iter.next();
                }
                if sfen_tokens.is_empty() {
                    bail!("missing SFEN payload");
                }
                (false, Some(join(&sfen_tokens)))
            }
            other => bail!("expected 'startpos' or 'sfen' after 'position', got {other:?}"),
        };
        let moves = match iter.next() {
            Some("moves") => iter.map(str::to_string).collect(),
            Some(other) => bail!("expected 'moves' before move list, got '{other}'"),
            None => Vec::new(),
        };
        Ok(Self {
            startpos,
            sfen,
            moves,
        })
    }

    /// `position ...` 行へ戻す。
    pub fn describe(&self) -> String {
        let mut buf = String::from("position ");
        if self.startpos {
            buf.push_str("startpos");
        } else if let Some(sfen) = &self.sfen {
            buf.push_str("sfen ");
            buf.push_str(sfen);
        }
        if !self.moves.is_empty() {
            buf.push_str(" moves ");
            buf.push_str(&self.moves.join(" "));
        }
        buf
    }

    /// 開始局面の手番が先手か。
    fn initial_black_to_move(&self) -> bool {
        if self.startpos {
            return true;
        }
        // sfen <board> <side> <hand> <ply>
        self.sfen
            .as_deref()
            .and_then(|s| s.split_whitespace().nth(1))
            .is_none_or(|side| side != "w")
    }

    /// 開始局面の手数 (1 始まり)。
    fn initial_ply(&self) -> u32 {
        if self.startpos {
            return 1;
        }
        self.sfen
            .as_deref()
            .and_then(|s| s.split_whitespace().nth(3))
            .and_then(|p| p.parse::<u32>().ok())
            .unwrap_or(1)
            .max(1)
    }

    /// 現在局面の手番が先手か。
    pub fn black_to_move(&self) -> bool {
        self.initial_black_to_move() == (self.moves.len() % 2 == 0)
    }

    /// 現在局面の手数 (1 始まり)。
    pub fn game_ply(&self) -> u32 {
        let played = u32::try_from(self.moves.len()).unwrap_or(u32::MAX);
        self.initial_ply().saturating_add(played)
    }

    fn same_root(&self, other: &ParsedPosition) -> bool {
        self.startpos == other.startpos && self.sfen == other.sfen
    }
}

/// `parent` に 1 手 `mv` を加えた子局面の position 行を返す。
pub fn child_position(parent: &str, mv: &str) -> Result<String> {
    let mut parsed = ParsedPosition::parse(parent)?;
    parsed.moves.push(mv.to_string());
    Ok(parsed.describe())
}

/// 最後の 1 手を取り除いた親局面と、その 1 手を返す。指し手が無ければ `None`。
pub fn split_last_move(position: &str) -> Option<(String, String)> {
    let mut parsed = ParsedPosition::parse(position).ok()?;
    let last = parsed.moves.pop()?;
    Some((parsed.describe(), last))
}

/// `position` が `root` 以下の部分木 (root 自身を含む) にあるか。
pub fn is_within_subtree(position: &str, root: &str) -> bool {
    let (Ok(pos), Ok(root)) = (ParsedPosition::parse(position), ParsedPosition::parse(root))
    else {
        return false;
    };
    pos.same_root(&root) && pos.moves.starts_with(&root.moves)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HIRATE: &str = "lnsgkgsnl/1r5b1/ppppppppp/9/9/9/PPPPPPPPP/1B5R1/LNSGKGSNL b - 1";

    #[test]
    fn parse_covers_startpos_and_sfen() {
        let parsed = ParsedPosition::parse("position startpos moves 7g7f 3c3d").unwrap();
        assert!(parsed.startpos);
        assert_eq!(parsed.moves, vec!["7g7f", "3c3d"]);

        let line = format!("position sfen {HIRATE} moves 7g7f");
        let parsed_sfen = ParsedPosition::parse(&line).unwrap();
        assert!(!parsed_sfen.startpos);
        assert_eq!(parsed_sfen.moves, vec!["7g7f"]);
        assert_eq!(parsed_sfen.sfen.as_deref(), Some(HIRATE));
        assert_eq!(parsed_sfen.describe(), line);
    }

    #[test]
    fn parse_rejects_missing_moves_keyword() {
        assert!(ParsedPosition::parse("position startpos 7g7f").is_err());
        assert!(ParsedPosition::parse("position sfen").is_err());
        assert!(ParsedPosition::parse("position").is_err());
    }

    #[test]
    fn child_appends_exactly_one_move() {
        let root = "position startpos moves 7g7f 3c3d";
        let child = child_position(root, "2g2f").unwrap();
        assert_eq!(child, "position startpos moves 7g7f 3c3d 2g2f");

        let root_tokens = split(root);
        let child_tokens = split(&child);
        assert_eq!(child_tokens.len(), root_tokens.len() + 1);
        assert_eq!(&child_tokens[..root_tokens.len()], &root_tokens[..]);

        assert_eq!(child_position("position startpos", "7g7f").unwrap(), "position startpos moves 7g7f");
    }

    #[test]
    fn split_last_move_inverts_child() {
        let child = child_position("position startpos moves 7g7f", "3c3d").unwrap();
        let (parent, mv) = split_last_move(&child).unwrap();
        assert_eq!(parent, "position startpos moves 7g7f");
        assert_eq!(mv, "3c3d");
        assert_eq!(split_last_move("position startpos"), None);
    }

    #[test]
    fn subtree_membership_follows_move_prefix() {
        let root = "position startpos moves 7g7f";
        assert!(is_within_subtree(root, root));
        assert!(is_within_subtree("position startpos moves 7g7f 3c3d 2g2f", root));
        assert!(!is_within_subtree("position startpos moves 2g2f", root));
        assert!(!is_within_subtree("position startpos", root));
        let sfen = format!("position sfen {HIRATE} moves 7g7f");
        assert!(!is_within_subtree(&sfen, root));
    }

    #[test]
    fn side_to_move_and_ply() {
        let pos = ParsedPosition::parse("position startpos moves 7g7f").unwrap();
        assert!(!pos.black_to_move());
        assert_eq!(pos.game_ply(), 2);

        let white = ParsedPosition::parse(
            "position sfen lnsgkgsnl/1r5b1/ppppppppp/9/9/2P6/PP1PPPPPP/1B5R1/LNSGKGSNL w - 2",
        )
        .unwrap();
        assert!(!white.black_to_move());
        assert_eq!(white.game_ply(), 2);
    }

    #[test]
    fn huge_sfen_ply_saturates() {
        let line = "position sfen lnsgkgsnl/1r5b1/ppppppppp/9/9/9/PPPPPPPPP/1B5R1/LNSGKGSNL b - 4294967295 moves 7g7f 3c3d";
        let pos = ParsedPosition::parse(line).unwrap();
        assert_eq!(pos.game_ply(), u32::MAX);
        assert!(pos.black_to_move());
    }
}
