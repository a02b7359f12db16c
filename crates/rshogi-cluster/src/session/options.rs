//! エンジンごとの setoption 上書き表。

use crate::config::OptionOverride;
use crate::protocol::{index_of, join, split};

/// 上書き表。先に書いたものが優先される。
#[derive(Debug, Clone, Default)]
pub struct OptionOverrides {
    entries: Vec<OptionOverride>,
}

impl OptionOverrides {
    pub fn new(entries: Vec<OptionOverride>) -> Self {
        Self { entries }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.value.as_str())
    }

    /// `setoption name <name> value <value>` の値を上書き表で置き換える。
    /// setoption 以外の行、表に無いオプション、値を持たない行はそのまま返す。
    pub fn rewrite(&self, line: &str) -> String {
        if self.entries.is_empty() {
            return line.to_string();
        }
        let tokens = split(line);
        if tokens.first().map(String::as_str) != Some("setoption")
            || tokens.get(1).map(String::as_str) != Some("name")
        {
            return line.to_string();
        }
        let Some(value_pos) = index_of(&tokens, "value") else {
            return line.to_string();
        };
        let name = join(&tokens[2..value_pos]);
        match self.lookup(&name) {
            Some(value) => format!("setoption name {name} value {value}"),
            None => line.to_string(),
        }
    }
}
