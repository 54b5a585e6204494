use crate::batch::{StreamConvertor, Tokenizer};
use crate::error::{FusionError, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

// ===== 語彙 =====

/// vocab.txt（1行1トークン）の語彙
pub struct Vocabulary {
    token_to_id: HashMap<String, usize>,
    id_to_token: Vec<String>,
    unk_id: usize,
}

impl Vocabulary {
    pub const UNK: &'static str = "[UNK]";

    pub fn from_tokens(tokens: Vec<String>) -> Self {
        let mut token_to_id = HashMap::new();
        for (id, token) in tokens.iter().enumerate() {
            token_to_id.entry(token.clone()).or_insert(id);
        }
        let unk_id = token_to_id.get(Self::UNK).copied().unwrap_or(0);

        Self {
            token_to_id,
            id_to_token: tokens,
            unk_id,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let tokens: Vec<String> = content.lines().map(|line| line.trim().to_string()).collect();
        info!("語彙を読み込みました: {} トークン ({:?})", tokens.len(), path.as_ref());
        Ok(Self::from_tokens(tokens))
    }

    pub fn tokens(&self) -> &[String] {
        &self.id_to_token
    }

    /// 1文字ずつID化（未知文字は [UNK]）
    pub fn encode(&self, text: &str) -> Vec<usize> {
        text.chars()
            .map(|c| {
                self.token_to_id
                    .get(c.to_string().as_str())
                    .copied()
                    .unwrap_or(self.unk_id)
            })
            .collect()
    }

    /// 範囲外のIDは読み飛ばす
    pub fn decode(&self, ids: &[usize]) -> String {
        ids.iter()
            .filter_map(|&id| self.id_to_token.get(id))
            .map(String::as_str)
            .collect()
    }
}

impl Tokenizer for Vocabulary {
    fn convert_ids_to_tokens(&self, ids: &[usize]) -> Vec<String> {
        ids.iter()
            .map(|&id| {
                self.id_to_token
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| Self::UNK.to_string())
            })
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }
}

// ===== コード表による変換 =====

/// 「文字<TAB>コード」の表で文字を記号列に変換する（拼音・五筆・品詞）
///
/// コードの各文字が1記号。記号IDは1から（0はパディング）。
pub struct CodeTableConvertor {
    codes: HashMap<char, Vec<usize>>,
    symbols: HashMap<char, usize>,
    max_len: usize,
}

impl CodeTableConvertor {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (char, &'a str)>, max_len: usize) -> Self {
        let mut symbols: HashMap<char, usize> = HashMap::new();
        let mut codes = HashMap::new();

        for (ch, code) in entries {
            if codes.contains_key(&ch) {
                continue; // 多音字は最初の読みを使う
            }
            let ids: Vec<usize> = code
                .chars()
                .take(max_len)
                .map(|symbol| {
                    let next_id = symbols.len() + 1;
                    *symbols.entry(symbol).or_insert(next_id)
                })
                .collect();
            codes.insert(ch, ids);
        }

        Self {
            codes,
            symbols,
            max_len,
        }
    }

    pub fn load(path: impl AsRef<Path>, max_len: usize) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut entries = Vec::new();

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let (Some(key), Some(code)) = (fields.next(), fields.next()) else {
                return Err(FusionError::InvalidConfig(format!(
                    "{:?} の {} 行目はタブ区切りではありません",
                    path,
                    line_no + 1
                )));
            };
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(ch), None) => entries.push((ch, code.trim())),
                _ => warn!("{:?} の {} 行目: 1文字でないキー {:?} を無視します", path, line_no + 1, key),
            }
        }

        let convertor = Self::from_entries(entries, max_len);
        info!(
            "コード表を読み込みました: {} 文字, 記号 {} 種 ({:?})",
            convertor.codes.len(),
            convertor.symbols.len(),
            path
        );
        Ok(convertor)
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl StreamConvertor for CodeTableConvertor {
    fn convert(&self, tokens: &[String]) -> (Vec<Vec<usize>>, Vec<usize>) {
        let codes: Vec<Vec<usize>> = tokens
            .iter()
            .map(|token| {
                let mut chars = token.chars();
                match (chars.next(), chars.next()) {
                    (Some(ch), None) => self.codes.get(&ch).cloned().unwrap_or_default(),
                    _ => Vec::new(),
                }
            })
            .collect();
        let lengths = codes.iter().map(Vec::len).collect();
        (codes, lengths)
    }

    fn symbol_space_size(&self) -> usize {
        self.symbols.len() + 1
    }
}
