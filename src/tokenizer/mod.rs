//! Byte-level BPE tokenizer.
//!
//! The vocabulary asset is a JSON file that stores tokens as base64-encoded
//! byte sequences with merge ranks. Token IDs are partitioned: IDs
//! `0..num_special` are reserved control tokens matched as literal
//! substrings before BPE ever runs; regular tokens occupy
//! `num_special..vocab_size` with ID = merge rank + `num_special`, applied
//! identically on the encode and decode maps.

pub mod ctc;

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use base64::prelude::*;
use regex::Regex;
use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Lookahead-free default pre-tokenizer pattern. The reference pattern uses
/// lookaheads the `regex` crate cannot express; the difference only affects
/// how whitespace runs are split, not the byte content.
const DEFAULT_PATTERN: &str =
    r"'(?:[sdmt]|ll|ve|re)| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+";

/// Tokenizer global configuration from JSON.
#[derive(Debug, Deserialize)]
struct VocabConfig {
    #[serde(default)]
    pattern: String,
    default_vocab_size: usize,
    default_num_special_tokens: usize,
}

/// Single vocabulary entry.
#[derive(Debug, Deserialize)]
struct VocabEntry {
    rank: u32,
    #[serde(default)]
    token_bytes: Option<String>,
    #[serde(default)]
    token_str: Option<String>,
    #[serde(default)]
    is_control: bool,
}

#[derive(Debug, Deserialize)]
struct VocabJson {
    config: VocabConfig,
    vocab: Vec<VocabEntry>,
}

/// Byte-level BPE tokenizer with a reserved special-token ID range.
pub struct BpeTokenizer {
    /// Merge rank -> token bytes, indexed by rank. ID = rank + num_special.
    rank_bytes: Vec<Option<Vec<u8>>>,
    /// Token bytes -> merge rank (encode direction).
    bytes_rank: HashMap<Vec<u8>, u32>,
    /// Special token ID (0..num_special) -> literal string.
    special_tokens: HashMap<u32, String>,
    /// Special literals sorted longest-first for longest-match splitting.
    special_by_len: Vec<(String, u32)>,
    pattern: Regex,
    vocab_size: usize,
    num_special: usize,
}

impl BpeTokenizer {
    /// Load the tokenizer from a vocabulary JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| EngineError::io(path, e))?;
        let parsed: VocabJson = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            EngineError::TokenizerAsset(format!("failed to parse {}: {e}", path.display()))
        })?;
        Self::from_parsed(parsed)
    }

    /// Load the tokenizer from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: VocabJson = serde_json::from_str(json)
            .map_err(|e| EngineError::TokenizerAsset(format!("failed to parse vocabulary: {e}")))?;
        Self::from_parsed(parsed)
    }

    /// Load from a model directory (looks for `tokenizer.json`).
    pub fn from_model_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::from_file(dir.as_ref().join("tokenizer.json"))
    }

    fn from_parsed(parsed: VocabJson) -> Result<Self> {
        let vocab_size = parsed.config.default_vocab_size;
        let num_special = parsed.config.default_num_special_tokens;
        if num_special >= vocab_size {
            return Err(EngineError::TokenizerAsset(format!(
                "reserved special range {num_special} exceeds vocab size {vocab_size}"
            )));
        }

        let pattern_src = if parsed.config.pattern.is_empty() {
            DEFAULT_PATTERN
        } else {
            &parsed.config.pattern
        };
        let pattern = Regex::new(pattern_src).map_err(|e| {
            EngineError::TokenizerAsset(format!("invalid pre-tokenizer pattern: {e}"))
        })?;

        let mut rank_bytes: Vec<Option<Vec<u8>>> = vec![None; vocab_size - num_special];
        let mut bytes_rank = HashMap::new();
        let mut special_tokens = HashMap::new();

        for entry in &parsed.vocab {
            if entry.is_control {
                if let Some(s) = &entry.token_str {
                    if (entry.rank as usize) >= num_special {
                        return Err(EngineError::TokenizerAsset(format!(
                            "control token {s:?} has rank {} outside the reserved range",
                            entry.rank
                        )));
                    }
                    special_tokens.insert(entry.rank, s.clone());
                }
                continue;
            }

            let bytes = if let Some(b64) = &entry.token_bytes {
                BASE64_STANDARD.decode(b64).map_err(|e| {
                    EngineError::TokenizerAsset(format!("bad base64 at rank {}: {e}", entry.rank))
                })?
            } else if let Some(s) = &entry.token_str {
                s.as_bytes().to_vec()
            } else {
                continue;
            };

            let rank = entry.rank as usize;
            if rank >= rank_bytes.len() {
                return Err(EngineError::TokenizerAsset(format!(
                    "merge rank {rank} exceeds the regular-token range ({})",
                    rank_bytes.len()
                )));
            }
            rank_bytes[rank] = Some(bytes.clone());
            bytes_rank.insert(bytes, entry.rank);
        }

        let mut special_by_len: Vec<(String, u32)> = special_tokens
            .iter()
            .map(|(id, s)| (s.clone(), *id))
            .collect();
        special_by_len.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1.cmp(&b.1)));

        Ok(Self {
            rank_bytes,
            bytes_rank,
            special_tokens,
            special_by_len,
            pattern,
            vocab_size,
            num_special,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn num_special(&self) -> usize {
        self.num_special
    }

    /// Look up a special token's ID by its literal string.
    pub fn special_id(&self, literal: &str) -> Option<u32> {
        self.special_by_len
            .iter()
            .find(|(s, _)| s == literal)
            .map(|(_, id)| *id)
    }

    /// Encode text to token IDs.
    ///
    /// Special-token literals are matched greedily (longest first) before
    /// the remaining runs go through pre-tokenization and BPE.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        let mut run = String::new();
        let mut rest = text;

        'outer: while !rest.is_empty() {
            for (literal, id) in &self.special_by_len {
                if let Some(tail) = rest.strip_prefix(literal.as_str()) {
                    self.encode_run(&run, &mut ids);
                    run.clear();
                    ids.push(*id);
                    rest = tail;
                    continue 'outer;
                }
            }
            let ch = rest.chars().next().expect("non-empty rest");
            run.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
        self.encode_run(&run, &mut ids);
        ids
    }

    /// Pre-tokenize a special-free run and BPE-encode each piece.
    fn encode_run(&self, run: &str, ids: &mut Vec<u32>) {
        if run.is_empty() {
            return;
        }
        for piece in self.pattern.find_iter(run) {
            self.encode_piece(piece.as_str().as_bytes(), ids);
        }
    }

    fn encode_piece(&self, bytes: &[u8], ids: &mut Vec<u32>) {
        // Direct vocabulary hit skips the merge loop.
        if let Some(&rank) = self.bytes_rank.get(bytes) {
            ids.push(rank + self.num_special as u32);
            return;
        }

        // Iterative BPE: repeatedly merge the lowest-rank adjacent pair.
        let mut parts: Vec<Vec<u8>> = bytes.iter().map(|&b| vec![b]).collect();
        loop {
            let mut best: Option<(usize, u32)> = None;
            for i in 0..parts.len().saturating_sub(1) {
                let mut candidate = parts[i].clone();
                candidate.extend_from_slice(&parts[i + 1]);
                if let Some(&rank) = self.bytes_rank.get(&candidate) {
                    if best.map_or(true, |(_, r)| rank < r) {
                        best = Some((i, rank));
                    }
                }
            }
            match best {
                Some((i, _)) => {
                    let right = parts.remove(i + 1);
                    parts[i].extend_from_slice(&right);
                }
                None => break,
            }
        }

        // Byte groups without a vocabulary entry are dropped. This mirrors
        // the reference behavior; it is unreachable when every single byte
        // has a base token.
        for part in parts {
            if let Some(&rank) = self.bytes_rank.get(&part) {
                ids.push(rank + self.num_special as u32);
            }
        }
    }

    /// Decode token IDs to text.
    ///
    /// When `skip_special` is set, reserved-range IDs contribute nothing;
    /// otherwise their literal strings are interleaved. Invalid UTF-8 in
    /// the accumulated bytes decodes lossily.
    pub fn decode(&self, ids: &[u32], skip_special: bool) -> String {
        let mut bytes = Vec::new();
        for &id in ids {
            if (id as usize) < self.num_special {
                if !skip_special {
                    if let Some(s) = self.special_tokens.get(&id) {
                        bytes.extend_from_slice(s.as_bytes());
                    }
                }
                continue;
            }
            let rank = id as usize - self.num_special;
            if let Some(Some(token_bytes)) = self.rank_bytes.get(rank) {
                bytes.extend_from_slice(token_bytes);
            }
            // Unknown IDs are silently skipped.
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Decode a single token ID to its display string.
    pub fn decode_token(&self, id: u32) -> Option<String> {
        if (id as usize) < self.num_special {
            return self.special_tokens.get(&id).cloned();
        }
        let rank = id as usize - self.num_special;
        self.rank_bytes
            .get(rank)
            .and_then(|b| b.as_ref())
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod test_vocab {
    use base64::prelude::*;

    /// Build a small but complete vocabulary JSON: three control tokens,
    /// all 256 single bytes, and a few merges.
    pub fn vocab_json(extra_merges: &[&str]) -> String {
        let mut entries = Vec::new();
        for (rank, name) in ["<pad>", "<bos>", "<eos>"].iter().enumerate() {
            entries.push(format!(
                r#"{{"rank": {rank}, "token_str": "{name}", "is_control": true}}"#
            ));
        }
        for b in 0u16..256 {
            let b64 = BASE64_STANDARD.encode([b as u8]);
            entries.push(format!(r#"{{"rank": {b}, "token_bytes": "{b64}"}}"#));
        }
        for (i, merge) in extra_merges.iter().enumerate() {
            let rank = 256 + i;
            let b64 = BASE64_STANDARD.encode(merge.as_bytes());
            entries.push(format!(r#"{{"rank": {rank}, "token_bytes": "{b64}"}}"#));
        }
        let vocab_size = 3 + 256 + extra_merges.len();
        format!(
            r#"{{
              "config": {{
                "pattern": "",
                "default_vocab_size": {vocab_size},
                "default_num_special_tokens": 3
              }},
              "vocab": [{}]
            }}"#,
            entries.join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::prelude::*;

    fn tokenizer(merges: &[&str]) -> BpeTokenizer {
        BpeTokenizer::from_json(&test_vocab::vocab_json(merges)).unwrap()
    }

    #[test]
    fn test_byte_level_roundtrip() {
        let tok = tokenizer(&[]);
        for text in ["hello world", "çà première ± ok", "tabs\tand\nnewlines", "123 + 456"] {
            let ids = tok.encode(text);
            assert_eq!(tok.decode(&ids, true), text, "roundtrip for {text:?}");
        }
    }

    #[test]
    fn test_id_layout() {
        let tok = tokenizer(&["th", "the"]);
        // Single byte 'a' (0x61) has rank 0x61, so ID = rank + num_special.
        let ids = tok.encode("a");
        assert_eq!(ids, vec![0x61 + 3]);
        assert_eq!(tok.num_special(), 3);
    }

    #[test]
    fn test_merges_apply_lowest_rank_first() {
        let tok = tokenizer(&["th", "the"]);
        let ids = tok.encode("the");
        // "th" (rank 256) merges first, then "th"+"e" -> "the" (rank 257).
        assert_eq!(ids, vec![257 + 3]);
        assert_eq!(tok.decode(&ids, true), "the");
    }

    #[test]
    fn test_special_token_is_single_reserved_id() {
        let tok = tokenizer(&[]);
        let ids = tok.encode("<eos>");
        assert_eq!(ids, vec![2]);

        let ids = tok.encode("hi<eos>yo");
        assert!(ids.contains(&2));
        assert_eq!(tok.decode(&ids, false), "hi<eos>yo");
        assert_eq!(tok.decode(&ids, true), "hiyo");
    }

    #[test]
    fn test_special_longest_match_wins() {
        let json = r#"{
          "config": {"pattern": "", "default_vocab_size": 260, "default_num_special_tokens": 4},
          "vocab": [
            {"rank": 0, "token_str": "<s>", "is_control": true},
            {"rank": 1, "token_str": "<ss>", "is_control": true},
            {"rank": 2, "token_str": "<pad>", "is_control": true},
            {"rank": 3, "token_str": "<unk>", "is_control": true},
            {"rank": 60, "token_bytes": "PA=="},
            {"rank": 115, "token_bytes": "cw=="},
            {"rank": 62, "token_bytes": "Pg=="}
          ]
        }"#;
        let tok = BpeTokenizer::from_json(json).unwrap();
        // "<ss>" must match as one special, not "<s>" followed by "s>".
        assert_eq!(tok.encode("<ss>"), vec![1]);
    }

    #[test]
    fn test_unknown_groups_are_dropped() {
        // Vocabulary missing byte 0xC3: the lead byte of "ÿ" has no entry
        // and is dropped rather than mapped to an unknown token.
        let mut entries: Vec<String> = Vec::new();
        entries.push(r#"{"rank": 0, "token_str": "<pad>", "is_control": true}"#.into());
        for b in (0u16..256).filter(|&b| b != 0xC3) {
            let b64 = BASE64_STANDARD.encode([b as u8]);
            entries.push(format!(r#"{{"rank": {b}, "token_bytes": "{b64}"}}"#));
        }
        let json = format!(
            r#"{{"config": {{"pattern": "", "default_vocab_size": 257, "default_num_special_tokens": 1}},
                 "vocab": [{}]}}"#,
            entries.join(",")
        );
        let tok = BpeTokenizer::from_json(&json).unwrap();
        let ids = tok.encode("\u{00ff}"); // UTF-8 bytes 0xC3 0xBF
        assert_eq!(ids.len(), 1, "the 0xC3 group should be dropped");
        let decoded = tok.decode(&ids, true);
        assert_ne!(decoded, "\u{00ff}");
    }

    #[test]
    fn test_rejects_special_outside_reserved_range() {
        let json = r#"{
          "config": {"pattern": "", "default_vocab_size": 100, "default_num_special_tokens": 1},
          "vocab": [{"rank": 5, "token_str": "<bad>", "is_control": true}]
        }"#;
        assert!(matches!(
            BpeTokenizer::from_json(json),
            Err(EngineError::TokenizerAsset(_))
        ));
    }

    #[test]
    fn test_decode_skips_unknown_ids() {
        let tok = tokenizer(&[]);
        let text = tok.decode(&[9999], true);
        assert_eq!(text, "");
    }
}
