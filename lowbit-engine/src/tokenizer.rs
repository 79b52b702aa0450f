//! Greedy longest-match tokenizer over a fixed vocabulary.
//!
//! - Built from the vocabulary stored in the model file, or from a JSON object
//!   mapping token strings to ids.
//! - Encodes text by repeatedly taking the longest vocabulary entry that prefixes
//!   the remaining input; characters with no entry are reported and skipped.
//! - Decodes ids back to bytes, joining partial UTF-8 sequences across tokens.

use anyhow::{Context, Result};
use log::warn;
use std::collections::HashMap;
use std::path::Path;

/// Spellings of the end-of-sequence token, in lookup order.
const EOS_CANDIDATES: [&str; 3] = ["<|endoftext|>", "</s>", "<eos>"];

pub struct Tokenizer {
    /// Token bytes by id; ids missing from a JSON vocabulary hold an empty entry.
    vocab: Vec<Vec<u8>>,
    ids: HashMap<Vec<u8>, u32>,
    /// Length in bytes of the longest token.
    max_token_length: usize,
    eos_token_id: Option<u32>,
}

impl Tokenizer {
    /// Builds a tokenizer from token bytes indexed by id.
    pub fn from_vocab(vocab: Vec<Vec<u8>>) -> Self {
        let mut ids = HashMap::with_capacity(vocab.len());
        for (id, token) in vocab.iter().enumerate() {
            // the first id of a duplicated spelling wins
            if !token.is_empty() {
                ids.entry(token.clone()).or_insert(id as u32);
            }
        }
        let max_token_length = vocab.iter().map(Vec::len).max().unwrap_or(0);
        let eos_token_id = EOS_CANDIDATES.iter().find_map(|s| ids.get(s.as_bytes()).copied());

        Self { vocab, ids, max_token_length, eos_token_id }
    }

    /// Parses a JSON object of the form `{"token": id, ...}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json).context("Failed to parse vocabulary JSON")?;
        let entries = value.as_object().ok_or_else(|| anyhow::anyhow!("Vocabulary JSON must be an object"))?;

        let mut pairs = Vec::with_capacity(entries.len());
        for (token, id) in entries {
            let id = id
                .as_u64()
                .and_then(|id| u32::try_from(id).ok())
                .ok_or_else(|| anyhow::anyhow!("Token '{token}' has an invalid id {id}"))?;
            pairs.push((token.as_bytes().to_vec(), id as usize));
        }

        let n_vocab = pairs.iter().map(|(_, id)| id + 1).max().unwrap_or(0);
        let mut vocab = vec![Vec::new(); n_vocab];
        for (token, id) in pairs {
            if !vocab[id].is_empty() {
                anyhow::bail!("Token id {id} is assigned twice");
            }
            vocab[id] = token;
        }
        Ok(Self::from_vocab(vocab))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocabulary file {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn n_vocab(&self) -> usize {
        self.vocab.len()
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.ids.get(token.as_bytes()).copied()
    }

    /// Raw bytes of a token; empty for ids outside the vocabulary.
    pub fn token_bytes(&self, id: u32) -> &[u8] {
        self.vocab.get(id as usize).map_or(&[], Vec::as_slice)
    }

    /// Splits `text` into the longest vocabulary entries, left to right.
    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        let bytes = text.as_bytes();
        let mut tokens = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            let longest = self.max_token_length.min(bytes.len() - pos);
            let found = (1..=longest).rev().find_map(|len| self.ids.get(&bytes[pos..pos + len]).map(|&id| (id, len)));

            match found {
                Some((id, len)) => {
                    tokens.push(id);
                    pos += len;
                }
                None => {
                    // byte-level tokens may have left `pos` inside a character
                    match text.get(pos..).and_then(|rest| rest.chars().next()) {
                        Some(ch) => {
                            warn!("Unknown character {ch:?} at byte {pos}, skipping");
                            pos += ch.len_utf8();
                        }
                        None => {
                            warn!("Unknown byte {:#04x} at {pos}, skipping", bytes[pos]);
                            pos += 1;
                        }
                    }
                }
            }
        }
        tokens
    }

    /// Concatenates token bytes and decodes them, replacing invalid UTF-8.
    pub fn decode(&self, tokens: &[u32]) -> String {
        let bytes: Vec<u8> = tokens.iter().flat_map(|&id| self.token_bytes(id).iter().copied()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let eos_token = self.eos_token_id.map(|id| (id, String::from_utf8_lossy(self.token_bytes(id)).into_owned()));

        f.debug_struct("Tokenizer")
            .field("n_vocab", &self.vocab.len())
            .field("max_token_length", &self.max_token_length)
            .field("eos_token_id", &eos_token)
            .finish_non_exhaustive()
    }
}
