/* ------------------------------------------------------------------ */
/* Tokenizer: the Codec seam plus a char-level / BPE implementation   */
/* ------------------------------------------------------------------ */
//
// Anything that maps text <-> u32 ids can drive training and generation through
// `Codec`. The bundled `Tokenizer` is trained from the corpus itself:
//   Tokenizer::from_text(text)              → char-level
//   Tokenizer::from_text_bpe(text, target)  → byte-pair merges up to `target`
//   Tokenizer::load(path) / save(path)      → vocab.json (serde_json)
//
// Ids 0 and 1 are reserved for <|bos|> / <|eos|> in both modes and are skipped
// on decode. Characters never seen during training are dropped on encode.

use std::collections::{BinaryHeap, HashMap};
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub trait Codec {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, ids: &[u32]) -> String;
    fn vocab_size(&self) -> usize;
}

const BOS: &str = "<|bos|>";
const EOS: &str = "<|eos|>";
const BOS_ID: u32 = 0;
const EOS_ID: u32 = 1;

// ── Shared public struct ───────────────────────────────────────────────────

pub struct Tokenizer {
    mode: TokenizerMode,
}

enum TokenizerMode {
    Char(CharTokenizer),
    Bpe(BpeTokenizer),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum VocabKind {
    Char,
    Bpe,
}

// vocab.json layout, shared by both modes
#[derive(Serialize, Deserialize)]
struct VocabFile {
    kind: VocabKind,
    vocab: Vec<String>,            // token_id → token_string
    #[serde(default)]
    merges: Vec<(String, String)>, // ordered merge rules (left, right)
}

impl Tokenizer {
    pub fn from_text(text: &str) -> Self {
        Self { mode: TokenizerMode::Char(CharTokenizer::from_text(text)) }
    }

    pub fn from_text_bpe(text: &str, target_vocab: usize) -> Self {
        Self { mode: TokenizerMode::Bpe(BpeTokenizer::train(text, target_vocab)) }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let file: VocabFile = serde_json::from_str(&json)?;
        if file.vocab.len() < 2 || file.vocab[0] != BOS || file.vocab[1] != EOS {
            return Err(Error::InvalidConfig(format!(
                "{}: vocabulary must start with {BOS} and {EOS}",
                path.display()
            )));
        }
        let mode = match file.kind {
            VocabKind::Char => TokenizerMode::Char(CharTokenizer::from_vocab(&file.vocab[2..])?),
            VocabKind::Bpe => TokenizerMode::Bpe(BpeTokenizer::from_parts(file.vocab, file.merges)),
        };
        Ok(Self { mode })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = match &self.mode {
            TokenizerMode::Char(ct) => VocabFile {
                kind: VocabKind::Char,
                vocab: [BOS.to_string(), EOS.to_string()]
                    .into_iter()
                    .chain(ct.idx_to_char.iter().map(|c| c.to_string()))
                    .collect(),
                merges: Vec::new(),
            },
            TokenizerMode::Bpe(bt) => VocabFile {
                kind: VocabKind::Bpe,
                vocab: bt.vocab.clone(),
                merges: bt.merges.clone(),
            },
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn is_bpe(&self) -> bool {
        matches!(self.mode, TokenizerMode::Bpe(_))
    }

    // ── Convenience: first N vocab entries as display strings ───────────

    pub fn sample_tokens(&self, n: usize) -> Vec<String> {
        match &self.mode {
            TokenizerMode::Char(ct) => {
                ct.idx_to_char.iter().take(n).map(|c| format!("{:?}", c)).collect()
            }
            TokenizerMode::Bpe(bt) => {
                bt.vocab.iter().skip(2).take(n).map(|s| format!("{:?}", s)).collect()
            }
        }
    }
}

impl Codec for Tokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        match &self.mode {
            TokenizerMode::Char(ct) => ct.encode(text),
            TokenizerMode::Bpe(bt)  => bt.encode(text),
        }
    }

    fn decode(&self, ids: &[u32]) -> String {
        match &self.mode {
            TokenizerMode::Char(ct) => ct.decode(ids),
            TokenizerMode::Bpe(bt)  => bt.decode(ids),
        }
    }

    fn vocab_size(&self) -> usize {
        match &self.mode {
            TokenizerMode::Char(ct) => ct.idx_to_char.len() + 2,
            TokenizerMode::Bpe(bt)  => bt.vocab.len(),
        }
    }
}

// ── Char-level tokenizer ───────────────────────────────────────────────────

struct CharTokenizer {
    char_to_idx: HashMap<char, u32>,
    idx_to_char: Vec<char>, // id - 2 → char
}

impl CharTokenizer {
    fn from_text(text: &str) -> Self {
        let mut chars: Vec<char> = text.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        Self::from_chars(chars)
    }

    fn from_vocab(entries: &[String]) -> Result<Self> {
        let chars = entries
            .iter()
            .map(|s| {
                let mut it = s.chars();
                match (it.next(), it.next()) {
                    (Some(c), None) => Ok(c),
                    _ => Err(Error::InvalidConfig(format!("char vocabulary entry {s:?} is not one character"))),
                }
            })
            .collect::<Result<Vec<char>>>()?;
        Ok(Self::from_chars(chars))
    }

    fn from_chars(idx_to_char: Vec<char>) -> Self {
        let char_to_idx = idx_to_char
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32 + 2))
            .collect();
        Self { char_to_idx, idx_to_char }
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        text.chars()
            .filter_map(|c| self.char_to_idx.get(&c).copied())
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|&&id| id >= 2)
            .filter_map(|&id| self.idx_to_char.get(id as usize - 2))
            .collect()
    }
}

// ── BPE tokenizer ──────────────────────────────────────────────────────────

struct BpeTokenizer {
    vocab:       Vec<String>,          // token_id → string
    token_to_id: HashMap<String, u32>,
    merges:      Vec<(String, String)>,
    // (left_id, right_id) → merged_id; lower merged id = earlier merge = higher priority
    merge_map:   HashMap<(u32, u32), u32>,
}

// Pair frequencies over the training stream, with a max-heap that is never
// updated in place: entries whose count no longer matches are dropped on pop.
struct PairStats {
    counts: HashMap<(u32, u32), i64>,
    heap:   BinaryHeap<(i64, u32, u32)>,
}

impl PairStats {
    fn count(ids: &[u32]) -> Self {
        let mut counts: HashMap<(u32, u32), i64> = HashMap::new();
        for w in ids.windows(2) {
            *counts.entry((w[0], w[1])).or_insert(0) += 1;
        }
        let heap = counts.iter().map(|(&(l, r), &n)| (n, l, r)).collect();
        Self { counts, heap }
    }

    fn add(&mut self, pair: (u32, u32), delta: i64) {
        let n = self.counts.entry(pair).or_insert(0);
        *n += delta;
        if *n > 0 {
            self.heap.push((*n, pair.0, pair.1));
        }
    }

    /// Most frequent pair still present. Ties go to the larger ids.
    fn pop_most_frequent(&mut self) -> Option<(u32, u32)> {
        while let Some((n, l, r)) = self.heap.pop() {
            if n > 0 && self.counts.get(&(l, r)) == Some(&n) {
                return Some((l, r));
            }
        }
        None
    }
}

// Rewrite every non-overlapping `pair` in `ids` as `merged`, left to right,
// compacting in place. Only the neighbours of each hit change in `stats`.
fn apply_merge(ids: &mut Vec<u32>, pair: (u32, u32), merged: u32, stats: &mut PairStats) {
    let (left, right) = pair;
    let (mut read, mut write) = (0, 0);
    while read < ids.len() {
        if ids[read] != left || ids.get(read + 1) != Some(&right) {
            ids[write] = ids[read];
            read += 1;
            write += 1;
            continue;
        }
        stats.add(pair, -1);
        if write > 0 {
            let prev = ids[write - 1];
            stats.add((prev, left), -1);
            stats.add((prev, merged), 1);
        }
        if let Some(&after) = ids.get(read + 2) {
            stats.add((right, after), -1);
            stats.add((merged, after), 1);
        }
        ids[write] = merged;
        read += 2;
        write += 1;
    }
    ids.truncate(write);
}

fn index_tokens(vocab: &[String]) -> HashMap<String, u32> {
    vocab.iter().enumerate().map(|(i, s)| (s.clone(), i as u32)).collect()
}

impl BpeTokenizer {
    // ── Training ──────────────────────────────────────────────────────
    //
    // Base vocabulary is the reserved ids plus every distinct char, sorted.
    // Each merge takes the most frequent adjacent pair and rewrites the
    // stream, so a merge costs one pass instead of a full recount.

    fn train(text: &str, target_vocab: usize) -> Self {
        let mut chars: Vec<char> = text.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        let mut vocab: Vec<String> = [BOS, EOS].iter().map(|s| s.to_string())
            .chain(chars.iter().map(|c| c.to_string()))
            .collect();
        let mut token_to_id = index_tokens(&vocab);

        let mut ids: Vec<u32> = text.chars()
            .filter_map(|c| token_to_id.get(&c.to_string()).copied())
            .collect();
        let mut stats = PairStats::count(&ids);

        let n_merges = target_vocab.saturating_sub(vocab.len());
        let report_every = (n_merges / 10).max(1);
        let mut merges: Vec<(String, String)> = Vec::with_capacity(n_merges);

        while merges.len() < n_merges {
            let Some((l, r)) = stats.pop_most_frequent() else { break };
            if merges.len() % report_every == 0 {
                log::debug!("BPE training: {}/{} merges, vocab {}", merges.len(), n_merges, vocab.len());
            }
            let (ls, rs) = (vocab[l as usize].clone(), vocab[r as usize].clone());
            let merged = vocab.len() as u32;
            let token = format!("{ls}{rs}");
            token_to_id.insert(token.clone(), merged);
            vocab.push(token);
            merges.push((ls, rs));
            apply_merge(&mut ids, (l, r), merged, &mut stats);
        }
        log::info!("BPE trained: {} merges, vocab {}", merges.len(), vocab.len());

        let merge_map = build_merge_map(&merges, &token_to_id);
        Self { vocab, token_to_id, merges, merge_map }
    }

    fn from_parts(vocab: Vec<String>, merges: Vec<(String, String)>) -> Self {
        let token_to_id = index_tokens(&vocab);
        let merge_map = build_merge_map(&merges, &token_to_id);
        Self { vocab, token_to_id, merges, merge_map }
    }

    // ── Encode ────────────────────────────────────────────────────────
    //
    // Start from chars, then repeatedly apply the highest-priority merge
    // present anywhere in the sequence, all non-overlapping instances in one
    // left-to-right pass. Lines are independent and encoded in parallel.

    fn encode_chunk(&self, text: &str) -> Vec<u32> {
        let mut tokens: Vec<u32> = text.chars()
            .filter_map(|c| self.token_to_id.get(&c.to_string()).copied())
            .collect();

        while tokens.len() >= 2 {
            let best = tokens.windows(2)
                .filter_map(|w| self.merge_map.get(&(w[0], w[1])).copied())
                .min();
            let Some(merged_id) = best else { break };

            let mut out: Vec<u32> = Vec::with_capacity(tokens.len());
            let mut i = 0;
            while i < tokens.len() {
                if i + 1 < tokens.len()
                    && self.merge_map.get(&(tokens[i], tokens[i + 1])) == Some(&merged_id)
                {
                    out.push(merged_id);
                    i += 2;
                    continue;
                }
                out.push(tokens[i]);
                i += 1;
            }
            tokens = out;
        }
        tokens
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        let lines: Vec<&str> = text.split('\n').collect();
        // A corpus without newlines has no id for one; the lines are then joined directly.
        let nl_id = self.token_to_id.get("\n").copied();
        let last = lines.len() - 1;

        lines.par_iter()
            .enumerate()
            .flat_map_iter(|(i, line)| {
                let mut chunk = self.encode_chunk(line);
                if i < last {
                    chunk.extend(nl_id);
                }
                chunk
            })
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|&&id| id != BOS_ID && id != EOS_ID)
            .filter_map(|&id| self.vocab.get(id as usize))
            .map(String::as_str)
            .collect()
    }
}

fn build_merge_map(
    merges: &[(String, String)],
    token_to_id: &HashMap<String, u32>,
) -> HashMap<(u32, u32), u32> {
    let mut map = HashMap::new();
    for (left, right) in merges {
        if let (Some(&l), Some(&r)) = (token_to_id.get(left), token_to_id.get(right)) {
            if let Some(&m) = token_to_id.get(&format!("{left}{right}")) {
                map.entry((l, r)).or_insert(m);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "the cat sat on the mat.\nthe dog sat on the log.\n";

    #[test]
    fn char_round_trip() {
        let tok = Tokenizer::from_text(TEXT);
        let ids = tok.encode("the dog");
        assert!(ids.iter().all(|&id| id >= 2 && (id as usize) < tok.vocab_size()));
        assert_eq!(tok.decode(&ids), "the dog");
    }

    #[test]
    fn unknown_chars_are_dropped() {
        let tok = Tokenizer::from_text("abc");
        assert_eq!(tok.decode(&tok.encode("aZc")), "ac");
    }

    #[test]
    fn bpe_round_trip_and_compresses() {
        let tok = Tokenizer::from_text_bpe(TEXT, 60);
        assert!(tok.is_bpe());
        let ids = tok.encode(TEXT);
        assert_eq!(tok.decode(&ids), TEXT);
        assert!(ids.len() < TEXT.chars().count());
    }

    #[test]
    fn bpe_without_newline_in_vocab() {
        let tok = Tokenizer::from_text_bpe("abab abab", 10);
        let ids = tok.encode("ab\nab");
        assert_eq!(tok.decode(&ids), "abab");
    }

    #[test]
    fn merge_rewrites_runs_and_keeps_pair_counts_exact() {
        // a a a a b a a
        let mut ids = vec![2, 2, 2, 2, 3, 2, 2];
        let mut stats = PairStats::count(&ids);
        apply_merge(&mut ids, (2, 2), 9, &mut stats);
        assert_eq!(ids, vec![9, 9, 3, 9]);

        let recount = PairStats::count(&ids);
        for (pair, &n) in &stats.counts {
            assert_eq!(n, recount.counts.get(pair).copied().unwrap_or(0), "{pair:?}");
        }
        assert_eq!(stats.pop_most_frequent().map(|p| stats.counts[&p]), Some(1));
    }

    #[test]
    fn most_frequent_pair_is_merged_first() {
        let tok = Tokenizer::from_text_bpe("xyxyxyz", 2 + 3 + 1);
        let TokenizerMode::Bpe(bpe) = &tok.mode else { panic!("expected BPE") };
        assert_eq!(bpe.merges, vec![("x".to_string(), "y".to_string())]);
        assert_eq!(tok.encode("xyz").len(), 2);
    }

    #[test]
    fn special_ids_decode_to_nothing() {
        let tok = Tokenizer::from_text("xy");
        let mut ids = vec![BOS_ID];
        ids.extend(tok.encode("xy"));
        ids.push(EOS_ID);
        assert_eq!(tok.decode(&ids), "xy");
    }

    #[test]
    fn save_and_load_both_modes() -> Result<()> {
        let dir = std::env::temp_dir();
        for (i, tok) in [Tokenizer::from_text(TEXT), Tokenizer::from_text_bpe(TEXT, 50)].into_iter().enumerate() {
            let path = dir.join(format!("tinygpt-vocab-{}-{i}.json", std::process::id()));
            tok.save(&path)?;
            let loaded = Tokenizer::load(&path)?;
            std::fs::remove_file(&path)?;
            assert_eq!(loaded.vocab_size(), tok.vocab_size());
            assert_eq!(loaded.encode(TEXT), tok.encode(TEXT));
        }
        Ok(())
    }
}
