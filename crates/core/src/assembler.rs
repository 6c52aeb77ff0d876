//! Turns a ranked shortlist into bounded, citable context.

use std::collections::BTreeMap;

use once_cell::sync::OnceCell;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::crypto::{CryptoVault, KeyStore};
use crate::error::{DoclinkError, Result};
use crate::model::{ChunkId, FileId, StoredText};
use crate::similarity::RankedChunk;

static TOKENIZER: OnceCell<CoreBPE> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetUnit {
    #[default]
    Chars,
    /// cl100k tokens.
    Tokens,
}

impl BudgetUnit {
    pub fn measure(self, text: &str) -> Result<usize> {
        match self {
            BudgetUnit::Chars => Ok(text.chars().count()),
            BudgetUnit::Tokens => {
                let bpe = TOKENIZER.get_or_try_init(|| {
                    tiktoken_rs::cl100k_base().map_err(|e| DoclinkError::Tokenizer(e.to_string()))
                })?;
                Ok(bpe.encode_with_special_tokens(text).len())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AssemblyConfig {
    pub merge_adjacent: bool,
    /// `None` leaves the context unbounded.
    pub max_context: Option<usize>,
    pub budget_unit: BudgetUnit,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            merge_adjacent: true,
            max_context: None,
            budget_unit: BudgetUnit::Chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextEntry {
    pub text: String,
    pub file_name: String,
    pub page_number: u32,
    pub file_id: FileId,
    /// In reading order; more than one when adjacent chunks were merged.
    pub chunk_ids: Vec<ChunkId>,
    pub score: f32,
    pub is_header: bool,
    pub is_table: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AuthenticationFailure,
    MalformedRecord,
    /// Removed between ranking and text fetch.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedChunk {
    pub chunk_id: ChunkId,
    pub file_id: FileId,
    pub reason: SkipReason,
}

/// What retrieval hands upstream. An empty `entries` list is the
/// legitimate "no evidence" outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Retrieval {
    pub entries: Vec<ContextEntry>,
    pub skipped: Vec<SkippedChunk>,
    pub dropped_by_budget: usize,
}

impl Retrieval {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Prompt block for the answer-generation collaborator.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!(
                "[DOC: {}, page {}]\n{}\n\n",
                entry.file_name, entry.page_number, entry.text
            ));
        }
        out
    }
}

struct Opened {
    rank: usize,
    chunk: RankedChunk,
    text: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    config: AssemblyConfig,
}

impl ContextAssembler {
    pub fn new(config: AssemblyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Decrypts the shortlist (best first) through `fetch` and `vault`,
    /// merges adjacent chunks, applies the budget and attaches citations.
    pub fn assemble<F, K>(
        &self,
        shortlist: Vec<RankedChunk>,
        fetch: F,
        vault: &CryptoVault<K>,
        cancel: &CancelToken,
    ) -> Result<Retrieval>
    where
        F: Fn(ChunkId) -> Result<StoredText> + Sync,
        K: KeyStore,
    {
        if shortlist.is_empty() {
            return Ok(Retrieval::default());
        }
        let outcomes = shortlist
            .into_par_iter()
            .enumerate()
            .map(|(rank, chunk)| {
                cancel.check()?;
                let outcome = open_chunk(&chunk, &fetch, vault);
                Ok((rank, chunk, outcome))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut opened = Vec::with_capacity(outcomes.len());
        let mut skipped = Vec::new();
        for (rank, chunk, outcome) in outcomes {
            match outcome {
                Ok(text) => opened.push(Opened { rank, chunk, text }),
                Err(err) => {
                    let reason = skip_reason(&err).ok_or(err)?;
                    skipped.push(SkippedChunk {
                        chunk_id: chunk.meta.chunk_id,
                        file_id: chunk.meta.file_id.clone(),
                        reason,
                    });
                }
            }
        }

        let merged = if self.config.merge_adjacent {
            merge_adjacent(opened)
        } else {
            opened.into_iter().map(single_entry).collect()
        };

        let mut entries = Vec::with_capacity(merged.len());
        let mut used = 0usize;
        let mut dropped_by_budget = 0usize;
        for entry in merged {
            if dropped_by_budget > 0 {
                dropped_by_budget += 1;
                continue;
            }
            if let Some(limit) = self.config.max_context {
                let cost = self.config.budget_unit.measure(&entry.text)?;
                if used + cost > limit {
                    dropped_by_budget += 1;
                    continue;
                }
                used += cost;
            }
            entries.push(entry);
        }
        debug!(
            entries = entries.len(),
            skipped = skipped.len(),
            dropped_by_budget,
            "assembled context"
        );
        Ok(Retrieval {
            entries,
            skipped,
            dropped_by_budget,
        })
    }
}

fn open_chunk<F, K>(chunk: &RankedChunk, fetch: &F, vault: &CryptoVault<K>) -> Result<String>
where
    F: Fn(ChunkId) -> Result<StoredText> + Sync,
    K: KeyStore,
{
    let stored = fetch(chunk.meta.chunk_id)?;
    if stored.file_id != chunk.meta.file_id {
        return Err(DoclinkError::malformed(format!(
            "chunk {} is stored under file {}, ranked under {}",
            chunk.meta.chunk_id, stored.file_id, chunk.meta.file_id
        )));
    }
    vault.decrypt(&stored.file_id, &stored.sealed)
}

fn skip_reason(err: &DoclinkError) -> Option<SkipReason> {
    match err {
        DoclinkError::AuthenticationFailure { file_id } => {
            warn!(
                target: "doclink::integrity",
                file_id = %file_id,
                "chunk text failed authentication; excluded from context"
            );
            Some(SkipReason::AuthenticationFailure)
        }
        DoclinkError::MalformedRecord(detail) => {
            warn!(
                target: "doclink::integrity",
                detail = %detail,
                "malformed chunk record excluded"
            );
            Some(SkipReason::MalformedRecord)
        }
        DoclinkError::NotFound(what) => {
            debug!(what = %what, "shortlisted chunk disappeared before decryption");
            Some(SkipReason::Missing)
        }
        _ => None,
    }
}

fn single_entry(opened: Opened) -> ContextEntry {
    ContextEntry {
        text: opened.text,
        file_name: opened.chunk.meta.file_name,
        page_number: opened.chunk.meta.page_number,
        file_id: opened.chunk.meta.file_id,
        chunk_ids: vec![opened.chunk.meta.chunk_id],
        score: opened.chunk.score,
        is_header: opened.chunk.meta.is_header,
        is_table: opened.chunk.meta.is_table,
    }
}

/// Joins chunks of the same file and page with consecutive ordinals. Each
/// run takes the rank and score of its best member.
fn merge_adjacent(opened: Vec<Opened>) -> Vec<ContextEntry> {
    let mut by_position: BTreeMap<(FileId, u32), Opened> = BTreeMap::new();
    for item in opened {
        by_position.insert(
            (item.chunk.meta.file_id.clone(), item.chunk.meta.ordinal),
            item,
        );
    }

    let mut runs: Vec<(usize, ContextEntry)> = Vec::new();
    let mut last: Option<(FileId, u32, u32)> = None;
    for ((file_id, ordinal), item) in by_position {
        let page = item.chunk.meta.page_number;
        let continues = matches!(
            &last,
            Some((prev_file, prev_ordinal, prev_page))
                if *prev_file == file_id && prev_ordinal + 1 == ordinal && *prev_page == page
        );
        last = Some((file_id, ordinal, page));
        match runs.last_mut() {
            Some((best_rank, entry)) if continues => {
                entry.text.push(' ');
                entry.text.push_str(&item.text);
                entry.chunk_ids.push(item.chunk.meta.chunk_id);
                entry.is_header |= item.chunk.meta.is_header;
                entry.is_table |= item.chunk.meta.is_table;
                if item.rank < *best_rank {
                    *best_rank = item.rank;
                    entry.score = item.chunk.score;
                }
            }
            _ => {
                let rank = item.rank;
                runs.push((rank, single_entry(item)));
            }
        }
    }
    runs.sort_by_key(|(rank, _)| *rank);
    runs.into_iter().map(|(_, entry)| entry).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::crypto::DeterministicKeyStore;
    use crate::model::ChunkMeta;

    struct Fixture {
        vault: CryptoVault<DeterministicKeyStore>,
        texts: HashMap<ChunkId, StoredText>,
        shortlist: Vec<RankedChunk>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                vault: CryptoVault::new(DeterministicKeyStore::new(b"assembler".to_vec())),
                texts: HashMap::new(),
                shortlist: Vec::new(),
            }
        }

        fn add(
            &mut self,
            chunk_id: ChunkId,
            file: &str,
            ordinal: u32,
            page: u32,
            score: f32,
            text: &str,
        ) {
            let file_id = FileId::new(file);
            let sealed = self.vault.encrypt(&file_id, text).unwrap();
            self.texts.insert(
                chunk_id,
                StoredText {
                    chunk_id,
                    file_id: file_id.clone(),
                    sealed,
                },
            );
            self.shortlist.push(RankedChunk {
                meta: ChunkMeta {
                    chunk_id,
                    file_id,
                    file_name: format!("{file}.pdf"),
                    ordinal,
                    page_number: page,
                    is_header: false,
                    is_table: false,
                },
                score,
            });
        }

        fn run(&self, config: AssemblyConfig) -> Retrieval {
            let texts = &self.texts;
            ContextAssembler::new(config)
                .assemble(
                    self.shortlist.clone(),
                    |id| {
                        texts
                            .get(&id)
                            .cloned()
                            .ok_or_else(|| DoclinkError::chunk_not_found(id))
                    },
                    &self.vault,
                    &CancelToken::new(),
                )
                .unwrap()
        }
    }

    #[test]
    fn empty_shortlist_is_empty_context() {
        let retrieval = Fixture::new().run(AssemblyConfig::default());
        assert!(retrieval.is_empty());
        assert!(retrieval.skipped.is_empty());
        assert_eq!(retrieval.render(), "");
    }

    #[test]
    fn keeps_rank_order_with_citations() {
        let mut fx = Fixture::new();
        fx.add(10, "a", 0, 4, 0.9, "first");
        fx.add(20, "b", 0, 1, 0.8, "second");
        let retrieval = fx.run(AssemblyConfig::default());
        let cites: Vec<_> = retrieval
            .entries
            .iter()
            .map(|e| (e.text.as_str(), e.file_name.as_str(), e.page_number))
            .collect();
        assert_eq!(cites, vec![("first", "a.pdf", 4), ("second", "b.pdf", 1)]);
        assert_eq!(
            retrieval.render(),
            "[DOC: a.pdf, page 4]\nfirst\n\n[DOC: b.pdf, page 1]\nsecond\n\n"
        );
    }

    #[test]
    fn tampered_chunk_is_skipped_not_fatal() {
        let mut fx = Fixture::new();
        fx.add(1, "a", 0, 1, 0.9, "intact one");
        fx.add(2, "a", 5, 2, 0.8, "tampered");
        fx.add(3, "a", 9, 3, 0.7, "intact two");
        fx.texts.get_mut(&2).unwrap().sealed.ciphertext[0] ^= 0x01;
        let retrieval = fx.run(AssemblyConfig::default());
        let texts: Vec<_> = retrieval.entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["intact one", "intact two"]);
        assert_eq!(
            retrieval.skipped,
            vec![SkippedChunk {
                chunk_id: 2,
                file_id: FileId::new("a"),
                reason: SkipReason::AuthenticationFailure,
            }]
        );
    }

    #[test]
    fn missing_text_is_skipped() {
        let mut fx = Fixture::new();
        fx.add(1, "a", 0, 1, 0.9, "kept");
        fx.add(2, "a", 4, 1, 0.8, "gone");
        fx.texts.remove(&2);
        let retrieval = fx.run(AssemblyConfig::default());
        assert_eq!(retrieval.entries.len(), 1);
        assert_eq!(retrieval.skipped[0].reason, SkipReason::Missing);
    }

    #[test]
    fn adjacent_chunks_on_one_page_merge_in_reading_order() {
        let mut fx = Fixture::new();
        fx.add(12, "a", 2, 1, 0.95, "continues here.");
        fx.add(11, "a", 1, 1, 0.60, "A sentence that");
        fx.add(30, "b", 0, 1, 0.70, "elsewhere");
        // Same file, consecutive ordinal, but the next page: not merged.
        fx.add(13, "a", 3, 2, 0.50, "next page");
        let retrieval = fx.run(AssemblyConfig::default());
        let texts: Vec<_> = retrieval.entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["A sentence that continues here.", "elsewhere", "next page"]
        );
        assert_eq!(retrieval.entries[0].chunk_ids, vec![11, 12]);
        assert!((retrieval.entries[0].score - 0.95).abs() < 1e-6);
    }

    #[test]
    fn merging_can_be_disabled() {
        let mut fx = Fixture::new();
        fx.add(1, "a", 0, 1, 0.9, "one");
        fx.add(2, "a", 1, 1, 0.8, "two");
        let retrieval = fx.run(AssemblyConfig {
            merge_adjacent: false,
            ..Default::default()
        });
        assert_eq!(retrieval.entries.len(), 2);
    }

    #[test]
    fn budget_stops_at_first_overflow() {
        let mut fx = Fixture::new();
        fx.add(1, "a", 0, 1, 0.9, "12345");
        fx.add(2, "a", 10, 2, 0.8, "1234567890");
        fx.add(3, "a", 20, 3, 0.7, "1");
        let retrieval = fx.run(AssemblyConfig {
            max_context: Some(12),
            ..Default::default()
        });
        let texts: Vec<_> = retrieval.entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["12345"]);
        assert_eq!(retrieval.dropped_by_budget, 2);
    }

    #[test]
    fn char_budget_counts_characters_not_bytes() {
        assert_eq!(BudgetUnit::Chars.measure("çağ").unwrap(), 3);
    }

    #[test]
    fn cancelled_assembly_aborts() {
        let mut fx = Fixture::new();
        fx.add(1, "a", 0, 1, 0.9, "text");
        let token = CancelToken::new();
        token.cancel();
        let texts = &fx.texts;
        let result = ContextAssembler::default().assemble(
            fx.shortlist.clone(),
            |id| texts.get(&id).cloned().ok_or_else(|| DoclinkError::chunk_not_found(id)),
            &fx.vault,
            &token,
        );
        assert!(matches!(result, Err(DoclinkError::Cancelled)));
    }
}
