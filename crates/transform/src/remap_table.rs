//! `CompactRemapTable`: a dense source-id -> target-id mapping stored as
//! sorted, non-overlapping runs (spec §4.2).
//!
//! Most engineering-model transforms assign target ids in the same order
//! source ids are read, so consecutive source ids usually map to consecutive
//! target ids. Storing runs instead of a per-id hash map keeps millions of
//! remapped rows in a handful of kilobytes, mirroring the host's
//! `MemoryIdTracker` / `StaticIdTracker` split (`id_tracker.rs`): one
//! structure that's cheap to append to during a pass, and cheap to binary
//! search during the next one.

use crate::ids::Id;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Run {
    pub from: u64,
    pub to: u64,
    pub length: u64,
}

impl Run {
    fn contains(&self, src: u64) -> bool {
        src >= self.from && src < self.from + self.length
    }

    fn extends_with(&self, src: u64, tgt: u64) -> bool {
        src == self.from + self.length && tgt == self.to + self.length
    }
}

#[derive(Clone, Debug, Default)]
pub struct CompactRemapTable {
    /// Sorted by `from`, non-overlapping.
    runs: Vec<Run>,
}

impl CompactRemapTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a single mapping. Extends the last run if contiguous,
    /// otherwise starts a new one. Overlapping inserts (a `src` that falls
    /// inside an existing run, with a different `from`) are a fatal
    /// programming error per spec §4.2.
    pub fn remap(&mut self, src: Id, tgt: Id) {
        let (src, tgt) = (src.0, tgt.0);
        if let Some(last) = self.runs.last_mut() {
            if last.extends_with(src, tgt) {
                last.length += 1;
                return;
            }
            assert!(
                !last.contains(src),
                "CompactRemapTable::remap: overlapping insert of source id {src} into run {last:?}"
            );
        }
        self.runs.push(Run {
            from: src,
            to: tgt,
            length: 1,
        });
    }

    /// Insert a mapping identity-to-identity without extending or requiring
    /// contiguity checks against the *previous* run — used to seed the
    /// table with the handful of reserved ids (spec §3 invariants) before
    /// any pass begins.
    pub fn seed_identity(&mut self, id: Id) {
        self.remap(id, id);
    }

    pub fn get(&self, src: Id) -> Option<Id> {
        let src = src.0;
        let idx = match self.runs.binary_search_by(|run| run.from.cmp(&src)) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let run = &self.runs[idx];
        if run.contains(src) {
            Some(Id(run.to + (src - run.from)))
        } else {
            None
        }
    }

    pub fn runs(&self) -> impl Iterator<Item = &Run> {
        self.runs.iter()
    }

    pub fn len(&self) -> u64 {
        self.runs.iter().map(|r| r.length).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
