//! Port label interning.
//!
//! Maps opaque label identities to small ids so wait and turnstile records
//! can reference a label without repeating it. The table is insert-only for
//! the life of a capture. A generation byte per slot records which ids were
//! touched since the last [`PortLabelTable::advance_generation`], so labels
//! can be flushed per task without rescanning the whole table.

use crate::config::PORT_LABEL_TABLE_MAX;
use crate::records::{InternStats, PORTLABEL_ID_MISSING, PORTLABEL_ID_NONE};

const HASH_SHIFT: u32 = 7;
const HASH_BUCKETS: usize = 1 << HASH_SHIFT;
const CHAIN_END: i16 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    lookups: u32,
    found: u32,
    found_depth: u32,
    insert: u32,
    insert_depth: u32,
    bad: u32,
    bad_depth: u32,
    lookup_send: u32,
    lookup_receive: u32,
}

pub struct PortLabelTable {
    size: usize,
    count: usize,
    idents: Vec<u64>,
    chains: Vec<i16>,
    gens: Vec<u8>,
    buckets: Vec<i16>,
    curgen: u8,
    curgen_min: usize,
    curgen_max: usize,
    counters: Counters,
}

/// Fold every bit of the identity into the bucket index.
fn hash(ident: u64) -> usize {
    let mut h = ident;
    for step in [16u32, 8, 4, 2, 1] {
        let shift = step * HASH_SHIFT;
        if shift < u64::BITS {
            h ^= h >> shift;
        }
    }
    (h as usize) & (HASH_BUCKETS - 1)
}

impl PortLabelTable {
    pub fn new(capacity: usize) -> Self {
        let size = capacity.min(PORT_LABEL_TABLE_MAX);
        let buckets = if size > 0 { HASH_BUCKETS } else { 0 };
        Self {
            size,
            count: 0,
            idents: vec![0; size],
            chains: vec![CHAIN_END; size],
            gens: vec![0; size],
            buckets: vec![CHAIN_END; buckets],
            curgen: 1,
            curgen_min: PORT_LABEL_TABLE_MAX,
            curgen_max: 0,
            counters: Counters::default(),
        }
    }

    /// A table that reports every identity as missing.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Bytes a table of `capacity` entries would occupy.
    pub fn footprint(capacity: usize) -> usize {
        let size = capacity.min(PORT_LABEL_TABLE_MAX);
        if size == 0 {
            return 0;
        }
        size * (8 + 2 + 1) + HASH_BUCKETS * 2
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Id for `ident`, inserting it on first sight. Returns
    /// [`PORTLABEL_ID_NONE`] for a null identity and
    /// [`PORTLABEL_ID_MISSING`] when the table is disabled, full or corrupt.
    pub fn lookup(&mut self, ident: u64, kind: LookupKind) -> i16 {
        if ident == 0 {
            return PORTLABEL_ID_NONE;
        }
        if self.size == 0 {
            return PORTLABEL_ID_MISSING;
        }
        self.counters.lookups += 1;
        match kind {
            LookupKind::Send => self.counters.lookup_send += 1,
            LookupKind::Receive => self.counters.lookup_receive += 1,
        }

        let bucket = hash(ident);
        let mut depth = 0usize;
        let mut cur = self.buckets[bucket];
        while cur != CHAIN_END {
            let idx = cur as usize;
            if cur < 0 || idx >= self.count || depth > self.count || depth > self.size {
                self.counters.bad += 1;
                self.counters.bad_depth += depth as u32;
                return PORTLABEL_ID_MISSING;
            }
            if self.idents[idx] == ident {
                self.counters.found += 1;
                self.counters.found_depth += depth as u32;
                return self.touch(idx);
            }
            depth += 1;
            cur = self.chains[idx];
        }

        if self.count >= self.size {
            return PORTLABEL_ID_MISSING;
        }
        self.counters.insert += 1;
        self.counters.insert_depth += depth as u32;
        let idx = self.count;
        self.count += 1;
        self.idents[idx] = ident;
        self.chains[idx] = self.buckets[bucket];
        self.buckets[bucket] = idx as i16;
        self.touch(idx)
    }

    fn touch(&mut self, idx: usize) -> i16 {
        self.gens[idx] = self.curgen;
        self.curgen_min = self.curgen_min.min(idx);
        self.curgen_max = self.curgen_max.max(idx);
        (idx + 1) as i16
    }

    /// Start a new generation. A no-op if nothing was touched in this one.
    pub fn advance_generation(&mut self) {
        if self.curgen_min == PORT_LABEL_TABLE_MAX && self.curgen_max == 0 {
            return;
        }
        self.curgen = self.curgen.wrapping_add(1);
        if self.curgen == 0 {
            self.gens.iter_mut().for_each(|g| *g = 0);
            self.curgen = 1;
        }
        self.curgen_min = PORT_LABEL_TABLE_MAX;
        self.curgen_max = 0;
    }

    /// Ids and identities touched in the current generation, in id order.
    pub fn touched(&self) -> Vec<(i16, u64)> {
        let (min, max) = (self.curgen_min, self.curgen_max);
        if min > max || max >= self.count || self.count > self.size {
            return Vec::new();
        }
        (min..=max)
            .filter(|&idx| self.gens[idx] == self.curgen)
            .map(|idx| ((idx + 1) as i16, self.idents[idx]))
            .collect()
    }

    pub fn stats(&self) -> InternStats {
        let c = &self.counters;
        InternStats {
            size: self.size as u32,
            count: self.count as u32,
            lookups: c.lookups,
            found: c.found,
            found_depth: c.found_depth,
            insert: c.insert,
            insert_depth: c.insert_depth,
            bad: c.bad,
            bad_depth: c.bad_depth,
            lookup_send: c.lookup_send,
            lookup_receive: c.lookup_receive,
        }
    }
}
