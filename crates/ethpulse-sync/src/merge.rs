//! First-claim-wins merging of tier outputs keyed by (date, dimension).

use std::collections::BTreeMap;

use ethpulse_core::{Record, RecordKey};

/// Accumulates tier outputs in priority order. A key, once claimed, is never
/// overwritten by a later (lower-priority) tier.
#[derive(Debug, Default, Clone)]
pub struct SeriesMerger {
    rows: BTreeMap<RecordKey, Record>,
}

impl SeriesMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one tier's rows; returns how many keys were newly claimed.
    pub fn absorb(&mut self, records: impl IntoIterator<Item = Record>) -> usize {
        let mut added = 0;
        for record in records {
            if let std::collections::btree_map::Entry::Vacant(slot) = self.rows.entry(record.key())
            {
                slot.insert(record);
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Records ascending by date, then dimension.
    pub fn into_records(self) -> Vec<Record> {
        self.rows.into_values().collect()
    }
}

/// Merge tier results given in priority order.
pub fn merge<I, T>(tiers: I) -> Vec<Record>
where
    I: IntoIterator<Item = T>,
    T: IntoIterator<Item = Record>,
{
    let mut merger = SeriesMerger::new();
    for tier in tiers {
        merger.absorb(tier);
    }
    merger.into_records()
}

/// Replace same-key records with `replacement`, keeping everything else.
pub fn overlay(records: Vec<Record>, replacement: Vec<Record>) -> Vec<Record> {
    let mut rows: BTreeMap<RecordKey, Record> =
        records.into_iter().map(|r| (r.key(), r)).collect();
    for record in replacement {
        rows.insert(record.key(), record);
    }
    rows.into_values().collect()
}
