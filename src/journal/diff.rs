//! Journal comparison.

use std::collections::BTreeMap;

use crate::error::Result;

use super::{HashRecord, Journal};

/// One disagreeing block range between two journals. A side that never saw
/// the block reports hash 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Difference {
    pub offset: u64,
    pub size: u64,
    pub hash_a: u64,
    pub hash_b: u64,
    pub file_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Which {
    A,
    B,
}

struct Pending {
    size: u64,
    hash: u64,
    which: Which,
}

fn merge(
    map: &mut BTreeMap<(u16, u64), Pending>,
    diffs: &mut Vec<Difference>,
    record: HashRecord,
    which: Which,
) {
    let key = (record.file_id, record.offset);

    if let Some(other) = map.remove(&key) {
        if record.hash != other.hash {
            diffs.push(Difference {
                offset: record.offset,
                size: record.size,
                hash_a: if which == Which::A { record.hash } else { other.hash },
                hash_b: if which == Which::B { record.hash } else { other.hash },
                file_id: record.file_id,
            });
        }

        return;
    }

    map.insert(
        key,
        Pending {
            size: record.size,
            hash: record.hash,
            which,
        },
    );
}

/// Streaming join of two journals keyed by `(file_id, offset)`.
///
/// Both record sequences are walked in lockstep with alternating
/// advancement; a side map holds blocks whose partner has not appeared yet,
/// so the result is independent of record order on either side. Whatever
/// remains in the map afterwards is a one-sided difference.
pub fn diff_journals(journal_a: &Journal, journal_b: &Journal) -> Result<Vec<Difference>> {
    let mut map = BTreeMap::new();
    let mut diffs = Vec::new();

    let mut iter_a = journal_a.begin()?;
    let mut iter_b = journal_b.begin()?;

    loop {
        let next_a = iter_a.next();
        let next_b = iter_b.next();

        if next_a.is_none() && next_b.is_none() {
            break;
        }

        if let Some(record) = next_a {
            merge(&mut map, &mut diffs, record?, Which::A);
        }

        if let Some(record) = next_b {
            merge(&mut map, &mut diffs, record?, Which::B);
        }
    }

    diffs.extend(map.into_iter().map(|((file_id, offset), pending)| {
        Difference {
            offset,
            size: pending.size,
            hash_a: if pending.which == Which::A { pending.hash } else { 0 },
            hash_b: if pending.which == Which::B { pending.hash } else { 0 },
            file_id,
        }
    }));

    Ok(diffs)
}
