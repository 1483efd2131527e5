use std::collections::{BTreeMap, BTreeSet};

use crate::models::{BlockAssignment, PluralBlock};

/// Groups raw assignments by block key, drops keys with fewer than two
/// distinct records and numbers the survivors from 1 in block-key order.
///
/// A record listed twice under the same key counts once, so every
/// `(block_id, record_key)` pair in the output is unique.
pub fn materialize<I>(assignments: I) -> Vec<PluralBlock>
where
    I: IntoIterator<Item = BlockAssignment>,
{
    let mut by_key: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for a in assignments {
        by_key.entry(a.block_key).or_default().insert(a.record_key);
    }
    by_key
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .enumerate()
        .map(|(i, (block_key, members))| PluralBlock {
            block_id: i as i64 + 1,
            block_key,
            members: members.into_iter().collect(),
        })
        .collect()
}

/// `(record_key, block_id)` pairs ordered by record then block, the shape the
/// coverage calculator consumes.
pub fn memberships_by_record(blocks: &[PluralBlock]) -> Vec<(String, i64)> {
    let mut out: Vec<(String, i64)> = blocks
        .iter()
        .flat_map(|b| b.members.iter().map(move |m| (m.clone(), b.block_id)))
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(k: &str, r: &str) -> BlockAssignment {
        BlockAssignment {
            block_key: k.into(),
            record_key: r.into(),
        }
    }

    #[test]
    fn singleton_blocks_are_dropped() {
        let blocks = materialize(vec![a("A", "r1"), a("A", "r2"), a("B", "r3")]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_key, "A");
        assert_eq!(blocks[0].block_id, 1);
        assert_eq!(blocks[0].members, vec!["r1", "r2"]);
    }

    #[test]
    fn repeated_assignment_counts_once() {
        let blocks = materialize(vec![a("A", "r1"), a("A", "r1"), a("B", "r1"), a("B", "r2")]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_key, "B");
    }

    #[test]
    fn ids_are_stable_across_input_order() {
        let x = materialize(vec![a("B", "1"), a("A", "1"), a("B", "2"), a("A", "2")]);
        let y = materialize(vec![a("A", "2"), a("A", "1"), a("B", "2"), a("B", "1")]);
        assert_eq!(x, y);
        assert_eq!(x[0].block_key, "A");
        assert_eq!(x[1].block_id, 2);
    }

    #[test]
    fn memberships_sorted_by_record() {
        let blocks = materialize(vec![
            a("A", "r1"),
            a("A", "r2"),
            a("B", "r2"),
            a("B", "r3"),
        ]);
        let m = memberships_by_record(&blocks);
        assert_eq!(
            m,
            vec![
                ("r1".to_string(), 1),
                ("r2".to_string(), 1),
                ("r2".to_string(), 2),
                ("r3".to_string(), 2)
            ]
        );
    }
}
