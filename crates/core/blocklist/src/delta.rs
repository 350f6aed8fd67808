use std::collections::HashMap;

use backend::{BlockId, BlockMeta, CompactedBlockMeta};

/// Partition of a tenant's current listing into metas carried forward from the
/// previous cycle and ids that have to be read from the store.
///
/// Carrying known metas forward is the poller's key optimisation: a steady-state
/// cycle performs zero per-block reads.
#[derive(Debug, Default)]
pub(crate) struct TenantDelta {
    pub known: Vec<BlockMeta>,
    pub known_compacted: Vec<CompactedBlockMeta>,
    /// Current ids not present in the previous lists, mapped to whether the
    /// listing classified them as compacted.
    pub unknown: HashMap<BlockId, bool>,
}

pub(crate) fn compute(
    previous_metas: Vec<BlockMeta>,
    previous_compacted: Vec<CompactedBlockMeta>,
    live_ids: &[BlockId],
    compacted_ids: &[BlockId],
) -> TenantDelta {
    let mut known_by_id: HashMap<BlockId, BlockMeta> = previous_metas
        .into_iter()
        .map(|meta| (meta.block_id, meta))
        .collect();
    let mut known_compacted_by_id: HashMap<BlockId, CompactedBlockMeta> = previous_compacted
        .into_iter()
        .map(|meta| (meta.block.block_id, meta))
        .collect();

    let mut delta = TenantDelta {
        known: Vec::with_capacity(live_ids.len()),
        known_compacted: Vec::with_capacity(compacted_ids.len()),
        unknown: HashMap::new(),
    };

    for block_id in live_ids {
        match known_by_id.remove(block_id) {
            Some(meta) => delta.known.push(meta),
            None => {
                delta.unknown.insert(*block_id, false);
            }
        }
    }

    for block_id in compacted_ids {
        match known_compacted_by_id.remove(block_id) {
            Some(meta) => delta.known_compacted.push(meta),
            // An id listed both live and compacted resolves to compacted.
            None => {
                delta.unknown.insert(*block_id, true);
            }
        }
    }

    delta
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn meta(block_id: BlockId) -> BlockMeta {
        BlockMeta {
            block_id,
            tenant_id: "t1".to_string(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            total_objects: 0,
            size_bytes: 0,
            encoding: Default::default(),
            data_encoding: String::new(),
            bloom_shard_count: 0,
            index_page_size: 0,
            total_records: 0,
            dedicated_columns: vec![],
        }
    }

    fn compacted(block_id: BlockId) -> CompactedBlockMeta {
        CompactedBlockMeta {
            block: meta(block_id),
            compacted_at: Utc::now(),
        }
    }

    #[test]
    fn known_blocks_are_carried_forward_unread() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let previous = vec![meta(a), meta(b)];
        let expected_a = previous[0].clone();

        let delta = compute(previous, vec![], &[a, c], &[]);

        assert_eq!(delta.known, vec![expected_a]);
        assert_eq!(delta.unknown, HashMap::from([(c, false)]));
    }

    #[test]
    fn compacted_ids_are_matched_against_the_compacted_list() {
        let d = Uuid::new_v4();
        let e = Uuid::new_v4();
        let previous = vec![compacted(d)];
        let expected_d = previous[0].clone();

        let delta = compute(vec![], previous, &[], &[d, e]);

        assert_eq!(delta.known_compacted, vec![expected_d]);
        assert_eq!(delta.unknown, HashMap::from([(e, true)]));
    }

    #[test]
    fn a_block_listed_both_ways_resolves_to_compacted() {
        let a = Uuid::new_v4();
        let delta = compute(vec![], vec![], &[a], &[a]);
        assert_eq!(delta.unknown, HashMap::from([(a, true)]));
    }

    #[test]
    fn disappeared_blocks_are_dropped() {
        let a = Uuid::new_v4();
        let delta = compute(vec![meta(a)], vec![compacted(Uuid::new_v4())], &[], &[]);
        assert!(delta.known.is_empty());
        assert!(delta.known_compacted.is_empty());
        assert!(delta.unknown.is_empty());
    }

    #[test]
    fn empty_previous_marks_everything_unknown() {
        let a = Uuid::new_v4();
        let d = Uuid::new_v4();
        let delta = compute(vec![], vec![], &[a], &[d]);
        assert_eq!(delta.unknown, HashMap::from([(a, false), (d, true)]));
    }
}
