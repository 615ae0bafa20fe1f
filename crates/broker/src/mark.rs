//! Encoding of consumer-group marks as messages on the internal compacted
//! topic. One record per (topic, partition, channel, group, offset); the
//! storage merge operator keeps the most settled state for each record.

use crate::message::{MarkKind, MarkState, Message};
use crate::offset::{OFFSET_LEN, Offset};

pub(crate) const CLUSTER_KEY_LEN: usize = OFFSET_LEN + 1;

/// Key shared by every mark of one (topic, partition, channel, group).
/// Partition selection for the internal topic hashes this, so a group's
/// marks colocate and range scans stay on one partition.
pub(crate) fn mark_key(topic: &str, partition: u32, channel: &str, group: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(topic.len() + channel.len() + group.len() + 8);
    key.extend_from_slice(topic.as_bytes());
    key.push(0);
    key.extend_from_slice(&partition.to_be_bytes());
    key.push(0);
    key.extend_from_slice(channel.as_bytes());
    key.push(0);
    key.extend_from_slice(group.as_bytes());
    key.push(0);
    key
}

pub(crate) fn cluster_key(offset: Offset, kind: MarkKind) -> Vec<u8> {
    let mut key = Vec::with_capacity(CLUSTER_KEY_LEN);
    key.extend_from_slice(offset.as_bytes());
    key.push(kind.as_byte());
    key
}

pub(crate) fn mark_message(
    topic: &str,
    partition: u32,
    channel: &str,
    group: &str,
    offset: Offset,
    state: MarkState,
) -> Result<Message, bincode::Error> {
    let mut msg = Message::new(mark_key(topic, partition, channel, group), state.encode()?);
    msg.clustering_key = cluster_key(offset, state.kind);
    Ok(msg)
}

/// Merge function registered with the store: keep the record whose clustering
/// key (offset, then kind byte) is greatest; ties go to the new operand so a
/// growing delivery count lands.
pub fn max_kind_merge(existing: Option<&[u8]>, operand: &[u8]) -> Option<Vec<u8>> {
    if operand.len() < CLUSTER_KEY_LEN {
        return None;
    }
    match existing {
        Some(cur)
            if cur.len() >= CLUSTER_KEY_LEN
                && operand[..CLUSTER_KEY_LEN] < cur[..CLUSTER_KEY_LEN] =>
        {
            Some(cur.to_vec())
        }
        _ => Some(operand.to_vec()),
    }
}

/// Kind byte of a stored mark record, read without decoding the value.
pub(crate) fn record_kind(record: &[u8]) -> Option<MarkKind> {
    if record.len() < CLUSTER_KEY_LEN {
        return None;
    }
    MarkKind::from_byte(record[OFFSET_LEN])
}

/// Decode the state carried by a stored mark record. A record we cannot
/// decode is treated as settled: redelivering it could loop forever, skipping
/// it cannot.
pub(crate) fn decode_record(record: &[u8]) -> MarkState {
    if record.len() >= CLUSTER_KEY_LEN {
        match MarkState::decode(&record[CLUSTER_KEY_LEN..]) {
            Ok(state) => return state,
            Err(err) => {
                tracing::warn!("undecodable mark state, treating as acknowledged: {err}");
            }
        }
    } else {
        tracing::warn!(len = record.len(), "truncated mark record, treating as acknowledged");
    }
    MarkState::new(MarkKind::Acknowledged, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: Offset, state: MarkState) -> Vec<u8> {
        let mut rec = cluster_key(offset, state.kind);
        rec.extend_from_slice(&state.encode().unwrap());
        rec
    }

    #[test]
    fn merge_keeps_most_settled_kind() {
        let off = Offset::new(1, 100);
        let consumed = record(off, MarkState::new(MarkKind::Consumed, 1));
        let acked = record(off, MarkState::new(MarkKind::Acknowledged, 1));

        let merged = max_kind_merge(Some(consumed.as_slice()), &acked).unwrap();
        assert_eq!(decode_record(&merged).kind, MarkKind::Acknowledged);

        // a late Consumed retry cannot demote the acknowledged record
        let merged = max_kind_merge(Some(merged.as_slice()), &consumed).unwrap();
        assert_eq!(decode_record(&merged).kind, MarkKind::Acknowledged);
    }

    #[test]
    fn merge_ties_take_the_new_operand() {
        let off = Offset::new(1, 100);
        let first = record(off, MarkState::new(MarkKind::Consumed, 1));
        let second = record(off, MarkState::new(MarkKind::Consumed, 2));

        let merged = max_kind_merge(Some(first.as_slice()), &second).unwrap();
        assert_eq!(decode_record(&merged).delivery_count, 2);
    }

    #[test]
    fn malformed_operand_is_rejected() {
        let off = Offset::new(1, 100);
        let good = record(off, MarkState::new(MarkKind::Consumed, 1));
        assert!(max_kind_merge(Some(good.as_slice()), b"junk").is_none());
    }

    #[test]
    fn undecodable_record_reads_as_acknowledged() {
        assert_eq!(decode_record(b"junk").kind, MarkKind::Acknowledged);
    }

    #[test]
    fn mark_keys_do_not_cross_groups() {
        let a = mark_key("t", 0, "ch", "g");
        let b = mark_key("t", 0, "ch", "g2");
        assert!(!b.starts_with(&a));
    }
}
