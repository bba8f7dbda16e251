//! Property-based test generators using proptest.
//!
//! Provides strategies for generating records that satisfy the journal's
//! alignment rules.

use crate::fixtures::TEST_BLOCK_SIZE;
use bytes::Bytes;
use proptest::prelude::*;
use seglog_core::Record;

/// Strategy for generating a delta payload.
pub fn delta_strategy() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..512).prop_map(Bytes::from)
}

/// Strategy for generating a block-aligned extent of 1 to `max_blocks`
/// blocks filled with one byte.
pub fn extent_strategy(max_blocks: usize) -> impl Strategy<Value = Bytes> {
    (1..=max_blocks, any::<u8>())
        .prop_map(|(blocks, fill)| Bytes::from(vec![fill; blocks * TEST_BLOCK_SIZE as usize]))
}

/// Strategy for generating a record with up to two extents and four deltas.
pub fn record_strategy() -> impl Strategy<Value = Record> {
    (
        prop::collection::vec(extent_strategy(2), 0..=2),
        prop::collection::vec(delta_strategy(), 0..=4),
        any::<u64>(),
    )
        .prop_map(|(extents, deltas, modify_time)| Record::new(extents, deltas, modify_time))
}

/// Strategy for generating a record with deltas only.
pub fn delta_record_strategy() -> impl Strategy<Value = Record> {
    prop::collection::vec(delta_strategy(), 1..=4).prop_map(Record::from_deltas)
}

/// Strategy for generating a sequence of delta-only records.
pub fn delta_records_strategy(max_len: usize) -> impl Strategy<Value = Vec<Record>> {
    prop::collection::vec(delta_record_strategy(), 1..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ReplayLog, SegmentedFixture};
    use seglog_core::{
        encode_records, try_decode_records, try_decode_records_header, Journal, RecordGroup,
        SubmitterConfig, JOURNAL_SEQ_NULL,
    };

    proptest! {
        #[test]
        fn generated_records_are_aligned(record in record_strategy()) {
            prop_assert!(record.check_alignment(TEST_BLOCK_SIZE).is_ok());
        }

        #[test]
        fn generated_groups_decode(records in prop::collection::vec(record_strategy(), 1..4)) {
            let mut group = RecordGroup::new(TEST_BLOCK_SIZE);
            for record in &records {
                group.push(record.clone());
            }
            let encoded = encode_records(&group, JOURNAL_SEQ_NULL, 7).unwrap();
            let header = try_decode_records_header(&encoded, 7).unwrap();
            let md = encoded.slice(..header.mdlength as usize);
            let data = encoded.slice(header.mdlength as usize..);
            let decoded = try_decode_records(&header, &md, &data).unwrap();
            prop_assert_eq!(decoded.len(), records.len());
            for (decoded, record) in decoded.iter().zip(&records) {
                prop_assert_eq!(&decoded.deltas[..], record.deltas());
                prop_assert_eq!(&decoded.extents[..], record.extents());
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn replay_delivers_every_submitted_delta(records in delta_records_strategy(24)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let fixture = SegmentedFixture::mkfs(SubmitterConfig::default(), 16).await;
                let mut expected = Vec::new();
                let mut last = JOURNAL_SEQ_NULL;
                for record in records {
                    expected.extend(record.deltas().iter().cloned());
                    let locator = fixture.journal.submit_record(record).await.unwrap();
                    assert!(last.is_null() || locator.write_result.start_seq > last);
                    last = locator.write_result.start_seq;
                }
                fixture.journal.close().await.unwrap();

                let log = ReplayLog::collect(&fixture.restart().journal).await.unwrap();
                assert_eq!(log.deltas(), expected);
            });
        }
    }
}
