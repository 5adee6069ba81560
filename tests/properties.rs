//! Property-based tests for the universal properties SPEC_FULL.md §8
//! calls out (round-trip, range extraction, list monotonicity), as
//! opposed to `tests/scenarios.rs`'s literal fixed-input scenarios.

use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;
use tokio_stream::StreamExt;

use obe::blob::memory::MemoryBlobStore;
use obe::blob::ByteStream;
use obe::config::EngineConfig;
use obe::coordinator::{BucketCoordinator, GetOptions, ListRequest, PutOptions};
use obe::metadata::SqliteMetadataStore;
use obe::timers::system_timers;
use obe::validator::RangeInput;

fn stream_of(bytes: Vec<u8>) -> ByteStream {
    Box::pin(tokio_stream::once(Ok(Bytes::from(bytes))))
}

fn coordinator() -> BucketCoordinator {
    BucketCoordinator::new(
        EngineConfig::test_mode(5 * 1024 * 1024),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(SqliteMetadataStore::in_memory().unwrap()),
        system_timers(),
    )
}

async fn drain(mut stream: ByteStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

proptest! {
    /// For all (key, bytes): after put(key, bytes), get(key).body == bytes
    /// and get(key).size == len(bytes).
    #[test]
    fn round_trip_put_get(
        key in "[a-zA-Z0-9/_.-]{1,64}",
        body in prop::collection::vec(any::<u8>(), 0..4096),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let coord = coordinator();
            let len = body.len() as u64;
            let meta = coord
                .put(key.clone(), stream_of(body.clone()), len, PutOptions::default())
                .await
                .unwrap();
            prop_assert_eq!(meta.size, len);

            let got = coord.get(&key, GetOptions::default()).await.unwrap();
            prop_assert_eq!(got.range.length, len);
            prop_assert_eq!(drain(got.body).await, body);
            Ok(())
        })?;
    }

    /// For all [s,e] within [0, size-1]: get(key, range=[s,e]).body ==
    /// bytes[s..=e], regardless of part count.
    #[test]
    fn range_extraction_matches_slice(
        body in prop::collection::vec(any::<u8>(), 1..2048),
        a in any::<usize>(),
        b in any::<usize>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let size = body.len();
            let a = a % size;
            let b = b % size;
            let (start, end) = if a <= b { (a, b) } else { (b, a) };

            let coord = coordinator();
            coord
                .put("k".to_string(), stream_of(body.clone()), size as u64, PutOptions::default())
                .await
                .unwrap();

            let got = coord
                .get(
                    "k",
                    GetOptions {
                        range: Some(RangeInput::Structured {
                            offset: Some(start as u64),
                            length: Some((end - start + 1) as u64),
                            suffix: None,
                        }),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            prop_assert_eq!(drain(got.body).await, body[start..=end].to_vec());
            Ok(())
        })?;
    }

    /// Paginating list({prefix: ""}) across all pages yields keys in
    /// strict ascending order with no duplicates, covering exactly the
    /// set of keys put.
    #[test]
    fn list_is_monotone_and_duplicate_free(
        keys in prop::collection::hash_set("[a-z]{1,4}(/[a-z]{1,4}){0,2}", 1..20),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut keys = keys;
            let coord = coordinator();
            for key in &keys {
                coord
                    .put(key.clone(), stream_of(b"v".to_vec()), 1, PutOptions::default())
                    .await
                    .unwrap();
            }

            let mut seen = Vec::new();
            let mut cursor = None;
            loop {
                let page = coord
                    .list(ListRequest {
                        limit: Some(2),
                        cursor: cursor.clone(),
                        ..Default::default()
                    })
                    .await
                    .unwrap();
                seen.extend(page.objects.iter().map(|o| o.meta.key.clone()));
                if !page.truncated {
                    break;
                }
                cursor = page.cursor;
                prop_assert!(cursor.is_some());
            }

            prop_assert_eq!(seen.len(), keys.len());
            for pair in seen.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
            let mut expected: Vec<String> = keys.drain().collect();
            expected.sort();
            prop_assert_eq!(seen, expected);
            Ok(())
        })?;
    }
}
