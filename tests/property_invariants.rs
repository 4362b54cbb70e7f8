//! Property-based coverage for two invariants that hold across arbitrary
//! inputs: serializer round-trips are the identity, and cache `increment`'s
//! total is independent of call interleaving. Colocated unit tests in each
//! module cover other scenarios concretely with fixed examples; these use
//! `proptest` to check across many generated inputs instead.

use std::sync::Arc;

use proptest::collection::vec;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

use foundatio_rs::cache::{Cache, InMemoryCache, InMemoryCacheConfig};
use foundatio_rs::serializer::{BincodeSerializer, JsonSerializer, Serializer};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Payload {
    id: u32,
    name: String,
    tags: Vec<i32>,
}

proptest! {
    #[test]
    fn json_serialize_deserialize_is_identity(
        id in any::<u32>(),
        name in "\\PC{0,32}",
        tags in vec(any::<i32>(), 0..8),
    ) {
        let serializer = JsonSerializer;
        let original = Payload { id, name, tags };
        let bytes = serializer.serialize(&original).unwrap();
        let decoded: Payload = serializer.deserialize(&bytes).unwrap();
        prop_assert_eq!(original, decoded);
    }

    #[test]
    fn bincode_serialize_deserialize_is_identity(
        id in any::<u32>(),
        name in "\\PC{0,32}",
        tags in vec(any::<i32>(), 0..8),
    ) {
        let serializer = BincodeSerializer;
        let original = Payload { id, name, tags };
        let bytes = serializer.serialize(&original).unwrap();
        let decoded: Payload = serializer.deserialize(&bytes).unwrap();
        prop_assert_eq!(original, decoded);
    }

    #[test]
    fn cache_increment_total_is_independent_of_interleaving(
        deltas in vec(-50i64..50, 1..20),
    ) {
        let expected: i64 = deltas.iter().sum();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let cache = Arc::new(InMemoryCache::new(InMemoryCacheConfig::default()));

        rt.block_on(async {
            let mut handles = Vec::new();
            for delta in deltas {
                let cache = cache.clone();
                handles.push(tokio::spawn(async move {
                    cache.increment("counter", delta, None).await.unwrap();
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
        });

        let total: Option<i64> = rt.block_on(cache.get("counter")).unwrap();
        prop_assert_eq!(total.unwrap_or(0), expected);
    }
}
