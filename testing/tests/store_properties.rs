//! Property tests for the in-memory event store's ordering contract.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages

use eventline_core::{DomainEvent, EventStore, StoredEvent};
use eventline_testing::mocks::InMemoryEventStore;
use proptest::prelude::*;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime builds")
        .block_on(future)
}

proptest! {
    /// For every sequence of appended events, `all_stored_events_since(0)`
    /// returns them in strictly ascending id order equal to append order.
    #[test]
    fn since_zero_preserves_append_order(names in proptest::collection::vec("[a-z.]{1,16}", 1..24)) {
        let result: Result<(), TestCaseError> = block_on(async {
            let store = InMemoryEventStore::new();
            for name in &names {
                let event = DomainEvent::new(name, 1, serde_json::json!({}))
                    .expect("valid event");
                store.append(event).await.expect("appends");
            }

            let all = store.all_stored_events_since(0).await.expect("reads");
            prop_assert_eq!(all.len(), names.len());
            for (index, (stored, name)) in all.iter().zip(&names).enumerate() {
                prop_assert_eq!(stored.id(), i64::try_from(index).expect("fits") + 1);
                prop_assert_eq!(stored.type_name(), name.as_str());
            }
            Ok(())
        });
        result?;
    }

    /// `since` and `between` agree with each other and with the count.
    #[test]
    fn slices_are_consistent(total in 1i64..20, since in 0i64..20, low in 1i64..20, high in 1i64..20) {
        let result: Result<(), TestCaseError> = block_on(async {
            let store = InMemoryEventStore::new();
            for index in 0..total {
                let event = DomainEvent::new("slice.event", 1, serde_json::json!({ "index": index }))
                    .expect("valid event");
                store.append(event).await.expect("appends");
            }

            prop_assert_eq!(store.count_events().await.expect("counts"), total);

            let tail = store.all_stored_events_since(since).await.expect("reads");
            let expected_tail = (total - since).max(0);
            prop_assert_eq!(i64::try_from(tail.len()).expect("fits"), expected_tail);
            prop_assert!(tail.windows(2).all(|pair| pair[0].id() < pair[1].id()));

            let slice = store.all_stored_events_between(low, high).await.expect("reads");
            let expected_slice = (high.min(total) - low + 1).max(0);
            prop_assert_eq!(i64::try_from(slice.len()).expect("fits"), expected_slice);
            prop_assert!(slice.iter().all(|event| event.id() >= low && event.id() <= high));
            prop_assert!(slice.windows(2).all(|pair| pair[0].id() < pair[1].id()));

            let ids: Vec<i64> = slice.iter().map(StoredEvent::id).collect();
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            prop_assert_eq!(ids, sorted);
            Ok(())
        });
        result?;
    }
}
