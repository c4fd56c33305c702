// Property-based tests for the reserver family

use common::backend::MemoryBackend;
use common::client::{Client, PutOptions};
use common::models::JobData;
use common::reserver::{OrderedReserver, Reserver, RoundRobinReserver, ShuffledRoundRobinReserver};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn queue_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("q{}", i)).collect()
}

async fn put_jobs(client: &Client, queue: &str, count: usize) {
    for _ in 0..count {
        client
            .queue(queue)
            .put("Sample", JobData::new(), PutOptions::default())
            .await
            .unwrap();
    }
}

// With only queue k holding work, every round robin call finds it and the
// rotation index moves by exactly one per call, hit or miss.
proptest! {
    #[test]
    fn round_robin_advances_once_per_call(
        (n, k) in (1usize..6).prop_flat_map(|n| (Just(n), 0..n)),
        start_calls in 0usize..6,
        jobs in 1usize..4,
    ) {
        runtime().block_on(async {
            let client = Client::new(Arc::new(MemoryBackend::new()), "w");
            let names = queue_names(n);
            let mut reserver = RoundRobinReserver::new(
                names.iter().map(|name| client.queue(name.clone())).collect(),
            );

            // Misses on empty queues still rotate
            for call in 0..start_calls {
                prop_assert!(reserver.reserve().await.unwrap().is_none());
                prop_assert_eq!(reserver.index(), (call + 1) % n);
            }

            put_jobs(&client, &names[k], jobs).await;
            for _ in 0..jobs {
                let before = reserver.index();
                let job = reserver.reserve().await.unwrap();
                prop_assert_eq!(job.map(|j| j.queue().to_string()), Some(names[k].clone()));
                prop_assert_eq!(reserver.index(), (before + 1) % n);
            }
            Ok(())
        })?;
    }
}

// Ordered reservation depends only on queue contents and list order
proptest! {
    #[test]
    fn ordered_ignores_call_history(
        filled in proptest::collection::vec(any::<bool>(), 1..6),
        warmup in 0usize..4,
    ) {
        runtime().block_on(async {
            let client = Client::new(Arc::new(MemoryBackend::new()), "w");
            let names = queue_names(filled.len());
            let mut reserver = OrderedReserver::new(
                names.iter().map(|name| client.queue(name.clone())).collect(),
            );

            for _ in 0..warmup {
                prop_assert!(reserver.reserve().await.unwrap().is_none());
            }

            for (name, has_job) in names.iter().zip(&filled) {
                if *has_job {
                    put_jobs(&client, name, 1).await;
                }
            }

            let expected = names
                .iter()
                .zip(&filled)
                .find(|(_, has_job)| **has_job)
                .map(|(name, _)| name.clone());
            let job = reserver.reserve().await.unwrap();
            prop_assert_eq!(job.map(|j| j.queue().to_string()), expected);
            Ok(())
        })?;
    }
}

// Shuffling never changes the queue set
proptest! {
    #[test]
    fn shuffled_queues_stay_a_permutation(n in 1usize..8, forks in 1usize..10) {
        runtime().block_on(async {
            let client = Client::new(Arc::new(MemoryBackend::new()), "w");
            let names = queue_names(n);
            let configured: HashSet<String> = names.iter().cloned().collect();
            let mut reserver = ShuffledRoundRobinReserver::new(
                names.iter().map(|name| client.queue(name.clone())).collect(),
            );

            for _ in 0..forks {
                reserver.before_fork().await.unwrap();
                let current: Vec<String> =
                    reserver.queues().iter().map(|q| q.name().to_string()).collect();
                prop_assert_eq!(current.len(), n);
                prop_assert_eq!(current.into_iter().collect::<HashSet<_>>(), configured.clone());
            }
            Ok(())
        })?;
    }
}
