use proximity::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

async fn memory_service() -> Arc<ProximityService> {
    let mut config = Config::default();
    config.reconcile.interval_secs = 0;
    ProximityService::open(config).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_get_distinct_ids() {
    let service = memory_service().await;

    let mut handles = Vec::with_capacity(500);
    for i in 0..500 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let lat = 37.4 + (i % 25) as f64 * 0.004;
            let lon = 126.9 + (i / 25) as f64 * 0.004;
            let category = Category::ALL[i % Category::ALL.len()];
            service
                .writes()
                .create(BusinessDraft::new(format!("shop-{}", i), "Seoul", lat, lon, category))
                .await
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let business = handle.await.unwrap().unwrap();
        assert_eq!(business.version, 0);
        ids.insert(business.id);
    }
    assert_eq!(ids.len(), 500);
    assert_eq!(service.store().count().await.unwrap(), 500);
    assert_eq!(service.index().len().unwrap(), 500);
    assert!(service.inconsistencies().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_version_updates_exactly_one_wins() {
    let service = memory_service().await;
    let original = service
        .writes()
        .create(BusinessDraft::new("contested", "Seoul", 37.5, 127.0, Category::Bar))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let service = Arc::clone(&service);
        let id = original.id;
        handles.push(tokio::spawn(async move {
            let draft = BusinessDraft::new(
                format!("writer-{}", i),
                "Seoul",
                37.5 + i as f64 * 0.01,
                127.0,
                Category::Bar,
            );
            service
                .writes()
                .update(id, BusinessUpdate::new(draft).expecting(0))
                .await
        }));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(business) => winners.push(business),
            Err(ProximityError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 15);

    let winner = &winners[0];
    assert_eq!(winner.version, 1);
    assert_eq!(service.reads().get(&original.id).await.unwrap(), *winner);
    let entry = service.index().locate(&original.id).unwrap().unwrap();
    assert_eq!(entry.point, winner.point());
    assert_eq!(entry.version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_moving_business_never_disappears_from_search() {
    let service = memory_service().await;
    let a = Point::new(37.5, 127.0);
    let b = Point::new(37.52, 127.02);
    let mover_id = service
        .writes()
        .create(BusinessDraft::new("food truck", "Seoul", a.lat, a.lon, Category::KoreanFood))
        .await
        .unwrap()
        .id;

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let service = Arc::clone(&service);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            for round in 0..200 {
                let to = if round % 2 == 0 { b } else { a };
                let draft =
                    BusinessDraft::new("food truck", "Seoul", to.lat, to.lon, Category::KoreanFood);
                service
                    .writes()
                    .update(mover_id, BusinessUpdate::new(draft))
                    .await
                    .unwrap();
            }
            done.store(true, Ordering::Release);
        })
    };

    // both spots are inside this circle
    let query = NearbyQuery::new(37.51, 127.01, 5_000.0);
    let mut readers = Vec::new();
    for _ in 0..3 {
        let service = Arc::clone(&service);
        let done = Arc::clone(&done);
        let query = query.clone();
        readers.push(tokio::spawn(async move {
            let mut observed = 0;
            while !done.load(Ordering::Acquire) {
                let hits = service.reads().nearby(&query).await.unwrap();
                assert_eq!(hits.len(), 1, "mover missing or duplicated mid-relocation");
                assert_eq!(hits[0].business.id, mover_id);
                observed += 1;
                tokio::task::yield_now().await;
            }
            observed
        }));
    }

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }

    let final_state = service.reads().get(&mover_id).await.unwrap();
    assert_eq!(final_state.version, 200);
    assert_eq!(final_state.point(), a);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queries_run_while_seeding() {
    let service = memory_service().await;

    let seeder = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            for batch in 0..10 {
                let drafts: Vec<_> = (0..100)
                    .map(|i| {
                        let n = batch * 100 + i;
                        BusinessDraft::new(
                            format!("seed-{}", n),
                            "Seoul",
                            37.45 + (n % 40) as f64 * 0.0025,
                            126.95 + (n / 40) as f64 * 0.0025,
                            Category::Convenience,
                        )
                    })
                    .collect();
                service.writes().seed(drafts).await.unwrap();
            }
        })
    };

    let query = NearbyQuery::new(37.5, 127.0, 10_000.0);
    let mut last = 0;
    while !seeder.is_finished() {
        let hits = service.reads().nearby(&query).await.unwrap();
        // seeds only add, so the visible set never shrinks
        assert!(hits.len() >= last);
        last = hits.len();
        tokio::task::yield_now().await;
    }
    seeder.await.unwrap();

    let hits = service.reads().nearby(&query).await.unwrap();
    assert_eq!(hits.len(), 1_000);
}

#[tokio::test]
async fn test_reconcile_runs_do_not_overlap() {
    let service = memory_service().await;
    for i in 0..50 {
        let lon = 127.0 + i as f64 * 0.001;
        let draft = BusinessDraft::new(format!("b{}", i), "Seoul", 37.5, lon, Category::Gym);
        service.writes().create(draft).await.unwrap();
    }

    let (first, second) = tokio::join!(
        service.reconciler().consistency_check(),
        service.reconciler().full_sync(),
    );
    let outcomes = [first.is_ok(), second.is_ok()];
    assert!(outcomes.iter().any(|ok| *ok));
    for result in [first, second] {
        if let Err(e) = result {
            assert!(matches!(e, ProximityError::ReconcileInProgress));
        }
    }
    assert!(!service.reconciler().is_running());
    assert_eq!(service.index().len().unwrap(), 50);
}
