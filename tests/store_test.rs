//! Job store behavior across connections and restarts.

mod common;

use std::collections::HashSet;
use std::thread;

use chrono::Duration;

use deepq::core::events::EventBus;
use deepq::core::models::{JobId, JobSpec, JobStatus, NewJob};
use deepq::core::money::Usd;
use deepq::storage::jobs::JobStore;
use deepq::storage::schema::Database;
use deepq::test_utils::{Provider, TestDir};

use common::logger::TestLogger;

fn new_job(n: usize) -> NewJob {
    NewJob {
        id: JobId::generate(),
        spec: JobSpec::new(format!("topic {n}")),
        priority: 0,
        provider: Provider::OpenAi,
        model: "o4-mini-deep-research".to_string(),
        cost_estimate: Usd::from_cents(10),
        reservation_id: None,
        session_id: None,
    }
}

#[test]
fn concurrent_workers_never_claim_the_same_job() {
    let log = TestLogger::new("concurrent_workers_never_claim_the_same_job");
    let dir = TestDir::new();
    let path = dir.file_path("jobs.sqlite");

    log.phase("setup");
    let seed = JobStore::new(Database::open(&path).unwrap(), EventBus::default());
    let mut expected = HashSet::new();
    for n in 0..60 {
        expected.insert(seed.enqueue(new_job(n)).unwrap().id);
    }

    log.phase("race");
    // Each worker has its own connection, like separate processes.
    let stores: Vec<JobStore> = (0..4)
        .map(|_| JobStore::new(Database::open(&path).unwrap(), EventBus::default()))
        .collect();
    let handles: Vec<_> = stores
        .into_iter()
        .enumerate()
        .map(|(w, store)| {
            thread::spawn(move || {
                let name = format!("worker-{w}");
                let mut claimed = Vec::new();
                while let Some(job) = store.dequeue_next(&name, Duration::seconds(60)).unwrap() {
                    assert_eq!(job.lease_owner.as_deref(), Some(name.as_str()));
                    claimed.push(job.id);
                }
                claimed
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.join().unwrap() {
            total += 1;
            assert!(seen.insert(id.clone()), "job {id} claimed twice");
        }
    }
    assert_eq!(total, 60);
    assert_eq!(seen, expected);

    let counts = seed.count_by_status().unwrap();
    let processing = counts
        .iter()
        .find(|(status, _)| *status == JobStatus::Processing)
        .map_or(0, |(_, n)| *n);
    assert_eq!(processing, 60);
    log.finish_ok();
}

#[test]
fn jobs_survive_reopen() {
    let dir = TestDir::new();
    let path = dir.file_path("jobs.sqlite");
    let id = {
        let store = JobStore::new(Database::open(&path).unwrap(), EventBus::default());
        store.enqueue(new_job(1)).unwrap().id
    };

    let store = JobStore::new(Database::open(&path).unwrap(), EventBus::default());
    let job = store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.provider, Provider::OpenAi);
    assert_eq!(job.prompt, "topic 1");
    assert_eq!(store.events(&id).unwrap().len(), 1);
}

#[test]
fn expired_lease_is_adopted_by_another_worker() {
    let dir = TestDir::new();
    let path = dir.file_path("jobs.sqlite");
    let store = JobStore::new(Database::open(&path).unwrap(), EventBus::default());
    store.enqueue(new_job(1)).unwrap();

    let claimed = store
        .dequeue_next("dead-worker", Duration::milliseconds(-1))
        .unwrap()
        .unwrap();

    let other = JobStore::new(Database::open(&path).unwrap(), EventBus::default());
    let adopted = other
        .adopt_orphan("live-worker", Duration::seconds(60))
        .unwrap()
        .unwrap();
    assert_eq!(adopted.id, claimed.id);
    assert_eq!(adopted.lease_owner.as_deref(), Some("live-worker"));
    assert!(other
        .adopt_orphan("third-worker", Duration::seconds(60))
        .unwrap()
        .is_none());
}
