//! Many connections racing on one database file must never hand the same
//! job to two claimers.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use queuectl_core::{config::QueueConfig, SystemClock};
use queuectl_store::{Db, JobState, JobStore, NewJob};

const JOBS: usize = 200;
const CLAIMERS: usize = 8;

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("queuectl-claim-{}.db", uuid::Uuid::new_v4()))
}

#[test]
fn concurrent_claims_are_exclusive() {
    let path = temp_db_path();
    let seed = Db::open(&path, Duration::from_secs(5)).expect("open seed db");
    let store = JobStore::new(seed, &QueueConfig::default(), Arc::new(SystemClock)).expect("store");
    for i in 0..JOBS {
        store
            .enqueue(NewJob::new("true").with_id(format!("job-{i:04}")))
            .expect("enqueue");
    }

    // One connection per claimer, opened up front so the journal-mode switch
    // is not part of the race.
    let stores: Vec<JobStore> = (0..CLAIMERS)
        .map(|_| {
            let db = Db::open(&path, Duration::from_secs(5)).expect("open db");
            JobStore::new(db, &QueueConfig::default(), Arc::new(SystemClock)).expect("store")
        })
        .collect();

    let barrier = Arc::new(Barrier::new(CLAIMERS));
    let handles: Vec<_> = stores
        .into_iter()
        .enumerate()
        .map(|(n, store)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let worker_id = format!("claimer-{n}");
                barrier.wait();
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_pending_job(&worker_id).expect("claim") {
                    assert_eq!(job.locked_by.as_deref(), Some(worker_id.as_str()));
                    claimed.push(job.id);
                }
                claimed
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.join().expect("claimer thread") {
            total += 1;
            assert!(seen.insert(id.clone()), "job {id} was claimed twice");
        }
    }
    assert_eq!(total, JOBS);
    assert_eq!(seen.len(), JOBS);

    let counts = store.state_counts().expect("counts");
    assert_eq!(counts[&JobState::Processing], JOBS as u64);
    assert_eq!(counts[&JobState::Pending], 0);

    drop(store);
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}
