//! End-to-end scatter-gather over loopback TCP: a master plus real worker
//! processes (as threads), point routing by id modulo, and a merged top-K
//! answer.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use daybreak::master::{Master, MasterConfig, MasterError, PollOutcome};
use daybreak::metric::Metric;
use daybreak::model::Point;
use daybreak::worker::{Worker, WorkerConfig};

fn start_master(query_deadline: Duration) -> Arc<Master> {
    let master = Master::bind(MasterConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        query_deadline,
    })
    .unwrap();
    master.start().unwrap();
    master
}

fn wait_for_workers(master: &Master, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while master.worker_count() < expected {
        assert!(
            Instant::now() < deadline,
            "workers did not register in time"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_two_worker_scatter_gather() {
    let master = start_master(Duration::from_secs(10));
    let master_addr = master.local_addr().to_string();
    let dir = tempdir().unwrap();

    let mut worker_threads = Vec::new();
    let mut shard_paths = Vec::new();
    for i in 0..2 {
        let shard_path = dir.path().join(format!("shard-{i}.tsv"));
        shard_paths.push(shard_path.clone());
        let addr = master_addr.clone();
        worker_threads.push(thread::spawn(move || {
            let mut worker = Worker::new(WorkerConfig {
                master_addr: addr,
                data_path: Some(shard_path),
            })
            .unwrap();
            worker.run().unwrap();
        }));
    }
    wait_for_workers(&master, 2);

    // Six 1-D points: ids {0,2,4} land on one worker and {1,3,5} on the
    // other under id mod 2. Per-worker FIFO ordering guarantees every add is
    // processed before the search that follows it on the same connection.
    for i in 0..=5 {
        master.add_point(Point::new(i, vec![i as f32])).unwrap();
    }

    let query_id = master
        .submit_query(vec![3.0], Metric::Euclidean, 2)
        .unwrap();
    let outcome = match master.wait(query_id, Duration::from_secs(5)) {
        PollOutcome::Ready(outcome) => outcome,
        other => panic!("expected a completed query, got {other:?}"),
    };

    assert!(outcome.complete);
    assert_eq!(outcome.lost_workers, 0);
    assert_eq!(outcome.results.len(), 2);
    assert_eq!(outcome.results[0], (3, 0.0));
    // Points 2 and 4 tie at distance 1.0; either may win the second slot.
    let (second_id, second_distance) = outcome.results[1];
    assert_eq!(second_distance, 1.0);
    assert!(second_id == 2 || second_id == 4, "got id {second_id}");

    // The answer is consumed exactly once.
    assert_eq!(master.poll(query_id), PollOutcome::Unknown);

    master.shutdown();
    for handle in worker_threads {
        handle.join().unwrap();
    }

    // Shutdown made each worker persist its shard; together they hold all
    // six points.
    let mut total_lines = 0;
    for path in &shard_paths {
        let contents = std::fs::read_to_string(path).unwrap();
        total_lines += contents.lines().count();
    }
    assert_eq!(total_lines, 6);
}

#[test]
fn test_query_without_workers_is_rejected() {
    let master = start_master(Duration::from_secs(5));
    assert!(matches!(
        master.submit_query(vec![1.0], Metric::Euclidean, 1),
        Err(MasterError::NoWorkersAvailable)
    ));
    assert!(matches!(
        master.add_point(Point::new(1, vec![1.0])),
        Err(MasterError::NoWorkersAvailable)
    ));
    master.shutdown();
}

#[test]
fn test_upsert_end_to_end() {
    let master = start_master(Duration::from_secs(10));
    let master_addr = master.local_addr().to_string();

    let worker_thread = {
        let addr = master_addr.clone();
        thread::spawn(move || {
            let mut worker = Worker::new(WorkerConfig {
                master_addr: addr,
                data_path: None,
            })
            .unwrap();
            worker.run().unwrap();
        })
    };
    wait_for_workers(&master, 1);

    master.add_point(Point::new(5, vec![100.0])).unwrap();
    master.add_point(Point::new(5, vec![1.0])).unwrap();

    let query_id = master.submit_query(vec![0.0], Metric::Euclidean, 3).unwrap();
    let outcome = match master.wait(query_id, Duration::from_secs(5)) {
        PollOutcome::Ready(outcome) => outcome,
        other => panic!("expected a completed query, got {other:?}"),
    };

    // Only the replacement vector exists; the search never sees [100.0].
    assert_eq!(outcome.results, vec![(5, 1.0)]);

    master.shutdown();
    worker_thread.join().unwrap();
}
