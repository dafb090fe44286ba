//! End-to-end flows through the coordinator, tokens and executors.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use taskgrant_access::{try_write_access, AccessManager, AccessRequest, HierarchicalRight};
use taskgrant_cancel::CancellationToken;
use taskgrant_executor::{ManualTaskExecutor, SyncTaskExecutor};

type Manager = AccessManager<String, String>;

fn right(path: &[&str]) -> HierarchicalRight<String> {
    HierarchicalRight::new(path.iter().map(|c| c.to_string()))
}

fn write_request(id: &str, path: &[&str]) -> AccessRequest<String, HierarchicalRight<String>> {
    AccessRequest::write_request(id.to_string(), right(path))
}

#[test]
fn grant_work_release_regrant() {
    let manager = Manager::new();
    let manual = ManualTaskExecutor::new(false);

    let grant = manager.try_get_access(&write_request("writer", &["db", "users"]));
    assert!(grant.is_available());
    let token = grant.token().unwrap();

    let executor = token.executor(Box::new(manual.clone()));
    let ran = Arc::new(AtomicUsize::new(0));
    let canceled = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&ran);
    executor.execute(
        CancellationToken::UNCANCELABLE,
        Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        None,
    );
    let count = Arc::clone(&canceled);
    executor.execute(
        CancellationToken::UNCANCELABLE,
        Box::new(|_| panic!("must not run")),
        Some(Box::new(move |outcome| {
            assert!(outcome.is_canceled());
            count.fetch_add(1, Ordering::SeqCst);
        })),
    );

    // Run the first task, then cancel the rest at release.
    assert!(manual.try_execute_one());
    token.release_and_cancel();
    manual.execute_currently_submitted();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(canceled.load(Ordering::SeqCst), 1);
    token.await_release(&CancellationToken::UNCANCELABLE).unwrap();

    // The rights are free again.
    assert!(manager.try_get_access(&write_request("writer2", &["db"])).is_available());
}

#[test]
fn contending_writers_are_mutually_exclusive() {
    let manager = Manager::new();
    let in_section = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicUsize::new(0));
    let threads = 8;
    let attempts_each = 50;

    let workers: Vec<_> = (0..threads)
        .map(|worker| {
            let manager = manager.clone();
            let in_section = Arc::clone(&in_section);
            let completed = Arc::clone(&completed);
            thread::spawn(move || {
                let mut granted = 0usize;
                for attempt in 0..attempts_each {
                    let id = format!("w{worker}-{attempt}");
                    let result = try_write_access(&manager, id, right(&["shared"]));
                    let Some(token) = result.token() else { continue };
                    granted += 1;

                    let flag = Arc::clone(&in_section);
                    let count = Arc::clone(&completed);
                    let handle = token.executor(SyncTaskExecutor::boxed()).execute(
                        CancellationToken::UNCANCELABLE,
                        Box::new(move |_| {
                            assert!(!flag.swap(true, Ordering::SeqCst), "write grant not exclusive");
                            thread::sleep(Duration::from_micros(50));
                            flag.store(false, Ordering::SeqCst);
                            count.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }),
                        None,
                    );
                    assert!(handle.outcome().unwrap().is_completed());
                    token.release();
                }
                granted
            })
        })
        .collect();

    let granted: usize = workers.into_iter().map(|worker| worker.join().unwrap()).sum();
    assert!(granted > 0);
    assert_eq!(completed.load(Ordering::SeqCst), granted);
    assert!(manager.is_available(&write_request("after", &["shared"])));
}

#[test]
fn scheduled_chain_executes_every_submission_exactly_once() {
    let manager = Manager::new();
    let chain = 16;
    let executed = Arc::new(AtomicUsize::new(0));

    let first = manager.get_scheduled_access(&write_request("w0", &["db"]));
    let mut grants = vec![first];
    for link in 1..chain {
        grants.push(manager.get_scheduled_access(&write_request(&format!("w{link}"), &["db"])));
    }

    // Queue one submission per grant before anything is released.
    for grant in &grants[1..] {
        let count = Arc::clone(&executed);
        grant.token().unwrap().executor(SyncTaskExecutor::boxed()).execute(
            CancellationToken::UNCANCELABLE,
            Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            None,
        );
    }

    assert_eq!(executed.load(Ordering::SeqCst), 0);

    // Release the chain head first, then each successor as it finishes.
    for (link, grant) in grants.iter().enumerate() {
        grant.release();
        assert_eq!(executed.load(Ordering::SeqCst), (link + 1).min(chain - 1));
    }
    assert_eq!(executed.load(Ordering::SeqCst), chain - 1);
    assert!(manager.is_available(&write_request("after", &["db"])));
}

#[test]
fn await_release_sees_cross_thread_work_finish() {
    let manager = Manager::new();
    let grant = manager.try_get_access(&write_request("w", &["db"]));
    let token = Arc::clone(grant.token().unwrap());
    let manual = ManualTaskExecutor::new(false);

    let executor = token.executor(Box::new(manual.clone()));
    executor.execute(
        CancellationToken::UNCANCELABLE,
        Box::new(|_| {
            thread::sleep(Duration::from_millis(30));
            Ok(())
        }),
        None,
    );
    token.release();

    let worker = thread::spawn(move || manual.execute_currently_submitted());

    token.await_release(&CancellationToken::UNCANCELABLE).unwrap();
    assert_eq!(worker.join().unwrap(), 1);
}
