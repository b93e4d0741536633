// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use stronghold_tx as tx;
use tx::{Error, ErrorCode, Module, Result};

#[cfg(test)]
#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

/// A module that records the tails of applied and undone events.
#[derive(Default)]
struct Recorder {
    applied: Vec<usize>,
    undone: Vec<usize>,
    finishes: usize,
}

impl Module for Recorder {
    fn apply_event(&mut self, _head: u16, tail: usize) -> Result<()> {
        self.applied.push(tail);
        Ok(())
    }

    fn undo_event(&mut self, _head: u16, tail: usize) -> Result<()> {
        self.undone.push(tail);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finishes += 1;
        Ok(())
    }
}

#[test]
fn test_event_apply_order() {
    let id = tx::register_module(Box::<Recorder>::default()).expect("Failed to register module");

    tx::run(|| {
        tx::append_event(id, 0, 1)?;
        tx::append_event(id, 0, 2)?;
        tx::append_event(id, 0, 3)?;
        Ok(())
    })
    .expect("Transaction failed");

    let (applied, undone) =
        tx::with_module::<Recorder, _>(id, |m| Ok((m.applied.clone(), m.undone.clone())))
            .expect("Failed to inspect module");

    assert_eq!(applied, vec![1, 2, 3]);
    assert!(undone.is_empty());
}

#[test]
fn test_event_undo_order_is_reversed() {
    let id = tx::register_module(Box::<Recorder>::default()).expect("Failed to register module");

    let result: Result<()> = tx::run(|| {
        tx::append_event(id, 0, 1)?;
        tx::append_event(id, 0, 2)?;
        tx::append_event(id, 0, 3)?;
        Err(Error::code(ErrorCode::General).into_non_recoverable())
    });
    assert!(result.is_err());

    let (applied, undone) =
        tx::with_module::<Recorder, _>(id, |m| Ok((m.applied.clone(), m.undone.clone())))
            .expect("Failed to inspect module");

    assert!(applied.is_empty());
    assert_eq!(undone, vec![3, 2, 1]);
}

#[test]
fn test_event_log_carries_arbitrary_payloads() {
    use rand::Rng;

    let id = tx::register_module(Box::<Recorder>::default()).expect("Failed to register module");

    let mut rng = rand::thread_rng();
    let tails: Vec<usize> = (0..256).map(|_| rng.gen()).collect();

    tx::run(|| {
        for tail in &tails {
            tx::append_event(id, 0, *tail)?;
        }
        Ok(())
    })
    .expect("Transaction failed");

    let applied = tx::with_module::<Recorder, _>(id, |m| Ok(m.applied.clone()))
        .expect("Failed to inspect module");
    assert_eq!(applied, tails);
}

#[test]
fn test_finish_runs_on_both_paths() {
    let id = tx::register_module(Box::<Recorder>::default()).expect("Failed to register module");

    tx::run(|| Ok(())).expect("Transaction failed");
    let _: Result<()> = tx::run(|| Err(Error::code(ErrorCode::General).into_non_recoverable()));

    let finishes = tx::with_module::<Recorder, _>(id, |m| Ok(m.finishes))
        .expect("Failed to inspect module");
    assert_eq!(finishes, 2);
}

/// A module that reports a conflict from prepare_commit a configurable
/// number of times.
struct Contender {
    prepare_conflicts: usize,
    prepares: usize,
}

impl Module for Contender {
    fn prepare_commit(&mut self, _irrevocable: bool) -> Result<()> {
        self.prepares += 1;
        if self.prepares <= self.prepare_conflicts {
            return Err(Error::conflicting(None));
        }
        Ok(())
    }
}

#[test]
fn test_prepare_conflict_restarts_the_transaction() {
    let id = tx::register_module(Box::new(Contender {
        prepare_conflicts: 2,
        prepares: 0,
    }))
    .expect("Failed to register module");

    let mut attempts = 0;
    tx::run(|| {
        attempts += 1;
        Ok(())
    })
    .expect("Transaction failed");

    assert_eq!(attempts, 3);
    assert_eq!(tx::number_of_restarts(), 2);

    let prepares =
        tx::with_module::<Contender, _>(id, |m| Ok(m.prepares)).expect("Failed to inspect module");
    assert_eq!(prepares, 3);
}

/// A module whose operations push onto a shared stack during execution;
/// rolling back an event pops the pushed value again.
struct StackModule {
    stack: Arc<Mutex<Vec<usize>>>,
}

impl StackModule {
    /// The transactional operation: pushes eagerly and logs an event so
    /// that a rollback can revert the push.
    fn push(id: usize, value: usize) -> Result<()> {
        tx::with_module::<StackModule, _>(id, |m| {
            m.stack.lock().unwrap().push(value);
            Ok(())
        })?;
        tx::append_event(id, 0, value)
    }
}

impl Module for StackModule {
    fn undo_event(&mut self, _head: u16, tail: usize) -> Result<()> {
        let popped = self.stack.lock().unwrap().pop();
        assert_eq!(popped, Some(tail));
        Ok(())
    }
}

#[test]
fn test_undo_returns_to_initial_state() {
    let stack = Arc::new(Mutex::new(vec![7usize]));
    let id = tx::register_module(Box::new(StackModule { stack: stack.clone() }))
        .expect("Failed to register module");

    // a committed transaction keeps its pushes
    tx::run(|| {
        StackModule::push(id, 8)?;
        StackModule::push(id, 9)?;
        Ok(())
    })
    .expect("Transaction failed");
    assert_eq!(*stack.lock().unwrap(), vec![7, 8, 9]);

    // an aborted transaction pops them back off
    let _: Result<()> = tx::run(|| {
        StackModule::push(id, 10)?;
        assert_eq!(*stack.lock().unwrap(), vec![7, 8, 9, 10]);
        Err(Error::code(ErrorCode::General).into_non_recoverable())
    });
    assert_eq!(*stack.lock().unwrap(), vec![7, 8, 9]);
}

#[test]
fn test_registration_order_is_apply_order() {
    let order = Arc::new(Mutex::new(Vec::new()));

    struct Tagged {
        tag: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Module for Tagged {
        fn apply(&mut self) -> Result<()> {
            self.order.lock().unwrap().push(self.tag);
            Ok(())
        }
    }

    tx::register_module(Box::new(Tagged {
        tag: "first",
        order: order.clone(),
    }))
    .expect("Failed to register module");
    tx::register_module(Box::new(Tagged {
        tag: "second",
        order: order.clone(),
    }))
    .expect("Failed to register module");

    tx::run(|| Ok(())).expect("Transaction failed");

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn test_irrevocable_transaction_runs_alone() {
    static INSIDE: AtomicUsize = AtomicUsize::new(0);
    static VIOLATIONS: AtomicUsize = AtomicUsize::new(0);

    let mut workers = Vec::new();

    for _ in 0..4 {
        workers.push(std::thread::spawn(|| {
            for _ in 0..200 {
                tx::run(|| {
                    INSIDE.fetch_add(1, Ordering::SeqCst);
                    for _ in 0..64 {
                        std::hint::spin_loop();
                    }
                    INSIDE.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .expect("Transaction failed");
            }
        }));
    }

    let upgraded = std::thread::spawn(|| {
        for _ in 0..50 {
            let mode = tx::run(|| {
                // request exclusive execution; the first attempt restarts
                tx::irrevocable()?;

                INSIDE.fetch_add(1, Ordering::SeqCst);
                if INSIDE.load(Ordering::SeqCst) != 1 {
                    VIOLATIONS.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::sleep(std::time::Duration::from_micros(50));
                if INSIDE.load(Ordering::SeqCst) != 1 {
                    VIOLATIONS.fetch_add(1, Ordering::SeqCst);
                }
                INSIDE.fetch_sub(1, Ordering::SeqCst);

                Ok(tx::is_irrevocable())
            })
            .expect("Transaction failed");

            assert!(mode, "transaction did not run irrevocably");
        }
    });

    for worker in workers {
        worker.join().expect("Failed to join worker");
    }
    upgraded.join().expect("Failed to join upgraded thread");

    assert_eq!(VIOLATIONS.load(Ordering::SeqCst), 0);
}

#[test]
fn test_release_runs_at_thread_exit() {
    struct Released {
        flag: Arc<AtomicBool>,
    }

    impl Module for Released {
        fn release(&mut self) {
            self.flag.store(true, Ordering::SeqCst);
        }
    }

    let flag = Arc::new(AtomicBool::new(false));
    let thread_flag = flag.clone();

    std::thread::spawn(move || {
        tx::register_module(Box::new(Released { flag: thread_flag }))
            .expect("Failed to register module");
        tx::run(|| Ok(())).expect("Transaction failed");
    })
    .join()
    .expect("Failed to join");

    assert!(flag.load(Ordering::SeqCst));
}

#[test]
fn test_explicit_thread_release() {
    struct Released {
        flag: Arc<AtomicBool>,
    }

    impl Module for Released {
        fn release(&mut self) {
            self.flag.store(true, Ordering::SeqCst);
        }
    }

    let flag = Arc::new(AtomicBool::new(false));
    tx::register_module(Box::new(Released { flag: flag.clone() }))
        .expect("Failed to register module");

    tx::release_thread();
    assert!(flag.load(Ordering::SeqCst));

    // the thread can start over with a fresh record
    tx::run(|| Ok(())).expect("Transaction failed");
}

#[test]
fn test_signal_error_restarts_when_recoverable() {
    let mut attempts = 0;

    tx::run(|| {
        attempts += 1;
        if attempts == 1 {
            tx::set_pending_error(Error::signal(2));
        }
        Ok(())
    })
    .expect("Transaction failed");

    assert_eq!(attempts, 2);
}

#[test]
fn test_signal_error_surfaces_when_fatal() {
    let result: Result<()> = tx::run(|| {
        tx::set_pending_error(Error::signal(11).into_non_recoverable());
        Ok(())
    });

    let err = result.expect_err("Transaction should fail");
    assert_eq!(err.as_signal(), 11);
    assert!(err.is_non_recoverable());
}
