//! Single-consumer execution surface for the engine.
//!
//! Sessions never touch the engine. They hand [`EvalUnit`]s to an
//! [`EngineHandle`], which pushes them onto one unbounded FIFO queue. A
//! dedicated OS thread owns the engine and drains the queue one unit at a
//! time, so no two units ever interleave their effects on shared state and
//! units run in submission order across all sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use super::{EvalFailure, ScriptEngine};
use crate::dispatch::EvalUnit;
use crate::error::ReplError;

/// Name of the engine worker thread.
pub const ENGINE_THREAD_NAME: &str = "repl-engine";

#[derive(Debug, Default)]
struct EngineStats {
    pending: AtomicUsize,
    completed: AtomicU64,
}

impl EngineStats {
    /// Moves one unit from pending to completed.
    fn settle(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cloneable handle to the engine worker.
///
/// The worker thread exits once every handle is dropped and the queue is
/// drained.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    queue: mpsc::UnboundedSender<EvalUnit>,
    stats: Arc<EngineStats>,
}

impl EngineHandle {
    /// Spawns the worker thread. `factory` runs on that thread, so the
    /// engine it builds never has to be `Send`.
    ///
    /// Units that waited in the queue longer than `eval_timeout` are failed
    /// with a `TimeoutError` instead of being run.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::EngineUnavailable`] if the thread cannot be
    /// spawned.
    pub fn spawn<E, F>(factory: F, eval_timeout: Duration) -> Result<Self, ReplError>
    where
        E: ScriptEngine + 'static,
        F: FnOnce() -> E + Send + 'static,
    {
        let (queue, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(EngineStats::default());
        let worker_stats = Arc::clone(&stats);

        std::thread::Builder::new()
            .name(ENGINE_THREAD_NAME.to_string())
            .spawn(move || {
                let mut engine = factory();
                tracing::debug!("engine worker started");
                run_worker(&mut engine, rx, &worker_stats, eval_timeout);
                tracing::debug!("engine worker stopped");
            })
            .map_err(|e| ReplError::EngineUnavailable(e.to_string()))?;

        Ok(Self { queue, stats })
    }

    /// Queues `unit` for execution. Never blocks.
    ///
    /// If the worker has shut down the unit is failed immediately, so its
    /// error continuation still fires.
    pub fn submit(&self, mut unit: EvalUnit) {
        unit.mark_submitted();
        self.stats.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(mut unit)) = self.queue.send(unit) {
            self.stats.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("engine worker gone, failing unit");
            let _ = unit.fail(EvalFailure::engine_unavailable());
        }
    }

    /// Number of units queued or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.stats.pending.load(Ordering::SeqCst)
    }

    /// Number of units the worker has completed.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::SeqCst)
    }

    /// Returns `true` while the worker thread is accepting units.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.queue.is_closed()
    }
}

fn run_worker<E: ScriptEngine>(
    engine: &mut E,
    mut rx: mpsc::UnboundedReceiver<EvalUnit>,
    stats: &EngineStats,
    eval_timeout: Duration,
) {
    while let Some(mut unit) = rx.blocking_recv() {
        let waited = unit.submitted_at().elapsed();
        // Counters settle before the continuation fires.
        let result = if waited > eval_timeout {
            tracing::warn!(waited_ms = waited.as_millis(), "unit timed out in queue");
            unit.fail_then(EvalFailure::timeout(waited), || stats.settle())
        } else {
            tracing::debug!(request = unit.request().label(), "invoking unit");
            unit.invoke_then(engine, || stats.settle())
        };
        if let Err(err) = result {
            tracing::error!(error = %err, "unit completed twice");
            stats.settle();
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::dispatch::EvalRequest;
    use crate::engine::{EvalOutcome, EvalValue};

    /// Records the order of evaluations and flags any overlap.
    struct TracingEngine {
        log: Arc<Mutex<Vec<String>>>,
        busy: Arc<std::sync::atomic::AtomicBool>,
        delay: Duration,
    }

    impl ScriptEngine for TracingEngine {
        fn eval(&mut self, source: &str) -> EvalOutcome {
            if self.busy.swap(true, Ordering::SeqCst) {
                return Err(EvalFailure::new("Error", "re-entered"));
            }
            std::thread::sleep(self.delay);
            if let Ok(mut log) = self.log.lock() {
                log.push(source.to_string());
            }
            self.busy.store(false, Ordering::SeqCst);
            Ok(EvalValue::new(json!(source), source))
        }

        fn call(&mut self, target: &str, _args: &[serde_json::Value]) -> EvalOutcome {
            self.eval(target)
        }
    }

    fn spawn_tracing(
        delay: Duration,
        timeout: Duration,
    ) -> (EngineHandle, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine_log = Arc::clone(&log);
        let Ok(handle) = EngineHandle::spawn(
            move || TracingEngine {
                log: engine_log,
                busy: Arc::new(std::sync::atomic::AtomicBool::new(false)),
                delay,
            },
            timeout,
        ) else {
            panic!("spawn failed");
        };
        (handle, log)
    }

    #[tokio::test]
    async fn units_run_in_submission_order() {
        let (handle, log) = spawn_tracing(Duration::from_millis(1), Duration::from_secs(5));
        let mut replies = Vec::new();
        for i in 0..20 {
            let (unit, rx) = EvalUnit::with_reply(EvalRequest::RawCode(format!("u{i}")));
            handle.submit(unit);
            replies.push(rx);
        }
        for rx in replies {
            let Ok(Ok(_)) = rx.await else {
                panic!("unit failed");
            };
        }
        let Ok(log) = log.lock() else {
            panic!("poisoned");
        };
        let expected: Vec<String> = (0..20).map(|i| format!("u{i}")).collect();
        assert_eq!(*log, expected);
        assert_eq!(handle.completed(), 20);
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn concurrent_submitters_never_overlap() {
        let (handle, log) = spawn_tracing(Duration::from_millis(2), Duration::from_secs(5));
        let mut tasks = Vec::new();
        for session in ["a", "b"] {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let mut outcomes = Vec::new();
                for i in 0..5 {
                    let (unit, rx) =
                        EvalUnit::with_reply(EvalRequest::RawCode(format!("{session}{i}")));
                    handle.submit(unit);
                    outcomes.push((format!("{session}{i}"), rx));
                }
                for (expected, rx) in outcomes {
                    let Ok(Ok(value)) = rx.await else {
                        panic!("unit failed or overlapped");
                    };
                    assert_eq!(value.display, expected);
                }
            }));
        }
        for task in tasks {
            assert!(task.await.is_ok());
        }
        let Ok(log) = log.lock() else {
            panic!("poisoned");
        };
        assert_eq!(log.len(), 10);
    }

    #[tokio::test]
    async fn stale_units_time_out_without_running() {
        let (handle, log) = spawn_tracing(Duration::from_millis(150), Duration::from_millis(50));
        let (first, first_rx) = EvalUnit::with_reply(EvalRequest::RawCode("slow".into()));
        let (second, second_rx) = EvalUnit::with_reply(EvalRequest::RawCode("late".into()));
        handle.submit(first);
        handle.submit(second);

        assert!(matches!(first_rx.await, Ok(Ok(_))));
        let Ok(Err(failure)) = second_rx.await else {
            panic!("late unit was not timed out");
        };
        assert_eq!(failure.kind, "TimeoutError");
        let Ok(log) = log.lock() else {
            panic!("poisoned");
        };
        assert_eq!(*log, vec!["slow".to_string()]);
    }

    #[tokio::test]
    async fn counters_settle_before_reply() {
        let (handle, _log) = spawn_tracing(Duration::ZERO, Duration::from_secs(5));
        for expected in 1..=3 {
            let (unit, rx) = EvalUnit::with_reply(EvalRequest::RawCode("x".into()));
            handle.submit(unit);
            assert!(matches!(rx.await, Ok(Ok(_))));
            assert_eq!(handle.completed(), expected);
            assert_eq!(handle.pending(), 0);
        }
    }

    #[test]
    fn handle_reports_alive() {
        let (handle, _log) = spawn_tracing(Duration::ZERO, Duration::from_secs(1));
        assert!(handle.is_alive());
    }
}
