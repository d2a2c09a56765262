//! Partitioned worker pools.
//!
//! Each partition gets its own queue and `workers` tasks pulling from it.
//! Every worker owns a [`Pacer`] and reports each finished job as a
//! [`WorkDone`] message on one channel shared by all partitions of the
//! phase; the collector is the only writer of the output vector.
//!
//! Workers check the cancellation token before taking each job. A job in
//! flight always finishes and is reported; jobs still queued when the
//! token fires come back as `skipped`. A job whose handler panics is
//! reported through [`JobHandler::panicked`] and the worker moves on.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::pacing::Pacer;

/// Work performed by pool workers.
#[async_trait]
pub(crate) trait JobHandler: Send + Sync + 'static {
    type Job: Clone + Send + 'static;
    type Output: Send + 'static;

    async fn handle(
        &self,
        job: Self::Job,
        pacer: &mut Pacer,
        cancel: &CancellationToken,
    ) -> Self::Output;

    /// Output recorded for a job whose `handle` panicked.
    fn panicked(&self, job: Self::Job, message: String) -> Self::Output;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Message sent from a worker back to the collector.
struct WorkDone<O> {
    partition: usize,
    worker: usize,
    output: O,
}

#[derive(Debug)]
pub(crate) struct PhaseOutcome<J, O> {
    pub outputs: Vec<O>,
    pub skipped: Vec<J>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolSettings {
    pub workers: usize,
    pub pacing: Duration,
}

type Queue<J> = Arc<Mutex<VecDeque<J>>>;

fn pop<J>(queue: &Queue<J>) -> Option<J> {
    queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
}

/// Run one phase: every partition's jobs on its own pool, all partitions
/// concurrently.
pub(crate) async fn run_phase<H: JobHandler>(
    handler: Arc<H>,
    partitions: Vec<Vec<H::Job>>,
    settings: PoolSettings,
    cancel: &CancellationToken,
) -> PhaseOutcome<H::Job, H::Output> {
    let total: usize = partitions.iter().map(Vec::len).sum();
    let (tx, mut rx) = mpsc::channel::<WorkDone<H::Output>>(settings.workers.max(1) * 2);

    let mut queues: Vec<Queue<H::Job>> = Vec::with_capacity(partitions.len());
    let mut handles = Vec::new();

    for (partition, jobs) in partitions.into_iter().enumerate() {
        let len = jobs.len();
        let queue: Queue<H::Job> = Arc::new(Mutex::new(jobs.into_iter().collect()));
        queues.push(Arc::clone(&queue));
        if len == 0 {
            continue;
        }

        let workers = settings.workers.max(1).min(len);
        tracing::debug!(partition, workers, jobs = len, "starting partition pool");
        for worker in 0..workers {
            let handler = Arc::clone(&handler);
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let pacing = settings.pacing;
            let span = tracing::debug_span!("worker", partition, worker);

            handles.push(tokio::spawn(
                async move {
                    let mut pacer = Pacer::new(pacing);
                    loop {
                        if cancel.is_cancelled() {
                            tracing::debug!("cancelled, leaving remaining jobs queued");
                            break;
                        }
                        let Some(job) = pop(&queue) else {
                            break;
                        };
                        let attempt =
                            AssertUnwindSafe(handler.handle(job.clone(), &mut pacer, &cancel))
                                .catch_unwind()
                                .await;
                        let output = match attempt {
                            Ok(output) => output,
                            Err(payload) => {
                                let message = panic_message(payload.as_ref());
                                tracing::error!(%message, "job handler panicked");
                                handler.panicked(job, message)
                            }
                        };
                        let done = WorkDone {
                            partition,
                            worker,
                            output,
                        };
                        if tx.send(done).await.is_err() {
                            break;
                        }
                    }
                }
                .instrument(span),
            ));
        }
    }
    drop(tx);

    let mut outputs = Vec::with_capacity(total);
    while let Some(done) = rx.recv().await {
        tracing::trace!(
            partition = done.partition,
            worker = done.worker,
            "job finished"
        );
        outputs.push(done.output);
    }

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "pool worker panicked");
        }
    }

    let mut skipped = Vec::new();
    for queue in queues {
        let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
        skipped.extend(queue.drain(..));
    }

    PhaseOutcome { outputs, skipped }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Doubler {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        cancel_after: Option<(usize, CancellationToken)>,
        handled: AtomicUsize,
    }

    impl Doubler {
        fn new(delay: Duration) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
                cancel_after: None,
                handled: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobHandler for Doubler {
        type Job = u32;
        type Output = u32;

        async fn handle(&self, job: u32, pacer: &mut Pacer, _cancel: &CancellationToken) -> u32 {
            pacer.ready().await;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let handled = self.handled.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, token)) = &self.cancel_after {
                if handled >= *limit {
                    token.cancel();
                }
            }
            job * 2
        }

        fn panicked(&self, _job: u32, _message: String) -> u32 {
            0
        }
    }

    /// Panics on odd jobs.
    struct OddPanicker;

    #[async_trait]
    impl JobHandler for OddPanicker {
        type Job = u32;
        type Output = Result<u32, String>;

        async fn handle(
            &self,
            job: u32,
            _pacer: &mut Pacer,
            _cancel: &CancellationToken,
        ) -> Result<u32, String> {
            if job % 2 == 1 {
                panic!("odd job {job}");
            }
            Ok(job)
        }

        fn panicked(&self, job: u32, message: String) -> Result<u32, String> {
            Err(format!("{job}: {message}"))
        }
    }

    fn settings(workers: usize) -> PoolSettings {
        PoolSettings {
            workers,
            pacing: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn processes_every_job_across_partitions() {
        let handler = Arc::new(Doubler::new(Duration::from_millis(1)));
        let out = run_phase(
            handler,
            vec![vec![1, 2, 3], vec![], vec![4, 5]],
            settings(2),
            &CancellationToken::new(),
        )
        .await;
        let mut outputs = out.outputs;
        outputs.sort();
        assert_eq!(outputs, vec![2, 4, 6, 8, 10]);
        assert!(out.skipped.is_empty());
    }

    #[tokio::test]
    async fn concurrency_is_bounded_per_partition() {
        let handler = Arc::new(Doubler::new(Duration::from_millis(20)));
        let jobs: Vec<u32> = (0..12).collect();
        run_phase(
            Arc::clone(&handler),
            vec![jobs],
            settings(3),
            &CancellationToken::new(),
        )
        .await;
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancellation_leaves_queued_jobs_skipped() {
        let cancel = CancellationToken::new();
        let mut doubler = Doubler::new(Duration::from_millis(1));
        doubler.cancel_after = Some((2, cancel.clone()));
        let handler = Arc::new(doubler);
        let out = run_phase(
            Arc::clone(&handler),
            vec![(0..10).collect()],
            settings(1),
            &cancel,
        )
        .await;
        assert_eq!(out.outputs.len(), 2);
        assert_eq!(out.skipped, (2..10).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn panicking_job_is_reported_and_worker_continues() {
        let out = run_phase(
            Arc::new(OddPanicker),
            vec![vec![0, 1, 2, 3]],
            settings(1),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(
            out.outputs,
            vec![
                Ok(0),
                Err("1: odd job 1".to_string()),
                Ok(2),
                Err("3: odd job 3".to_string()),
            ]
        );
        assert!(out.skipped.is_empty());
    }

    #[tokio::test]
    async fn pre_cancelled_phase_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let handler = Arc::new(Doubler::new(Duration::ZERO));
        let out = run_phase(handler, vec![vec![1, 2]], settings(4), &cancel).await;
        assert!(out.outputs.is_empty());
        assert_eq!(out.skipped, vec![1, 2]);
    }
}
