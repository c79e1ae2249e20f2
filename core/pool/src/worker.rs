//! Worker threads and the messages they send back.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::debug;

use keepsync_common::Result;

pub(crate) type WorkerId = u64;
pub(crate) type TaskId = u64;

/// Code executed by pool workers.
///
/// A handler is shared by every worker but must not rely on shared mutable
/// state; inputs and outputs are moved across the thread boundary.
pub trait TaskHandler: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;
    type Progress: Send + 'static;

    /// Run one task to completion on the calling worker thread.
    fn run(&self, input: Self::Input, progress: &ProgressReporter<Self::Progress>)
        -> Result<Self::Output>;
}

/// Message from a worker to the supervisor.
pub(crate) enum WorkerEvent<O, P> {
    Progress {
        worker: WorkerId,
        task: TaskId,
        value: P,
    },
    Finished {
        worker: WorkerId,
        task: TaskId,
        result: Result<O>,
    },
    Crashed {
        worker: WorkerId,
    },
}

pub(crate) type EventSender<H> =
    mpsc::UnboundedSender<WorkerEvent<<H as TaskHandler>::Output, <H as TaskHandler>::Progress>>;

/// Lets a running task report intermediate progress.
pub struct ProgressReporter<P> {
    worker: WorkerId,
    task: TaskId,
    events: Box<dyn Fn(WorkerId, TaskId, P) + Send>,
}

impl<P> ProgressReporter<P> {
    /// Forward a progress value to the task's submitter.
    pub fn report(&self, value: P) {
        (self.events)(self.worker, self.task, value);
    }
}

/// Unit of work handed to a worker thread.
pub(crate) struct Job<I> {
    pub task: TaskId,
    pub input: I,
}

/// Supervisor-side end of a worker thread.
pub(crate) struct WorkerLink<I> {
    pub jobs: std_mpsc::Sender<Job<I>>,
}

/// Sends a crash notice if the worker thread unwinds.
struct ExitNotice<O: Send + 'static, P: Send + 'static> {
    worker: WorkerId,
    events: mpsc::UnboundedSender<WorkerEvent<O, P>>,
}

impl<O: Send + 'static, P: Send + 'static> Drop for ExitNotice<O, P> {
    fn drop(&mut self) {
        if thread::panicking() {
            let _ = self.events.send(WorkerEvent::Crashed {
                worker: self.worker,
            });
        }
    }
}

/// Spawn a worker thread running `handler`.
pub(crate) fn spawn_worker<H: TaskHandler>(
    worker: WorkerId,
    handler: Arc<H>,
    events: EventSender<H>,
) -> std::io::Result<WorkerLink<H::Input>> {
    let (jobs, job_rx) = std_mpsc::channel::<Job<H::Input>>();

    thread::Builder::new()
        .name(format!("keepsync-worker-{}", worker))
        .spawn(move || {
            let _notice = ExitNotice {
                worker,
                events: events.clone(),
            };

            while let Ok(job) = job_rx.recv() {
                let progress_events = events.clone();
                let reporter = ProgressReporter {
                    worker,
                    task: job.task,
                    events: Box::new(move |worker, task, value| {
                        let _ = progress_events.send(WorkerEvent::Progress {
                            worker,
                            task,
                            value,
                        });
                    }),
                };

                let result = handler.run(job.input, &reporter);
                let _ = events.send(WorkerEvent::Finished {
                    worker,
                    task: job.task,
                    result,
                });
            }

            debug!("Worker {} exiting", worker);
        })?;

    Ok(WorkerLink { jobs })
}
