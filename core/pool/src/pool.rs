//! Task pool supervisor.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use keepsync_common::{Error, Result};

use crate::worker::{
    spawn_worker, EventSender, Job, TaskHandler, TaskId, WorkerEvent, WorkerId, WorkerLink,
};

type ProgressCallback<P> = Box<dyn Fn(P) + Send>;

/// Counters describing the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live workers.
    pub workers: usize,
    /// Workers waiting for a task.
    pub idle: usize,
    /// Workers running a task.
    pub busy: usize,
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks that finished, successfully or not.
    pub completed: u64,
    /// Workers replaced after a crash.
    pub crashed: u64,
}

/// A task waiting for, or running on, a worker.
struct PendingTask<H: TaskHandler> {
    input: H::Input,
    respond: oneshot::Sender<Result<H::Output>>,
    on_progress: Option<ProgressCallback<H::Progress>>,
}

/// Resolution half of a task kept by the supervisor while a worker runs it.
struct RunningTask<H: TaskHandler> {
    id: TaskId,
    respond: oneshot::Sender<Result<H::Output>>,
    on_progress: Option<ProgressCallback<H::Progress>>,
}

struct WorkerSlot<H: TaskHandler> {
    link: WorkerLink<H::Input>,
    running: Option<RunningTask<H>>,
}

enum Command<H: TaskHandler> {
    Submit(PendingTask<H>),
    Stats(oneshot::Sender<PoolStats>),
    Terminate(oneshot::Sender<()>),
}

/// Fixed-size pool of worker threads running `H`.
///
/// Tasks go to an idle worker when one exists and otherwise wait in FIFO
/// order. Must be created inside a tokio runtime.
pub struct TaskPool<H: TaskHandler> {
    commands: mpsc::UnboundedSender<Command<H>>,
    size: usize,
}

/// Pending result of a submitted task.
pub struct TaskTicket<O> {
    response: oneshot::Receiver<Result<O>>,
}

impl<O> TaskTicket<O> {
    /// Wait for the task to resolve.
    ///
    /// # Errors
    /// - Whatever the handler returned
    /// - `WorkerCrashed` if the worker died while running the task
    /// - `PoolTerminated` if the pool shut down first
    pub async fn wait(self) -> Result<O> {
        self.response.await.map_err(|_| Error::PoolTerminated)?
    }
}

impl<H: TaskHandler> TaskPool<H> {
    /// Spawn `size` workers running `handler`.
    ///
    /// # Errors
    /// - `InvalidInput` if `size` is zero
    /// - `Io` if a worker thread cannot be spawned
    pub fn new(size: usize, handler: H) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidInput(
                "Task pool needs at least one worker".to_string(),
            ));
        }

        let handler = Arc::new(handler);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let mut supervisor = Supervisor {
            handler,
            events_tx,
            workers: HashMap::new(),
            idle: VecDeque::new(),
            queue: VecDeque::new(),
            next_worker: 0,
            next_task: 0,
            completed: 0,
            crashed: 0,
        };
        for _ in 0..size {
            supervisor.spawn_worker()?;
        }

        info!("Task pool started with {} workers", size);
        tokio::spawn(supervisor.run(commands_rx, events_rx));

        Ok(Self { commands, size })
    }

    /// Configured number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a task and return a ticket for its result.
    pub fn submit(&self, input: H::Input) -> TaskTicket<H::Output> {
        self.submit_task(input, None)
    }

    /// Queue a task whose progress reports are passed to `on_progress`.
    pub fn submit_with_progress<F>(&self, input: H::Input, on_progress: F) -> TaskTicket<H::Output>
    where
        F: Fn(H::Progress) + Send + 'static,
    {
        self.submit_task(input, Some(Box::new(on_progress)))
    }

    fn submit_task(
        &self,
        input: H::Input,
        on_progress: Option<ProgressCallback<H::Progress>>,
    ) -> TaskTicket<H::Output> {
        let (respond, response) = oneshot::channel();
        let task = PendingTask {
            input,
            respond,
            on_progress,
        };
        // On failure the task is dropped with its sender, so the ticket
        // resolves to `PoolTerminated`.
        let _ = self.commands.send(Command::Submit(task));
        TaskTicket { response }
    }

    /// Run a task and wait for its result.
    pub async fn execute(&self, input: H::Input) -> Result<H::Output> {
        self.submit(input).wait().await
    }

    /// Run a task, forwarding progress reports, and wait for its result.
    pub async fn execute_with_progress<F>(&self, input: H::Input, on_progress: F) -> Result<H::Output>
    where
        F: Fn(H::Progress) + Send + 'static,
    {
        self.submit_with_progress(input, on_progress).wait().await
    }

    /// Current pool counters.
    pub async fn stats(&self) -> Result<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| Error::PoolTerminated)?;
        rx.await.map_err(|_| Error::PoolTerminated)
    }

    /// Stop all workers and reject queued tasks.
    ///
    /// Workers finish the task they are running before their thread exits,
    /// but those results are discarded.
    pub async fn terminate(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Terminate(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct Supervisor<H: TaskHandler> {
    handler: Arc<H>,
    events_tx: EventSender<H>,
    workers: HashMap<WorkerId, WorkerSlot<H>>,
    idle: VecDeque<WorkerId>,
    queue: VecDeque<(TaskId, PendingTask<H>)>,
    next_worker: WorkerId,
    next_task: TaskId,
    completed: u64,
    crashed: u64,
}

impl<H: TaskHandler> Supervisor<H> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<H>>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent<H::Output, H::Progress>>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Submit(task)) => {
                        let id = self.next_task;
                        self.next_task += 1;
                        self.queue.push_back((id, task));
                        self.dispatch();
                    }
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(Command::Terminate(done)) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },

                Some(event) = events.recv() => self.handle_event(event),
            }
        }
    }

    fn spawn_worker(&mut self) -> Result<WorkerId> {
        let id = self.next_worker;
        self.next_worker += 1;

        let link = spawn_worker(id, self.handler.clone(), self.events_tx.clone())?;
        self.workers.insert(id, WorkerSlot { link, running: None });
        self.idle.push_back(id);
        debug!("Spawned worker {}", id);
        Ok(id)
    }

    /// Hand queued tasks to idle workers, oldest first.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(worker) = self.idle.pop_front() else {
                break;
            };
            let Some((task_id, task)) = self.queue.pop_front() else {
                self.idle.push_front(worker);
                break;
            };
            let Some(slot) = self.workers.get_mut(&worker) else {
                self.queue.push_front((task_id, task));
                continue;
            };

            let PendingTask {
                input,
                respond,
                on_progress,
            } = task;

            match slot.link.jobs.send(Job {
                task: task_id,
                input,
            }) {
                Ok(()) => {
                    debug!("Dispatched task {} to worker {}", task_id, worker);
                    slot.running = Some(RunningTask {
                        id: task_id,
                        respond,
                        on_progress,
                    });
                }
                Err(returned) => {
                    // The thread is gone; its crash notice will replace it.
                    warn!("Worker {} is not accepting tasks", worker);
                    self.queue.push_front((
                        task_id,
                        PendingTask {
                            input: returned.0.input,
                            respond,
                            on_progress,
                        },
                    ));
                }
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent<H::Output, H::Progress>) {
        match event {
            WorkerEvent::Progress {
                worker,
                task,
                value,
            } => {
                let running = self
                    .workers
                    .get(&worker)
                    .and_then(|slot| slot.running.as_ref())
                    .filter(|running| running.id == task);
                if let Some(callback) = running.and_then(|r| r.on_progress.as_ref()) {
                    callback(value);
                }
            }
            WorkerEvent::Finished {
                worker,
                task,
                result,
            } => {
                let Some(slot) = self.workers.get_mut(&worker) else {
                    return;
                };
                match slot.running.take() {
                    Some(running) if running.id == task => {
                        let _ = running.respond.send(result);
                    }
                    other => {
                        warn!("Worker {} finished unknown task {}", worker, task);
                        slot.running = other;
                    }
                }
                self.completed += 1;
                self.idle.push_back(worker);
                self.dispatch();
            }
            WorkerEvent::Crashed { worker } => {
                self.crashed += 1;
                self.idle.retain(|id| *id != worker);
                if let Some(slot) = self.workers.remove(&worker) {
                    if let Some(running) = slot.running {
                        error!("Worker {} crashed while running task {}", worker, running.id);
                        self.completed += 1;
                        let _ = running.respond.send(Err(Error::WorkerCrashed(format!(
                            "worker {} terminated abnormally",
                            worker
                        ))));
                    } else {
                        error!("Worker {} crashed while idle", worker);
                    }
                }

                match self.spawn_worker() {
                    Ok(replacement) => info!("Replaced worker {} with {}", worker, replacement),
                    Err(e) => error!("Failed to replace worker {}: {}", worker, e),
                }
                self.dispatch();
            }
        }
    }

    fn stats(&self) -> PoolStats {
        let busy = self
            .workers
            .values()
            .filter(|slot| slot.running.is_some())
            .count();
        PoolStats {
            workers: self.workers.len(),
            idle: self.idle.len(),
            busy,
            queued: self.queue.len(),
            completed: self.completed,
            crashed: self.crashed,
        }
    }

    /// Drop every worker link and reject queued tasks.
    fn shutdown(&mut self) {
        let queued = self.queue.len();
        for (_, task) in self.queue.drain(..) {
            let _ = task.respond.send(Err(Error::PoolTerminated));
        }
        for (_, slot) in self.workers.drain() {
            if let Some(running) = slot.running {
                let _ = running.respond.send(Err(Error::PoolTerminated));
            }
        }
        self.idle.clear();
        info!("Task pool terminated ({} queued tasks rejected)", queued);
    }
}
