//! Serial task queues.
//!
//! A queue runs boxed futures one at a time in FIFO order on a dedicated
//! worker task. Two queues never wait on each other, so work on different
//! queues may interleave at any await point.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

enum Job {
    Run(BoxFuture<'static, ()>),
    Drain(oneshot::Sender<()>),
}

/// FIFO executor for asynchronous steps.
pub struct TaskQueue {
    name: &'static str,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Run(task) => task.await,
                    Job::Drain(done) => {
                        let _ = done.send(());
                    }
                }
            }
            trace!(queue = name, "task queue stopped");
        });
        Self {
            name,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue `task` behind everything already queued.
    ///
    /// Returns false once the queue is closed.
    pub fn enqueue<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(Job::Run(task.boxed())).is_ok(),
            None => false,
        }
    }

    /// Wait until every task queued before this call has finished.
    pub async fn drain(&self) {
        let (done, wait) = oneshot::channel();
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(Job::Drain(done)).is_ok(),
            None => false,
        };
        if sent {
            let _ = wait.await;
            return;
        }
        // Closed: wait for the worker to run out its backlog.
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    /// Stop accepting work. Queued tasks still run.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.close();
    }
}
