use std::sync::Arc;

use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender, error::TrySendError},
    oneshot,
};

use crate::engine::{
    error::JudgeError,
    metrics::MetricsRegistry,
    models::{Job, JudgeReport},
};

pub type JudgeReply = oneshot::Sender<Result<JudgeReport, JudgeError>>;

#[derive(Debug)]
pub struct QueuedJob {
    pub job: Job,
    pub reply: JudgeReply,
}

#[derive(Clone)]
pub struct Scheduler {
    sender: Sender<QueuedJob>,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    metrics: Arc<MetricsRegistry>,
}

impl Scheduler {
    pub fn new(capacity: usize, metrics: Arc<MetricsRegistry>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            metrics,
        }
    }

    /// Enqueues a job and hands back the channel its report arrives on.
    /// A full queue is rejected instead of waited on.
    pub fn submit(
        &self,
        job: Job,
    ) -> Result<oneshot::Receiver<Result<JudgeReport, JudgeError>>, JudgeError> {
        let (reply, report) = oneshot::channel();
        self.sender
            .try_send(QueuedJob { job, reply })
            .map_err(|err| match err {
                TrySendError::Full(_) => JudgeError::QueueFull,
                TrySendError::Closed(_) => JudgeError::QueueClosed,
            })?;
        self.metrics.submitted();
        Ok(report)
    }

    pub fn receiver(&self) -> Arc<Mutex<Receiver<QueuedJob>>> {
        self.receiver.clone()
    }
}
