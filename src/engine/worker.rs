use std::sync::Arc;

use tokio::sync::{Mutex, mpsc::Receiver};

use crate::engine::{metrics::MetricsRegistry, pipeline::JudgePipeline, queue::QueuedJob};

pub fn spawn_worker_pool(
    workers: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    pipeline: Arc<JudgePipeline>,
    metrics: Arc<MetricsRegistry>,
) {
    for worker_id in 0..workers {
        let receiver = receiver.clone();
        let pipeline = pipeline.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            worker_loop(worker_id, receiver, pipeline, metrics).await;
        });
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    pipeline: Arc<JudgePipeline>,
    metrics: Arc<MetricsRegistry>,
) {
    loop {
        let queued = {
            let mut locked = receiver.lock().await;
            locked.recv().await
        };
        let Some(QueuedJob { job, reply }) = queued else {
            tracing::info!(worker_id, "job queue closed, worker exiting");
            break;
        };

        tracing::info!(
            worker_id,
            job_id = %job.id,
            language = %job.language,
            test_case_id = %job.test_case_id,
            "judging"
        );
        metrics.started();

        let outcome = pipeline.judge(&job).await;
        match &outcome {
            Ok(report) => {
                metrics.completed(report.status);
                tracing::info!(
                    worker_id,
                    job_id = %job.id,
                    status = report.status.code(),
                    time_ms = ?report.time_ms,
                    memory_kb = ?report.memory_kb,
                    "judged"
                );
            }
            Err(err) => {
                metrics.infrastructure_error();
                tracing::error!(worker_id, job_id = %job.id, error = %err, "judging failed");
            }
        }

        if reply.send(outcome).is_err() {
            tracing::warn!(worker_id, job_id = %job.id, "submitter went away before the report");
        }
    }
}
