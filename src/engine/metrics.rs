use std::{
    fmt::Write,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::engine::verdict::Verdict;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    started_total: AtomicU64,
    completed_total: AtomicU64,
    infrastructure_errors_total: AtomicU64,
    queue_depth: AtomicU64,
    verdicts: [AtomicU64; Verdict::ALL.len()],
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) {
        self.started_total.fetch_add(1, Ordering::Relaxed);
        self.decrement_queue_depth();
    }

    pub fn completed(&self, verdict: Verdict) {
        self.completed_total.fetch_add(1, Ordering::Relaxed);
        self.verdicts[verdict_slot(verdict)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn infrastructure_error(&self) {
        self.infrastructure_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = format!(
            concat!(
                "# TYPE judge_submitted_total counter\n",
                "judge_submitted_total {}\n",
                "# TYPE judge_started_total counter\n",
                "judge_started_total {}\n",
                "# TYPE judge_completed_total counter\n",
                "judge_completed_total {}\n",
                "# TYPE judge_infrastructure_errors_total counter\n",
                "judge_infrastructure_errors_total {}\n",
                "# TYPE judge_queue_depth gauge\n",
                "judge_queue_depth {}\n",
                "# TYPE judge_verdicts_total counter\n",
            ),
            self.submitted_total.load(Ordering::Relaxed),
            self.started_total.load(Ordering::Relaxed),
            self.completed_total.load(Ordering::Relaxed),
            self.infrastructure_errors_total.load(Ordering::Relaxed),
            self.queue_depth.load(Ordering::Relaxed),
        );
        for verdict in Verdict::ALL {
            let _ = writeln!(
                out,
                "judge_verdicts_total{{verdict=\"{}\"}} {}",
                verdict.code(),
                self.verdicts[verdict_slot(verdict)].load(Ordering::Relaxed)
            );
        }
        out
    }

    fn decrement_queue_depth(&self) {
        let mut current = self.queue_depth.load(Ordering::Relaxed);
        while current > 0 {
            match self.queue_depth.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

fn verdict_slot(verdict: Verdict) -> usize {
    Verdict::ALL
        .iter()
        .position(|candidate| *candidate == verdict)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_depth_does_not_underflow() {
        let metrics = MetricsRegistry::new();
        metrics.started();
        assert!(metrics.render_prometheus().contains("judge_queue_depth 0"));
    }

    #[test]
    fn counts_verdicts_separately() {
        let metrics = MetricsRegistry::new();
        metrics.submitted();
        metrics.started();
        metrics.completed(Verdict::Accepted);
        metrics.completed(Verdict::Accepted);
        metrics.completed(Verdict::TimeLimitExceeded);
        metrics.infrastructure_error();

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("judge_completed_total 3"));
        assert!(rendered.contains("judge_verdicts_total{verdict=\"AC\"} 2"));
        assert!(rendered.contains("judge_verdicts_total{verdict=\"TLE\"} 1"));
        assert!(rendered.contains("judge_verdicts_total{verdict=\"JF\"} 0"));
        assert!(rendered.contains("judge_infrastructure_errors_total 1"));
    }
}
