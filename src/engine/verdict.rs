//! Decision tables that turn raw stage facts into verdicts.
//!
//! Run classification priority, first match wins:
//!
//! 1. exit code 153 (`128 + SIGXFSZ`, output ulimit hit) → OLE
//! 2. killed by the kernel OOM reaper → MLE
//! 3. real-time deadline elapsed, or killed by SIGKILL/SIGXCPU without an
//!    OOM report (cpu ulimit or external kill) → TLE
//! 4. any other non-zero exit → RE
//! 5. zero exit → AC (the stage passed)
//!
//! Checker exit codes: 0 → AC, 1 → WA, 2 → PE, anything else → JudgementFailed.

use serde::{Deserialize, Serialize};

use crate::engine::{
    models::{CaseDetail, CompileSummary, JudgeReport},
    sandbox::ExecutionResult,
};

pub const FILE_SIZE_LIMIT_EXIT_CODE: i64 = 128 + SIGXFSZ;

const SIGNAL_EXIT_BASE: i64 = 128;
const SIGKILL: i64 = 9;
const SIGXCPU: i64 = 24;
const SIGXFSZ: i64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "PE")]
    PresentationError,
    #[serde(rename = "CE")]
    CompileError,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "OLE")]
    OutputLimitExceeded,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "JF")]
    JudgementFailed,
}

impl Verdict {
    pub const ALL: [Verdict; 9] = [
        Verdict::Accepted,
        Verdict::WrongAnswer,
        Verdict::PresentationError,
        Verdict::CompileError,
        Verdict::TimeLimitExceeded,
        Verdict::MemoryLimitExceeded,
        Verdict::OutputLimitExceeded,
        Verdict::RuntimeError,
        Verdict::JudgementFailed,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::PresentationError => "PE",
            Verdict::CompileError => "CE",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::MemoryLimitExceeded => "MLE",
            Verdict::OutputLimitExceeded => "OLE",
            Verdict::RuntimeError => "RE",
            Verdict::JudgementFailed => "JF",
        }
    }

    /// Label shown in per-test details.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Accepted => "OK",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::PresentationError => "Presentation Error",
            Verdict::CompileError => "Compile Error",
            Verdict::TimeLimitExceeded => "Time Limit Exceed",
            Verdict::MemoryLimitExceeded => "Memory Limit Exceed",
            Verdict::OutputLimitExceeded => "Output Limit Exceed",
            Verdict::RuntimeError => "Runtime Error",
            Verdict::JudgementFailed => "Judgement Failed",
        }
    }
}

pub fn killed_by_limit_signal(exit_code: i64) -> bool {
    matches!(exit_code - SIGNAL_EXIT_BASE, SIGKILL | SIGXCPU)
}

pub fn classify_run(exit_code: Option<i64>, oom_killed: bool, timed_out: bool) -> Verdict {
    if exit_code == Some(FILE_SIZE_LIMIT_EXIT_CODE) {
        return Verdict::OutputLimitExceeded;
    }
    if oom_killed {
        return Verdict::MemoryLimitExceeded;
    }
    if timed_out || exit_code.is_some_and(killed_by_limit_signal) {
        return Verdict::TimeLimitExceeded;
    }
    match exit_code {
        Some(0) => Verdict::Accepted,
        _ => Verdict::RuntimeError,
    }
}

pub fn classify_result(result: &ExecutionResult) -> Verdict {
    classify_run(result.exit_code, result.oom_killed, result.timed_out)
}

pub fn checker_verdict(exit_code: Option<i32>) -> Verdict {
    match exit_code {
        Some(0) => Verdict::Accepted,
        Some(1) => Verdict::WrongAnswer,
        Some(2) => Verdict::PresentationError,
        _ => Verdict::JudgementFailed,
    }
}

/// Why the pipeline stopped: a user-facing message and operator diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub verdict: Verdict,
    pub message: String,
    pub info: String,
}

impl StageFailure {
    pub fn compile(result: &ExecutionResult) -> Self {
        let message = if result.timed_out {
            "Compilation timed out".to_string()
        } else {
            "Compilation failed".to_string()
        };
        Self {
            verdict: Verdict::CompileError,
            message,
            info: result.combined_output(),
        }
    }

    pub fn run(verdict: Verdict, case: &str, limits: &CaseLimits, result: &ExecutionResult) -> Self {
        let message = match verdict {
            Verdict::OutputLimitExceeded => format!(
                "Output limit exceeded on test {case} ({} bytes)",
                limits.output_bytes
            ),
            Verdict::MemoryLimitExceeded => format!(
                "Memory limit exceeded on test {case} ({} MB)",
                limits.memory_mb
            ),
            Verdict::TimeLimitExceeded => format!(
                "Time limit exceeded on test {case} ({} s)",
                limits.time_secs
            ),
            _ => format!("Runtime error on test {case}"),
        };
        let info = format!(
            "exit code: {:?}, oom killed: {}, timed out: {}, output: {}",
            result.exit_code,
            result.oom_killed,
            result.timed_out,
            result.combined_output()
        );
        Self {
            verdict,
            message,
            info,
        }
    }

    pub fn memory(case: &str, limits: &CaseLimits, measured_kb: u64) -> Self {
        Self {
            verdict: Verdict::MemoryLimitExceeded,
            message: format!(
                "Memory limit exceeded on test {case} ({} MB)",
                limits.memory_mb
            ),
            info: format!(
                "peak resident memory {measured_kb} KB, limit {} KB",
                limits.memory_kb()
            ),
        }
    }

    pub fn checker(
        verdict: Verdict,
        case: &str,
        method: &str,
        data_dir: &str,
        exit_code: Option<i32>,
        log: &str,
    ) -> Self {
        let message = match verdict {
            Verdict::WrongAnswer => format!("Wrong answer on test {case}"),
            Verdict::PresentationError => format!("Presentation error on test {case}"),
            _ => format!("Judgement failed on test {case}"),
        };
        let info = match verdict {
            Verdict::JudgementFailed => format!(
                "checker {method} exited with {exit_code:?} on {data_dir}/{case}: {log}"
            ),
            _ => log.to_string(),
        };
        Self {
            verdict,
            message,
            info,
        }
    }
}

/// Limits a test case is judged against, as declared by the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaseLimits {
    pub time_secs: u64,
    pub memory_mb: u64,
    pub output_bytes: u64,
}

impl CaseLimits {
    pub fn memory_kb(&self) -> u64 {
        self.memory_mb.saturating_mul(1024)
    }

    pub fn memory_exceeded(&self, measured_kb: u64) -> bool {
        measured_kb >= self.memory_kb()
    }
}

/// Folds per-test outcomes into the job report.
#[derive(Debug, Default)]
pub struct Scorecard {
    details: Vec<CaseDetail>,
    max_time_ms: Option<u64>,
    max_memory_kb: Option<u64>,
}

impl Scorecard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passed(&mut self, detail: CaseDetail) {
        self.max_time_ms = max_option(self.max_time_ms, detail.time_ms);
        self.max_memory_kb = max_option(self.max_memory_kb, detail.memory_kb);
        self.details.push(detail);
    }

    pub fn accepted(self, compile: CompileSummary) -> JudgeReport {
        JudgeReport {
            status: Verdict::Accepted,
            info: String::new(),
            message: "Accepted".to_string(),
            time_ms: self.max_time_ms,
            memory_kb: self.max_memory_kb,
            compile_time_ms: compile.time_ms,
            compile_exit_code: compile.exit_code,
            details: self.details,
        }
    }

    pub fn failed(
        mut self,
        failure: StageFailure,
        detail: Option<CaseDetail>,
        compile: CompileSummary,
    ) -> JudgeReport {
        self.details.extend(detail);
        JudgeReport {
            status: failure.verdict,
            info: failure.info,
            message: failure.message,
            time_ms: self.max_time_ms,
            memory_kb: self.max_memory_kb,
            compile_time_ms: compile.time_ms,
            compile_exit_code: compile.exit_code,
            details: self.details,
        }
    }
}

fn max_option(current: Option<u64>, candidate: Option<u64>) -> Option<u64> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_table_respects_priority() {
        assert_eq!(classify_run(Some(153), false, false), Verdict::OutputLimitExceeded);
        assert_eq!(classify_run(Some(153), true, true), Verdict::OutputLimitExceeded);
        assert_eq!(classify_run(Some(137), true, false), Verdict::MemoryLimitExceeded);
        assert_eq!(classify_run(Some(137), false, false), Verdict::TimeLimitExceeded);
        assert_eq!(classify_run(Some(152), false, false), Verdict::TimeLimitExceeded);
        assert_eq!(classify_run(None, false, true), Verdict::TimeLimitExceeded);
        assert_eq!(classify_run(Some(0), true, false), Verdict::MemoryLimitExceeded);
        assert_eq!(classify_run(Some(1), false, false), Verdict::RuntimeError);
        assert_eq!(classify_run(Some(139), false, false), Verdict::RuntimeError);
        assert_eq!(classify_run(Some(0), false, false), Verdict::Accepted);
    }

    #[test]
    fn only_kill_and_cpu_signals_count_as_limits() {
        assert!(killed_by_limit_signal(137));
        assert!(killed_by_limit_signal(152));
        assert!(!killed_by_limit_signal(153));
        assert!(!killed_by_limit_signal(9));
        assert!(!killed_by_limit_signal(0));
    }

    #[test]
    fn checker_codes_map_to_verdicts() {
        assert_eq!(checker_verdict(Some(0)), Verdict::Accepted);
        assert_eq!(checker_verdict(Some(1)), Verdict::WrongAnswer);
        assert_eq!(checker_verdict(Some(2)), Verdict::PresentationError);
        assert_eq!(checker_verdict(Some(3)), Verdict::JudgementFailed);
        assert_eq!(checker_verdict(Some(127)), Verdict::JudgementFailed);
        assert_eq!(checker_verdict(None), Verdict::JudgementFailed);
    }

    #[test]
    fn labels_and_codes_are_distinct() {
        let labels: std::collections::HashSet<_> = Verdict::ALL.iter().map(|v| v.label()).collect();
        let codes: std::collections::HashSet<_> = Verdict::ALL.iter().map(|v| v.code()).collect();
        assert_eq!(labels.len(), Verdict::ALL.len());
        assert_eq!(codes.len(), Verdict::ALL.len());
        assert_eq!(Verdict::TimeLimitExceeded.label(), "Time Limit Exceed");
        assert_eq!(Verdict::Accepted.label(), "OK");
    }

    #[test]
    fn serializes_short_codes() {
        let json = serde_json::to_string(&Verdict::MemoryLimitExceeded).unwrap();
        assert_eq!(json, "\"MLE\"");
    }

    #[test]
    fn memory_limit_is_inclusive() {
        let limits = CaseLimits {
            time_secs: 1,
            memory_mb: 64,
            output_bytes: 1024,
        };
        assert!(limits.memory_exceeded(64 * 1024));
        assert!(!limits.memory_exceeded(64 * 1024 - 1));
    }

    #[test]
    fn judgement_failure_names_method_and_data() {
        let failure = StageFailure::checker(
            Verdict::JudgementFailed,
            "3",
            "nint",
            "/srv/data/7",
            Some(3),
            "FAIL bad input",
        );
        assert!(failure.info.contains("nint"));
        assert!(failure.info.contains("/srv/data/7/3"));
        assert_eq!(failure.message, "Judgement failed on test 3");
    }

    #[test]
    fn scorecard_keeps_running_maxima() {
        let mut card = Scorecard::new();
        card.passed(CaseDetail::new("1", Verdict::Accepted).timed(Some(30), Some(900)));
        card.passed(CaseDetail::new("2", Verdict::Accepted).timed(Some(10), Some(2048)));
        card.passed(CaseDetail::new("3", Verdict::Accepted).timed(None, None));

        let report = card.accepted(CompileSummary::default());
        assert_eq!(report.time_ms, Some(30));
        assert_eq!(report.memory_kb, Some(2048));
        assert_eq!(report.details.len(), 3);
    }
}
