use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use crate::engine::{
    limits::{LimitDefaults, Limits, translate},
    sandbox::{
        DataMount, ExecutionResult, SandboxController, SandboxError, SandboxRequest, SandboxSpec,
    },
    verdict::{Verdict, classify_result},
};

const PEAK_MEMORY_MARKER: &str = "Maximum resident";

/// One test case of one job, ready to be executed.
#[derive(Debug, Clone)]
pub struct CasePlan {
    pub job_id: String,
    pub index: usize,
    pub case: String,
    pub run_line: String,
    pub volume: String,
    pub data_dir: PathBuf,
    pub cpu_time_secs: u64,
    pub memory_mb: u64,
    pub output_limit_bytes: u64,
}

impl CasePlan {
    fn sandbox_name(&self, stage: &str) -> String {
        format!("{}-{stage}-{}", self.job_id, self.index)
    }

    /// Ceiling handed to the sandbox. Twice the declared limit so the
    /// instrumented run has headroom; verdicts still use the declared one.
    fn limits(&self) -> Limits {
        Limits::new(
            self.cpu_time_secs,
            self.memory_mb.saturating_mul(2),
            self.output_limit_bytes,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct CaseExecution {
    pub run: ExecutionResult,
    /// Tar archive holding the program's output file, if it wrote one.
    pub output: Option<Bytes>,
    /// Peak resident memory in KB, `None` when it could not be measured.
    pub peak_memory_kb: Option<u64>,
}

/// Runs a program on one test case and reports its exit facts, its output and
/// its peak memory.
#[async_trait]
pub trait CaseExecutor: Send + Sync {
    async fn execute(&self, plan: &CasePlan) -> Result<CaseExecution, SandboxError>;
}

/// Runs the program once for its verdict and output, then once more under
/// `/usr/bin/time -v` for peak memory. The second run only happens when the
/// first one passed, and a divergent second run is a known limitation.
pub struct TwoPassExecutor {
    controller: SandboxController,
    defaults: LimitDefaults,
    working_dir: String,
    data_target: String,
}

impl TwoPassExecutor {
    pub fn new(
        controller: SandboxController,
        defaults: LimitDefaults,
        working_dir: impl Into<String>,
        data_target: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            defaults,
            working_dir: working_dir.into(),
            data_target: data_target.into(),
        }
    }

    pub fn output_path(&self, plan: &CasePlan) -> String {
        format!(
            "{}/{}-{}.out",
            self.working_dir.trim_end_matches('/'),
            plan.job_id,
            plan.index
        )
    }

    fn input_path(&self, plan: &CasePlan) -> String {
        format!("{}/{}.in", self.data_target.trim_end_matches('/'), plan.case)
    }

    fn spec(&self, plan: &CasePlan, stage: &str, script: String) -> SandboxSpec {
        SandboxSpec {
            name: plan.sandbox_name(stage),
            command: vec!["/bin/bash".to_string(), "-c".to_string(), script],
            working_volume: plan.volume.clone(),
            working_dir: self.working_dir.clone(),
            data_mount: Some(DataMount {
                host_dir: plan.data_dir.clone(),
                target: self.data_target.clone(),
            }),
            constraints: translate(&plan.limits(), &self.defaults),
        }
    }

    fn functional_script(&self, plan: &CasePlan) -> String {
        format!(
            "{} < {} > {}",
            plan.run_line,
            shell_quote(&self.input_path(plan)),
            shell_quote(&self.output_path(plan))
        )
    }

    fn measurement_script(&self, plan: &CasePlan) -> String {
        // the program's stderr must not reach the report stream
        let inner = format!(
            "exec {} < {} > /dev/null 2> /dev/null",
            plan.run_line,
            shell_quote(&self.input_path(plan))
        );
        // without `sh -c` time reports the redirecting shell, not the program
        format!(
            "/usr/bin/time -v sh -c {} 2>&1 | grep '{PEAK_MEMORY_MARKER}'",
            shell_quote(&inner)
        )
    }

    async fn measure(&self, plan: &CasePlan) -> Result<Option<u64>, SandboxError> {
        let request = SandboxRequest::new(self.spec(plan, "measure", self.measurement_script(plan)));
        let result = self.controller.execute(request).await?.result;

        if result.exit_code != Some(0) {
            tracing::warn!(
                case = %plan.case,
                exit_code = ?result.exit_code,
                timed_out = result.timed_out,
                output = %result.combined_output(),
                "memory instrumentation failed"
            );
            return Ok(None);
        }

        let peak = parse_peak_memory(&result.stdout);
        if peak.is_none() {
            tracing::warn!(case = %plan.case, output = %result.stdout, "unreadable memory report");
        }
        Ok(peak)
    }
}

#[async_trait]
impl CaseExecutor for TwoPassExecutor {
    async fn execute(&self, plan: &CasePlan) -> Result<CaseExecution, SandboxError> {
        let request = SandboxRequest::new(self.spec(plan, "run", self.functional_script(plan)))
            .collecting(self.output_path(plan));
        let functional = self.controller.execute(request).await?;

        if classify_result(&functional.result) != Verdict::Accepted {
            return Ok(CaseExecution {
                run: functional.result,
                output: functional.collected,
                peak_memory_kb: None,
            });
        }

        let peak_memory_kb = self.measure(plan).await?;
        Ok(CaseExecution {
            run: functional.result,
            output: functional.collected,
            peak_memory_kb,
        })
    }
}

/// Reads the KB figure from the last `Maximum resident set size (kbytes): N`
/// line. `time` writes its report after the program has exited, so anything
/// earlier came from the program itself.
pub fn parse_peak_memory(report: &str) -> Option<u64> {
    report
        .lines()
        .rfind(|line| line.contains(PEAK_MEMORY_MARKER))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|value| value.trim().parse().ok())
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}
