use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{checker::CheckMethod, error::JudgeError, verdict::Verdict};

/// A submission to judge. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub source: String,
    pub language: String,
    pub test_case_id: String,
    pub time_limit_secs: u64,
    pub memory_limit_mb: u64,
    pub output_limit_bytes: u64,
    pub check_method: CheckMethod,
}

impl Job {
    pub fn volume_name(&self) -> String {
        format!("judge-{}", self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeRequest {
    #[serde(alias = "src_code")]
    pub source: String,
    pub language: String,
    pub test_case_id: String,
    /// Seconds of CPU time per test case.
    pub time_limit: u64,
    /// Megabytes.
    pub memory_limit: u64,
    /// Bytes the program may write; the server default applies when absent.
    #[serde(default, alias = "file_size_limit")]
    pub output_limit: Option<u64>,
    #[serde(default)]
    pub check_method: Option<String>,
}

impl JudgeRequest {
    pub fn into_job(self, default_output_limit: u64) -> Result<Job, JudgeError> {
        if self.source.trim().is_empty() {
            return Err(JudgeError::InvalidRequest("source is empty".into()));
        }
        if self.time_limit == 0 || self.memory_limit == 0 {
            return Err(JudgeError::InvalidRequest(
                "time_limit and memory_limit must be positive".into(),
            ));
        }
        if self.output_limit == Some(0) {
            return Err(JudgeError::InvalidRequest("output_limit must be positive".into()));
        }
        if !is_single_component(&self.test_case_id) {
            return Err(JudgeError::InvalidRequest(format!(
                "invalid test case id: {:?}",
                self.test_case_id
            )));
        }
        let check_method = match self.check_method.as_deref() {
            Some(raw) => raw.parse()?,
            None => CheckMethod::default(),
        };

        Ok(Job {
            id: Uuid::new_v4().simple().to_string(),
            source: self.source,
            language: self.language,
            test_case_id: self.test_case_id,
            time_limit_secs: self.time_limit,
            memory_limit_mb: self.memory_limit,
            output_limit_bytes: self.output_limit.unwrap_or(default_output_limit),
            check_method,
        })
    }
}

fn is_single_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileSummary {
    pub time_ms: Option<u64>,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseDetail {
    pub name: String,
    pub time_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    pub exit_code: Option<i64>,
    pub checker_exit_code: Option<i32>,
    /// Human label such as `OK` or `Time Limit Exceed`.
    pub verdict: String,
    pub input: String,
    pub output: String,
    pub answer: String,
    pub log: String,
}

impl CaseDetail {
    pub fn new(name: &str, verdict: Verdict) -> Self {
        Self {
            name: name.to_string(),
            time_ms: None,
            memory_kb: None,
            exit_code: None,
            checker_exit_code: None,
            verdict: verdict.label().to_string(),
            input: String::new(),
            output: String::new(),
            answer: String::new(),
            log: String::new(),
        }
    }

    pub fn timed(mut self, time_ms: Option<u64>, memory_kb: Option<u64>) -> Self {
        self.time_ms = time_ms;
        self.memory_kb = memory_kb;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeReport {
    pub status: Verdict,
    /// Operator diagnostics: raw exit codes and captured streams.
    pub info: String,
    /// Short user-facing message.
    pub message: String,
    pub time_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    pub compile_time_ms: Option<u64>,
    pub compile_exit_code: Option<i64>,
    pub details: Vec<CaseDetail>,
}
