use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;

use crate::engine::error::JudgeError;

const SNAPSHOT_LIMIT: usize = 64;
const SNAPSHOT_EDGE: usize = 30;
const DEFAULT_CHECKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Comparison protocols understood by the verifier binaries. The `N` variants
/// compare whole sequences of the scalar they are named after.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CheckMethod {
    /// Exact line-by-line comparison.
    File,
    /// Line comparison ignoring redundant whitespace.
    #[default]
    Line,
    YesNo,
    Int,
    Long,
    Huge,
    Double4,
    Double6,
    NYesNo,
    NInt,
    NLong,
    NHuge,
    NDouble4,
    NDouble6,
}

impl CheckMethod {
    pub const ALL: [CheckMethod; 14] = [
        CheckMethod::File,
        CheckMethod::Line,
        CheckMethod::YesNo,
        CheckMethod::Int,
        CheckMethod::Long,
        CheckMethod::Huge,
        CheckMethod::Double4,
        CheckMethod::Double6,
        CheckMethod::NYesNo,
        CheckMethod::NInt,
        CheckMethod::NLong,
        CheckMethod::NHuge,
        CheckMethod::NDouble4,
        CheckMethod::NDouble6,
    ];

    /// Also the file name of the verifier binary.
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckMethod::File => "file",
            CheckMethod::Line => "line",
            CheckMethod::YesNo => "yesno",
            CheckMethod::Int => "int",
            CheckMethod::Long => "long",
            CheckMethod::Huge => "huge",
            CheckMethod::Double4 => "double4",
            CheckMethod::Double6 => "double6",
            CheckMethod::NYesNo => "nyesno",
            CheckMethod::NInt => "nint",
            CheckMethod::NLong => "nlong",
            CheckMethod::NHuge => "nhuge",
            CheckMethod::NDouble4 => "ndouble4",
            CheckMethod::NDouble6 => "ndouble6",
        }
    }
}

impl FromStr for CheckMethod {
    type Err = JudgeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_lowercase();
        CheckMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == wanted)
            .ok_or_else(|| JudgeError::UnknownCheckMethod(raw.to_string()))
    }
}

impl fmt::Display for CheckMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckerReport {
    /// `None` when the verifier was killed by a signal.
    pub exit_code: Option<i32>,
    pub log: String,
    pub input: String,
    pub output: String,
    pub answer: String,
}

#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(
        &self,
        input: &Path,
        output: &Path,
        answer: &Path,
        method: CheckMethod,
    ) -> Result<CheckerReport, JudgeError>;
}

/// Runs `<dir>/<method> <input> <output> <answer>` on the host. A verifier
/// still running after `timeout` is killed and reported without an exit code.
pub struct ExternalChecker {
    dir: PathBuf,
    timeout: Duration,
}

impl ExternalChecker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            timeout: DEFAULT_CHECKER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self, method: CheckMethod) -> PathBuf {
        self.dir.join(method.as_str())
    }
}

#[async_trait]
impl Checker for ExternalChecker {
    async fn check(
        &self,
        input: &Path,
        output: &Path,
        answer: &Path,
        method: CheckMethod,
    ) -> Result<CheckerReport, JudgeError> {
        let binary = self.binary(method);
        let mut command = Command::new(&binary);
        command.arg(input).arg(output).arg(answer).kill_on_drop(true);

        let (exit_code, log) = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(finished) => {
                let result = finished.map_err(|source| JudgeError::CheckerUnavailable {
                    method: method.to_string(),
                    source,
                })?;
                let mut log = String::from_utf8_lossy(&result.stdout).into_owned();
                log.push_str(&String::from_utf8_lossy(&result.stderr));
                (result.status.code(), log.trim_end_matches('\n').to_string())
            }
            Err(_elapsed) => {
                tracing::warn!(%method, timeout = ?self.timeout, "checker timed out");
                (None, format!("checker timed out after {:?}", self.timeout))
            }
        };
        tracing::debug!(%method, ?exit_code, log = %log, "checker finished");

        Ok(CheckerReport {
            exit_code,
            log,
            input: snapshot(input).await,
            output: snapshot(output).await,
            answer: snapshot(answer).await,
        })
    }
}

/// Shortens long text to its first and last 30 characters.
pub fn compress(text: &str) -> String {
    let count = text.chars().count();
    if count <= SNAPSHOT_LIMIT {
        return text.to_string();
    }
    let head: String = text.chars().take(SNAPSHOT_EDGE).collect();
    let tail: String = text.chars().skip(count - SNAPSHOT_EDGE).collect();
    format!("{head}...{tail}")
}

pub async fn snapshot(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => compress(&String::from_utf8_lossy(&bytes)),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read snapshot");
            String::new()
        }
    }
}
