use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Process-wide fallbacks used when a job leaves a limit unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDefaults {
    pub cpu_time_secs: u64,
    pub real_time_secs: u64,
    pub memory_mb: u64,
    pub file_size_bytes: u64,
    pub cpu_to_real_factor: u64,
}

impl Default for LimitDefaults {
    fn default() -> Self {
        Self {
            cpu_time_secs: 1,
            real_time_secs: 5,
            memory_mb: 64,
            file_size_bytes: 256 * MIB,
            cpu_to_real_factor: 3,
        }
    }
}

/// Logical limits as requested by a job or a compile stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub cpu_time_secs: Option<u64>,
    pub real_time_secs: Option<u64>,
    pub memory_mb: Option<u64>,
    pub file_size_bytes: Option<u64>,
}

impl Limits {
    pub fn new(cpu_time_secs: u64, memory_mb: u64, file_size_bytes: u64) -> Self {
        Self {
            cpu_time_secs: Some(cpu_time_secs),
            real_time_secs: None,
            memory_mb: Some(memory_mb),
            file_size_bytes: Some(file_size_bytes),
        }
    }

    #[cfg(test)]
    pub fn with_real_time(mut self, real_time_secs: u64) -> Self {
        self.real_time_secs = Some(real_time_secs);
        self
    }

    /// Fills unset fields from `defaults`. An entirely empty set of limits
    /// takes the defaults verbatim, including the default real time; otherwise
    /// real time is derived from cpu time unless it was given explicitly.
    pub fn resolve(&self, defaults: &LimitDefaults) -> ResolvedLimits {
        if *self == Limits::default() {
            return ResolvedLimits {
                cpu_time_secs: defaults.cpu_time_secs,
                real_time_secs: defaults.real_time_secs,
                memory_mb: defaults.memory_mb,
                file_size_bytes: defaults.file_size_bytes,
            };
        }

        let cpu_time_secs = self.cpu_time_secs.unwrap_or(defaults.cpu_time_secs);
        let real_time_secs = match self.real_time_secs {
            Some(explicit) => {
                if explicit < cpu_time_secs {
                    tracing::warn!(
                        real_time_secs = explicit,
                        cpu_time_secs,
                        "explicit real time is below cpu time"
                    );
                }
                explicit
            }
            None => cpu_time_secs.saturating_mul(defaults.cpu_to_real_factor),
        };

        ResolvedLimits {
            cpu_time_secs,
            real_time_secs,
            memory_mb: self.memory_mb.unwrap_or(defaults.memory_mb),
            file_size_bytes: self.file_size_bytes.unwrap_or(defaults.file_size_bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub cpu_time_secs: u64,
    pub real_time_secs: u64,
    pub memory_mb: u64,
    pub file_size_bytes: u64,
}

impl ResolvedLimits {
    pub fn constraints(&self) -> ResourceConstraints {
        let memory_bytes = to_i64(self.memory_mb.saturating_mul(MIB));
        let cpu = to_i64(self.cpu_time_secs);
        let fsize = to_i64(self.file_size_bytes);

        ResourceConstraints {
            real_time: Duration::from_secs(self.real_time_secs),
            memory: format!("{}m", self.memory_mb),
            memory_bytes,
            // memory+swap equal to memory leaves no room for swap
            memory_swap_bytes: memory_bytes,
            ulimits: vec![
                Ulimit {
                    name: "cpu",
                    soft: cpu,
                    hard: cpu,
                },
                Ulimit {
                    name: "fsize",
                    soft: fsize,
                    hard: fsize,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ulimit {
    pub name: &'static str,
    pub soft: i64,
    pub hard: i64,
}

/// Backend-facing descriptor produced from logical limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConstraints {
    pub real_time: Duration,
    pub memory: String,
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub ulimits: Vec<Ulimit>,
}

impl ResourceConstraints {
    #[cfg(test)]
    pub fn ulimit(&self, name: &str) -> Option<&Ulimit> {
        self.ulimits.iter().find(|u| u.name == name)
    }
}

pub fn translate(limits: &Limits, defaults: &LimitDefaults) -> ResourceConstraints {
    limits.resolve(defaults).constraints()
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
