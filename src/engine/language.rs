use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::engine::{error::JudgeError, limits::Limits};

const COMPILE_CPU_SECS: u64 = 5;

/// How one language is compiled and run. Commands are templates over
/// `{src_path}`, `{exe_path}` and `{max_memory}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub name: String,
    pub suffix: String,
    /// Suffix of the compiled artifact; interpreted languages run the source.
    #[serde(default)]
    pub exe_suffix: String,
    pub compile_command: String,
    pub run_command: String,
    #[serde(default = "default_compile_cpu_secs")]
    pub compile_cpu_secs: u64,
    pub compile_memory_mb: u64,
}

fn default_compile_cpu_secs() -> u64 {
    COMPILE_CPU_SECS
}

impl LanguageSpec {
    fn builtin(
        name: &str,
        suffix: &str,
        exe_suffix: &str,
        compile_memory_mb: u64,
        compile_command: &str,
        run_command: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            suffix: suffix.to_string(),
            exe_suffix: exe_suffix.to_string(),
            compile_command: compile_command.to_string(),
            run_command: run_command.to_string(),
            compile_cpu_secs: COMPILE_CPU_SECS,
            compile_memory_mb,
        }
    }

    pub fn source_path(&self, work_dir: &str, stem: &str) -> String {
        join(work_dir, &format!("{stem}{}", self.suffix))
    }

    pub fn exe_path(&self, work_dir: &str, stem: &str) -> String {
        join(work_dir, &format!("{stem}{}", self.exe_suffix))
    }

    pub fn compile_line(&self, src_path: &str, exe_path: &str) -> String {
        render_template(&self.compile_command, src_path, exe_path, None)
    }

    pub fn run_line(&self, src_path: &str, exe_path: &str, memory_mb: u64) -> String {
        render_template(&self.run_command, src_path, exe_path, Some(memory_mb))
    }

    pub fn compile_limits(&self, file_size_bytes: u64) -> Limits {
        Limits::new(self.compile_cpu_secs, self.compile_memory_mb, file_size_bytes)
    }
}

/// Replaces the known placeholders and leaves any other braces alone.
pub fn render_template(
    template: &str,
    src_path: &str,
    exe_path: &str,
    memory_mb: Option<u64>,
) -> String {
    let rendered = template
        .replace("{src_path}", src_path)
        .replace("{exe_path}", exe_path);
    match memory_mb {
        Some(mb) => rendered.replace("{max_memory}", &format!("{mb}M")),
        None => rendered,
    }
}

fn join(dir: &str, file: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), file)
}

#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    languages: BTreeMap<String, LanguageSpec>,
}

impl LanguageRegistry {
    pub fn builtin() -> Self {
        Self::from_specs(vec![
            LanguageSpec::builtin(
                "C",
                ".c",
                "",
                128,
                "/usr/bin/gcc -DONLINE_JUDGE -O2 -w -fmax-errors=3 -std=c99 {src_path} -lm -o {exe_path}",
                "{exe_path}",
            ),
            LanguageSpec::builtin(
                "C++",
                ".cpp",
                "",
                256,
                "/usr/bin/g++ -DONLINE_JUDGE -O2 -w -fmax-errors=3 -std=c++11 {src_path} -lm -o {exe_path}",
                "{exe_path}",
            ),
            LanguageSpec::builtin(
                "Java",
                ".java",
                "",
                512,
                "/usr/bin/javac {src_path} -d {exe_path} -encoding UTF8",
                "/usr/bin/java -cp {exe_path} -Xss1M -Xms16M -Xmx{max_memory} \
                 -Djava.security.manager -Djava.security.policy==policy \
                 -Djava.awt.headless=true Main",
            ),
            LanguageSpec::builtin(
                "Python",
                ".py",
                ".py",
                256,
                "/usr/bin/python -m py_compile {src_path}",
                "/usr/bin/python {exe_path}",
            ),
            LanguageSpec::builtin(
                "Python3",
                ".py3",
                ".py3",
                256,
                "/usr/bin/python3 -m py_compile {src_path}",
                "/usr/bin/python3 {exe_path}",
            ),
            LanguageSpec::builtin(
                "Go",
                ".go",
                "",
                256,
                "/usr/bin/go build -o {exe_path} {src_path}",
                "{exe_path}",
            ),
            LanguageSpec::builtin(
                "Ruby",
                ".rb",
                ".rb",
                256,
                "/usr/bin/ruby -c {src_path}",
                "/usr/bin/ruby {exe_path}",
            ),
        ])
    }

    pub fn from_specs(specs: Vec<LanguageSpec>) -> Self {
        let languages = specs
            .into_iter()
            .map(|spec| (spec.name.to_lowercase(), spec))
            .collect();
        Self { languages }
    }

    /// Replaces the built-in table with a JSON array of language specs.
    pub fn from_json_file(path: &Path) -> Result<Self, JudgeError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            JudgeError::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        let specs: Vec<LanguageSpec> = serde_json::from_str(&raw).map_err(|err| {
            JudgeError::Configuration(format!("invalid language table {}: {err}", path.display()))
        })?;
        if specs.is_empty() {
            return Err(JudgeError::Configuration(format!(
                "language table {} is empty",
                path.display()
            )));
        }
        Ok(Self::from_specs(specs))
    }

    pub fn get(&self, name: &str) -> Result<&LanguageSpec, JudgeError> {
        self.languages
            .get(&name.trim().to_lowercase())
            .ok_or_else(|| JudgeError::UnknownLanguage(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.languages.values().map(|spec| spec.name.as_str()).collect()
    }
}
