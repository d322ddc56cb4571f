use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::engine::{
    artifact::{self, ArtifactError, ExtractedArtifact},
    checker::Checker,
    error::JudgeError,
    language::{LanguageRegistry, LanguageSpec},
    limits::{LimitDefaults, translate},
    models::{CaseDetail, CompileSummary, Job, JudgeReport},
    runner::{CaseExecutor, CasePlan},
    sandbox::{ExecutionResult, SandboxController, SandboxRequest, SandboxSpec},
    verdict::{CaseLimits, Scorecard, StageFailure, Verdict, checker_verdict, classify_result},
};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Mount point of the job volume inside every sandbox.
    pub working_dir: String,
    pub test_data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub compile_file_size: u64,
    pub defaults: LimitDefaults,
}

enum CaseOutcome {
    Passed(CaseDetail),
    Failed(StageFailure, CaseDetail),
}

/// Compiles a job and walks its test cases in name order, stopping at the
/// first failing stage.
pub struct JudgePipeline {
    controller: SandboxController,
    executor: Arc<dyn CaseExecutor>,
    checker: Arc<dyn Checker>,
    languages: Arc<LanguageRegistry>,
    settings: PipelineSettings,
}

impl JudgePipeline {
    pub fn new(
        controller: SandboxController,
        executor: Arc<dyn CaseExecutor>,
        checker: Arc<dyn Checker>,
        languages: Arc<LanguageRegistry>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            controller,
            executor,
            checker,
            languages,
            settings,
        }
    }

    pub async fn judge(&self, job: &Job) -> Result<JudgeReport, JudgeError> {
        let language = self.languages.get(&job.language)?;
        let data_dir = self.data_dir(job).await?;

        let volume = job.volume_name();
        let backend = self.controller.backend();
        backend.create_volume(&volume).await?;
        tracing::debug!(job_id = %job.id, volume = %volume, "working volume created");

        let outcome = self.judge_in_volume(job, language, &volume, &data_dir).await;

        if let Err(err) = backend.remove_volume(&volume).await {
            tracing::warn!(job_id = %job.id, volume = %volume, error = %err, "failed to remove working volume");
        }
        outcome
    }

    async fn judge_in_volume(
        &self,
        job: &Job,
        language: &LanguageSpec,
        volume: &str,
        data_dir: &Path,
    ) -> Result<JudgeReport, JudgeError> {
        let working_dir = &self.settings.working_dir;
        let src_path = language.source_path(working_dir, &job.id);
        let exe_path = language.exe_path(working_dir, &job.id);

        let compiled = self.compile(job, language, volume, &src_path, &exe_path).await?;
        let summary = CompileSummary {
            time_ms: compiled.duration_ms(),
            exit_code: compiled.exit_code,
        };
        if compiled.exit_code != Some(0) {
            let failure = StageFailure::compile(&compiled);
            tracing::warn!(
                job_id = %job.id,
                exit_code = ?compiled.exit_code,
                timed_out = compiled.timed_out,
                info = %failure.info,
                "compilation failed"
            );
            return Ok(Scorecard::new().failed(failure, None, summary));
        }
        tracing::info!(job_id = %job.id, time_ms = ?summary.time_ms, "compiled");

        let cases = list_test_cases(data_dir).await?;
        tracing::info!(job_id = %job.id, cases = cases.len(), "running test cases");

        let limits = CaseLimits {
            time_secs: job.time_limit_secs,
            memory_mb: job.memory_limit_mb,
            output_bytes: job.output_limit_bytes,
        };
        let run_line = language.run_line(&src_path, &exe_path, job.memory_limit_mb);

        let mut card = Scorecard::new();
        for (index, case) in cases.into_iter().enumerate() {
            let plan = CasePlan {
                job_id: job.id.clone(),
                index,
                case,
                run_line: run_line.clone(),
                volume: volume.to_string(),
                data_dir: data_dir.to_path_buf(),
                cpu_time_secs: job.time_limit_secs,
                memory_mb: job.memory_limit_mb,
                output_limit_bytes: job.output_limit_bytes,
            };
            match self.judge_case(job, &plan, &limits, data_dir).await? {
                CaseOutcome::Passed(detail) => card.passed(detail),
                CaseOutcome::Failed(failure, detail) => {
                    tracing::warn!(
                        job_id = %job.id,
                        case = %plan.case,
                        verdict = failure.verdict.code(),
                        "test case failed"
                    );
                    return Ok(card.failed(failure, Some(detail), summary));
                }
            }
        }

        tracing::info!(job_id = %job.id, "accepted");
        Ok(card.accepted(summary))
    }

    async fn compile(
        &self,
        job: &Job,
        language: &LanguageSpec,
        volume: &str,
        src_path: &str,
        exe_path: &str,
    ) -> Result<ExecutionResult, JudgeError> {
        let source_name = format!("{}{}", job.id, language.suffix);
        let archive = artifact::pack_file(&source_name, job.source.as_bytes())?;

        let spec = SandboxSpec {
            name: format!("{}-compile", job.id),
            command: vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                language.compile_line(src_path, exe_path),
            ],
            working_volume: volume.to_string(),
            working_dir: self.settings.working_dir.clone(),
            data_mount: None,
            constraints: translate(
                &language.compile_limits(self.settings.compile_file_size),
                &self.settings.defaults,
            ),
        };
        let request = SandboxRequest::new(spec).with_upload(&self.settings.working_dir, archive);
        Ok(self.controller.execute(request).await?.result)
    }

    async fn judge_case(
        &self,
        job: &Job,
        plan: &CasePlan,
        limits: &CaseLimits,
        data_dir: &Path,
    ) -> Result<CaseOutcome, JudgeError> {
        tracing::debug!(job_id = %job.id, case = %plan.case, "running case");
        let execution = self.executor.execute(plan).await?;
        let run = &execution.run;
        let time_ms = run.duration_ms();

        let verdict = classify_result(run);
        if verdict != Verdict::Accepted {
            let mut detail = CaseDetail::new(&plan.case, verdict).timed(time_ms, None);
            detail.exit_code = run.exit_code;
            detail.log = run.combined_output();
            return Ok(CaseOutcome::Failed(
                StageFailure::run(verdict, &plan.case, limits, run),
                detail,
            ));
        }

        if let Some(measured) = execution.peak_memory_kb {
            if limits.memory_exceeded(measured) {
                let mut detail = CaseDetail::new(&plan.case, Verdict::MemoryLimitExceeded)
                    .timed(time_ms, Some(measured));
                detail.exit_code = run.exit_code;
                return Ok(CaseOutcome::Failed(
                    StageFailure::memory(&plan.case, limits, measured),
                    detail,
                ));
            }
        }

        let extracted = self.extract_output(job, plan, execution.output).await?;
        let output_path = match &extracted {
            Some(file) => file.path().to_path_buf(),
            // the checker sees a missing file and decides
            None => self.settings.temp_dir.join(format!("{}-{}.missing", job.id, plan.index)),
        };
        let input_path = data_dir.join(format!("{}.in", plan.case));
        let answer_path = data_dir.join(format!("{}.out", plan.case));

        let report = self
            .checker
            .check(&input_path, &output_path, &answer_path, job.check_method)
            .await?;
        if let Some(file) = extracted {
            if let Err(err) = file.close() {
                tracing::warn!(job_id = %job.id, case = %plan.case, error = %err, "failed to remove extracted output");
            }
        }

        let verdict = checker_verdict(report.exit_code);
        let mut detail = CaseDetail::new(&plan.case, verdict).timed(time_ms, execution.peak_memory_kb);
        detail.exit_code = run.exit_code;
        detail.checker_exit_code = report.exit_code;
        detail.input = report.input;
        detail.output = report.output;
        detail.answer = report.answer;
        detail.log = report.log;

        if verdict == Verdict::Accepted {
            tracing::debug!(job_id = %job.id, case = %plan.case, ?time_ms, "case passed");
            return Ok(CaseOutcome::Passed(detail));
        }
        let failure = StageFailure::checker(
            verdict,
            &plan.case,
            job.check_method.as_str(),
            &data_dir.display().to_string(),
            report.exit_code,
            &detail.log,
        );
        Ok(CaseOutcome::Failed(failure, detail))
    }

    async fn extract_output(
        &self,
        job: &Job,
        plan: &CasePlan,
        archive: Option<bytes::Bytes>,
    ) -> Result<Option<ExtractedArtifact>, JudgeError> {
        let Some(archive) = archive else {
            tracing::debug!(job_id = %job.id, case = %plan.case, "program wrote no output file");
            return Ok(None);
        };
        let prefix = format!("{}-{}-", job.id, plan.index);
        match artifact::extract(archive, &self.settings.temp_dir, &prefix).await {
            Ok(file) => Ok(Some(file)),
            Err(ArtifactError::Empty) => {
                tracing::warn!(job_id = %job.id, case = %plan.case, "output archive is empty");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn data_dir(&self, job: &Job) -> Result<PathBuf, JudgeError> {
        let dir = self.settings.test_data_dir.join(&job.test_case_id);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            _ => Err(JudgeError::TestDataNotFound(job.test_case_id.clone())),
        }
    }
}

/// Names with both `<name>.in` and `<name>.out`, in lexicographic order.
pub async fn list_test_cases(dir: &Path) -> Result<Vec<String>, JudgeError> {
    let io_err = |source: std::io::Error| JudgeError::TestData {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut names = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("in") {
            continue;
        }
        if !entry.file_type().await.map_err(io_err)?.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if tokio::fs::metadata(dir.join(format!("{stem}.out")))
            .await
            .is_ok_and(|meta| meta.is_file())
        {
            names.push(stem.to_string());
        }
    }

    names.sort();
    Ok(names)
}
