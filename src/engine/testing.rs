//! Pipeline wiring shared by the worker and API tests: a scripted sandbox
//! backend, scratch directories, and verifiers that always accept.

use std::{os::unix::fs::symlink, sync::Arc};

use tempfile::TempDir;

use crate::engine::{
    checker::{CheckMethod, ExternalChecker},
    language::LanguageRegistry,
    limits::LimitDefaults,
    pipeline::{JudgePipeline, PipelineSettings},
    runner::TwoPassExecutor,
    sandbox::{SandboxController, fake::FakeBackend},
};

pub struct Fixture {
    pub _root: TempDir,
    pub backend: Arc<FakeBackend>,
    pub pipeline: Arc<JudgePipeline>,
}

/// Test-case set `7` holds one paired file per entry of `cases`.
pub fn fixture(backend: FakeBackend, cases: &[&str]) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let data = root.path().join("test_data").join("7");
    let temp_dir = root.path().join("temp");
    let checker_dir = root.path().join("checkers");
    for dir in [&data, &temp_dir, &checker_dir] {
        std::fs::create_dir_all(dir).unwrap();
    }
    for case in cases {
        std::fs::write(data.join(format!("{case}.in")), "1 2\n").unwrap();
        std::fs::write(data.join(format!("{case}.out")), "3\n").unwrap();
    }
    for method in CheckMethod::ALL {
        symlink("/bin/true", checker_dir.join(method.as_str())).unwrap();
    }

    let backend = Arc::new(backend);
    let controller = SandboxController::new(backend.clone());
    let defaults = LimitDefaults::default();
    let pipeline = JudgePipeline::new(
        controller.clone(),
        Arc::new(TwoPassExecutor::new(controller, defaults, "/judgebox", "/data")),
        Arc::new(ExternalChecker::new(checker_dir)),
        Arc::new(LanguageRegistry::builtin()),
        PipelineSettings {
            working_dir: "/judgebox".to_string(),
            test_data_dir: root.path().join("test_data"),
            temp_dir,
            compile_file_size: 128 * 1024 * 1024,
            defaults,
        },
    );

    Fixture {
        _root: root,
        backend,
        pipeline: Arc::new(pipeline),
    }
}
