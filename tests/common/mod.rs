#![allow(dead_code)]

use std::sync::Arc;

use taskweave::{
    Direction, ImplementationSpec, OnFailure, Parameter, RecordingExecutor, Runtime,
    RuntimeConfig, TaskSpec,
};
use tempfile::TempDir;

pub const APP: u64 = 1;

pub struct Harness {
    pub runtime: Runtime,
    pub executor: Arc<RecordingExecutor>,
    pub dir: TempDir,
}

pub fn harness() -> Harness {
    harness_with(|config| config)
}

pub fn harness_with<F>(configure: F) -> Harness
where
    F: FnOnce(RuntimeConfig) -> RuntimeConfig,
{
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(RecordingExecutor::new());
    let config = configure(RuntimeConfig::default().with_working_dir(dir.path()));
    let runtime = Runtime::builder()
        .config(config)
        .executor(executor.clone())
        .build()
        .unwrap();
    for signature in ["produce", "consume", "update", "work"] {
        runtime
            .register_core_element(signature, &[ImplementationSpec::method(signature)])
            .unwrap();
    }
    Harness {
        runtime,
        executor,
        dir,
    }
}

pub fn writer(name: &str) -> TaskSpec {
    TaskSpec::new(APP, "produce").with_parameter(Parameter::file(Direction::Out, name))
}

pub fn reader(name: &str) -> TaskSpec {
    TaskSpec::new(APP, "consume").with_parameter(Parameter::file(Direction::In, name))
}

pub fn updater(name: &str) -> TaskSpec {
    TaskSpec::new(APP, "update").with_parameter(Parameter::file(Direction::InOut, name))
}

pub fn failing_writer(name: &str, policy: OnFailure) -> TaskSpec {
    writer(name).with_on_failure(policy)
}
