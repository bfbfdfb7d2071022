//! The runtime facade used by language bindings
//!
//! A [`Runtime`] wires the catalog, version tracker, graph builder,
//! scheduler, barriers and access manager together and drives an
//! [`Executor`]: every call that can make tasks ready (submission, a
//! completion, a main-program write close) pumps the dispatch sequence into
//! the executor before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, error, info, warn};

use crate::access::{AccessManager, AccessMode, OpenedData};
use crate::catalog::{Catalog, ImplementationSpec};
use crate::core::config::RuntimeConfig;
use crate::core::errors::{Result, RuntimeError};
use crate::core::events::{Event, EventEmitter, EventSink, LoggingEventSink, RuntimeEvent};
use crate::core::logging::init_tracing;
use crate::data::{DataId, DataLocation, DataVersion, VersionTracker};
use crate::executor::{CompletionSink, Executor};
use crate::graph::{
    AppId, GraphBuilder, PlacementHints, TaskId, TaskOutcome, TaskSnapshot, TaskSpec, TaskStatus,
};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::sync::{AppRegistry, BarrierReport, GroupManager};

/// Builder for [`Runtime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    executor: Option<Arc<dyn Executor>>,
    sinks: Vec<Arc<dyn EventSink>>,
    install_tracing: bool,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            executor: None,
            sinks: Vec::new(),
            install_tracing: false,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Install a tracing subscriber at the configured level on build
    pub fn with_tracing(mut self) -> Self {
        self.install_tracing = true;
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let config = self.config;
        config.validate()?;
        let executor = self
            .executor
            .ok_or_else(|| RuntimeError::configuration("no executor configured"))?;

        if self.install_tracing {
            if let Err(e) = init_tracing(&config.log_level) {
                debug!(error = %e, "Keeping existing tracing subscriber");
            }
        }
        std::fs::create_dir_all(&config.working_dir)?;

        let events = Arc::new(EventEmitter::new(config.record_events));
        if config.log_events {
            events.add_sink(Arc::new(LoggingEventSink));
        }
        for sink in self.sinks {
            events.add_sink(sink);
        }

        let catalog = Arc::new(Catalog::new());
        let tracker = Arc::new(VersionTracker::new(config.working_dir.clone()));
        let apps = Arc::new(AppRegistry::new());
        let groups = Arc::new(GroupManager::new(Arc::clone(&events)));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&tracker),
            Arc::clone(&apps),
            Arc::clone(&events),
            config.max_retries,
        ));
        let builder = GraphBuilder::new(
            Arc::clone(&catalog),
            Arc::clone(&tracker),
            Arc::clone(&scheduler),
            Arc::clone(&apps),
            Arc::clone(&groups),
            Arc::clone(&events),
        );
        let access = AccessManager::new(Arc::clone(&tracker), Arc::clone(&scheduler), Arc::clone(&events));

        info!(working_dir = %config.working_dir.display(), max_retries = config.max_retries, "Runtime started");
        let inner = Arc::new_cyclic(|me| RuntimeInner {
            config,
            catalog,
            tracker,
            scheduler,
            apps,
            groups,
            events,
            builder,
            access,
            executor,
            stopped: AtomicBool::new(false),
            me: me.clone(),
        });
        Ok(Runtime { inner })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    catalog: Arc<Catalog>,
    tracker: Arc<VersionTracker>,
    scheduler: Arc<Scheduler>,
    apps: Arc<AppRegistry>,
    groups: Arc<GroupManager>,
    events: Arc<EventEmitter>,
    builder: GraphBuilder,
    access: AccessManager,
    executor: Arc<dyn Executor>,
    stopped: AtomicBool,
    me: Weak<RuntimeInner>,
}

impl RuntimeInner {
    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RuntimeError::SystemShutdown);
        }
        Ok(())
    }

    fn completion_sink(&self) -> CompletionSink {
        let runtime = self.me.clone();
        CompletionSink::new(move |task_id, outcome| match runtime.upgrade() {
            Some(inner) => inner.on_completion(task_id, outcome),
            None => Err(RuntimeError::SystemShutdown),
        })
    }

    fn on_completion(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<()> {
        self.complete(task_id, outcome)?;
        self.pump();
        Ok(())
    }

    fn complete(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<()> {
        let running = self.scheduler.on_completion(task_id, outcome)?;
        self.request_cancel(&running);
        Ok(())
    }

    fn request_cancel(&self, tasks: &[TaskId]) {
        for task_id in tasks {
            // Without a handle yet, the request is honoured in `pump`
            if let Some(handle) = self.scheduler.handle(*task_id) {
                debug!(task_id, handle, "Requesting cancellation");
                self.executor.request_cancel(handle);
            }
        }
    }

    /// Hand every ready task to the executor. Tasks the executor refuses
    /// fail under their own policy.
    fn pump(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        loop {
            let mut rejected = Vec::new();
            for task in self.scheduler.dispatch() {
                let task_id = task.id;
                match self.executor.submit(task, self.completion_sink()) {
                    Ok(handle) => {
                        if self.scheduler.attach_handle(task_id, handle) {
                            self.executor.request_cancel(handle);
                        }
                    }
                    Err(e) => {
                        warn!(task_id, error = %e, "Executor refused task");
                        rejected.push((task_id, e.to_string()));
                    }
                }
            }
            if rejected.is_empty() {
                return;
            }
            for (task_id, reason) in rejected {
                if let Err(e) = self.complete(task_id, TaskOutcome::Failure(reason)) {
                    error!(task_id, error = %e, "Failed to record refused task");
                }
            }
        }
    }
}

/// Handle to a running runtime; cheap to clone and share across threads
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// Register or update a core element. Returns true if the catalog
    /// changed.
    pub fn register_core_element(&self, signature: &str, implementations: &[ImplementationSpec]) -> Result<bool> {
        self.inner.ensure_running()?;
        self.inner.catalog.register(signature, implementations)
    }

    pub fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        self.inner.ensure_running()?;
        let task_id = self.inner.builder.submit(spec)?;
        self.inner.pump();
        Ok(task_id)
    }

    pub fn execute_task(&self, spec: TaskSpec) -> Result<TaskId> {
        self.submit_task(spec)
    }

    /// Submission carrying placement hints for the executor
    pub fn execute_task_new(&self, spec: TaskSpec, hints: PlacementHints) -> Result<TaskId> {
        self.submit_task(spec.with_hints(hints))
    }

    /// Executor-facing completion entry point, for executors that report
    /// outside a [`CompletionSink`]
    pub fn on_completion(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<()> {
        self.inner.on_completion(task_id, outcome)
    }

    pub fn open_file(&self, name: &str, mode: AccessMode) -> Result<OpenedData> {
        self.inner.ensure_running()?;
        self.inner.access.open(&DataId::file(name), mode)
    }

    pub fn close_file(&self, name: &str, mode: AccessMode) -> Result<()> {
        self.inner.access.close(&DataId::file(name), mode)?;
        if mode.writes() {
            self.inner.pump();
        }
        Ok(())
    }

    pub fn delete_file(&self, name: &str, wait_for_producer: bool) -> Result<bool> {
        self.inner.access.delete(&DataId::file(name), wait_for_producer)
    }

    pub fn get_file(&self, name: &str) -> Result<DataLocation> {
        self.inner.access.get_file(name)
    }

    pub fn get_object(&self, name: &str) -> Result<OpenedData> {
        self.inner.access.get_object(name)
    }

    pub fn delete_object(&self, name: &str, wait_for_producer: bool) -> Result<bool> {
        self.inner.access.delete_object(name, wait_for_producer)
    }

    /// Block until every task the application submitted so far is terminal
    pub fn barrier(&self, app_id: AppId) -> BarrierReport {
        let report = self.inner.apps.barrier(app_id);
        info!(app_id, waited = report.waited, failures = report.failures.len(), "Barrier reached");
        self.inner.events.emit(RuntimeEvent::BarrierReached {
            app_id,
            group: None,
            failures: report.failures.len(),
        });
        report
    }

    /// Barrier that can also declare the application finished submitting
    pub fn barrier_new(&self, app_id: AppId, no_more_tasks: bool) -> BarrierReport {
        if no_more_tasks {
            self.inner.apps.seal(app_id);
            debug!(app_id, "Application sealed");
        }
        self.barrier(app_id)
    }

    pub fn open_task_group(&self, app_id: AppId, name: &str, implicit_barrier: bool) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.groups.open_group(app_id, name, implicit_barrier)?;
        Ok(())
    }

    pub fn close_task_group(&self, app_id: AppId, name: &str) -> Result<Option<BarrierReport>> {
        self.inner.groups.close_group(app_id, name)
    }

    pub fn barrier_group(&self, app_id: AppId, name: &str) -> Result<BarrierReport> {
        self.inner.groups.barrier_group(app_id, name)
    }

    /// Cancel every task of the application that has not finished. Returns
    /// the number of running tasks asked to stop.
    pub fn cancel_application_tasks(&self, app_id: AppId) -> usize {
        let running = self.inner.scheduler.cancel_application(app_id);
        self.inner.request_cancel(&running);
        running.len()
    }

    pub fn emit_event(&self, event_type: i32, id: i64) -> u64 {
        self.inner.events.emit(RuntimeEvent::User { event_type, id })
    }

    pub fn task(&self, task_id: TaskId) -> Result<TaskSnapshot> {
        self.inner.scheduler.task(task_id)
    }

    pub fn status(&self, task_id: TaskId) -> Result<TaskStatus> {
        self.inner.scheduler.status(task_id)
    }

    /// Current attempt of a task, following retries
    pub fn latest_attempt(&self, task_id: TaskId) -> TaskId {
        self.inner.scheduler.latest_attempt(task_id)
    }

    pub fn versions(&self, data: &DataId) -> Vec<DataVersion> {
        self.inner.tracker.versions(data)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.events.events()
    }

    pub fn events_json(&self) -> Result<String> {
        self.inner.events.to_json()
    }

    pub fn to_dot(&self) -> String {
        self.inner.scheduler.to_dot()
    }

    /// Forget a finished application. Returns how many task nodes were
    /// dropped; nothing is dropped while tasks are still live.
    pub fn release_application(&self, app_id: AppId) -> usize {
        let released = self.inner.scheduler.release_application(app_id);
        if released > 0 {
            self.inner.groups.remove_application(app_id);
        }
        released
    }

    /// Stop accepting work. Tasks already handed to the executor may still
    /// report; nothing new is dispatched.
    pub fn shutdown(&self) -> SchedulerStats {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            info!("Runtime stopped");
        }
        self.inner.scheduler.stats()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}
