use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use tracing::{info, warn};

use super::{StepResult, Task, TaskError};
use crate::db::{ExperimentRecord, RunStatus, RunStore};

/// How a scope ended.
#[derive(Debug, Clone, Copy)]
pub enum ScopeExit<'e> {
    Completed(StepResult),
    Failed(&'e TaskError),
}

impl ScopeExit<'_> {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Completed(result) if result.permits_continuation())
    }
}

/// Wraps every single task run by the manager.
pub trait TaskContext {
    fn enter(&mut self, task: &Task<'_>) -> Result<(), TaskError>;
    fn exit(&mut self, task: &Task<'_>, outcome: ScopeExit<'_>);
}

/// Wraps the whole run. Entered in order, exited in reverse.
pub trait GlobalContext {
    fn enter(&mut self) -> Result<(), TaskError>;
    fn exit(&mut self, outcome: ScopeExit<'_>);
}

#[derive(Debug, Default)]
pub struct LogTasks {
    started: Option<Instant>,
}

impl LogTasks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskContext for LogTasks {
    fn enter(&mut self, task: &Task<'_>) -> Result<(), TaskError> {
        self.started = Some(Instant::now());
        info!(
            task = %task.name(),
            group = task.owner().unwrap_or("-"),
            "{}",
            task.description()
        );
        Ok(())
    }

    fn exit(&mut self, task: &Task<'_>, outcome: ScopeExit<'_>) {
        let elapsed_ms = self
            .started
            .take()
            .map(|started| started.elapsed().as_millis())
            .unwrap_or_default();
        match outcome {
            ScopeExit::Completed(result) => {
                info!(task = %task.name(), %result, elapsed_ms, "task finished")
            }
            ScopeExit::Failed(error) => {
                warn!(task = %task.name(), %error, elapsed_ms, "task aborted")
            }
        }
    }
}

/// Experiment record shared between the transaction and the tasks of a plan.
pub type ExperimentHandle = Rc<RefCell<Option<ExperimentRecord>>>;

/// Persists an experiment row for the duration of a run.
///
/// The row is created on enter and closed as `completed` or `failed` on exit,
/// depending on the worst result of the run.
pub struct ExperimentTransaction {
    store: RunStore,
    name: String,
    description: String,
    record: ExperimentHandle,
}

impl ExperimentTransaction {
    pub fn new(store: RunStore, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            description: description.into(),
            record: Rc::new(RefCell::new(None)),
        }
    }

    /// Handle through which tasks read the persisted experiment once the run
    /// has started.
    pub fn handle(&self) -> ExperimentHandle {
        Rc::clone(&self.record)
    }
}

impl GlobalContext for ExperimentTransaction {
    fn enter(&mut self) -> Result<(), TaskError> {
        let record = self
            .store
            .persist_experiment(self.name.as_str(), self.description.as_str())?;
        info!(experiment = %record.name, id = %record.id, "experiment started");
        *self.record.borrow_mut() = Some(record);
        Ok(())
    }

    fn exit(&mut self, outcome: ScopeExit<'_>) {
        let Some(record) = self.record.borrow().clone() else {
            return;
        };
        let status = if outcome.succeeded() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        match self.store.finish_experiment(record.id.as_str(), status) {
            Ok(()) => info!(experiment = %record.name, status = status.as_str(), "experiment finished"),
            Err(error) => warn!(experiment = %record.name, %error, "failed to close experiment"),
        }
    }
}
