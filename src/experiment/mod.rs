//! Per-project compile/run/clean pipelines driven by the task engine.

pub mod project;
pub mod recorder;

use serde::Serialize;
use tracing::info;

use crate::db::{ExperimentRecord, RunGroupGuard, RunStore};
use crate::process::ProcessRunner;
use crate::signals::Cancellation;
use crate::tasks::{
    fail_group, ExperimentHandle, ExperimentTransaction, LogTasks, PolicyKind, StepResult, Task,
    TaskError, TaskGroup, TaskManager, TaskPolicy,
};

pub use project::{load_projects, select_projects, Project, ProjectsError, ShellCommand, ShellProject};
pub use recorder::RunRecorder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentConfig {
    pub name: String,
    pub description: String,
    /// Policy across projects. Steps of one project always stop at the first
    /// failure.
    pub policy: PolicyKind,
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            policy: PolicyKind::Continue,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }
}

/// What the tasks of a plan share while it runs.
pub struct PlanEnvironment<'a> {
    pub runner: &'a dyn ProcessRunner,
    pub store: RunStore,
    pub experiment: ExperimentHandle,
    pub cancellation: Option<Cancellation>,
}

fn started_experiment(handle: &ExperimentHandle) -> Result<ExperimentRecord, TaskError> {
    handle
        .borrow()
        .clone()
        .ok_or_else(|| TaskError::Fatal(String::from("experiment has not been started")))
}

fn run_step<'a, P>(project: &'a P, env: &'a PlanEnvironment<'a>) -> Task<'a>
where
    P: Project,
{
    let name = format!("run {}", project.name());
    Task::new(name, "run the project under measurement", move || {
        let experiment = started_experiment(&env.experiment)?;
        let guard = RunGroupGuard::begin(
            &env.store,
            project.name(),
            project.group(),
            experiment.id.as_str(),
        )?;
        let mut recorder = RunRecorder::new(
            &env.store,
            env.runner,
            guard.id(),
            project.name(),
            experiment.name.as_str(),
        )
        .with_cancellation(env.cancellation.clone());
        let result = project.run(&mut recorder)?;
        if env
            .cancellation
            .as_ref()
            .is_some_and(Cancellation::is_cancelled)
        {
            guard.fail()?;
            return Err(TaskError::Interrupted);
        }
        info!(
            project = %project.name(),
            runs = recorder.runs().len(),
            %result,
            "project run finished"
        );
        if result.permits_continuation() {
            guard.complete()?;
        } else {
            guard.fail()?;
        }
        Ok(result.into())
    })
}

/// One fail-fast `compile`, `run`, `clean` group per project, all under an
/// experiment-level group with `config.policy`.
pub fn project_plan<'a, P>(
    config: &ExperimentConfig,
    projects: &'a [P],
    env: &'a PlanEnvironment<'a>,
) -> TaskGroup<'a>
where
    P: Project,
{
    let groups = projects.iter().map(move |project| {
        let compile = Task::new(
            format!("compile {}", project.name()),
            "build the project",
            move || Ok(project.compile(env.runner)?.into()),
        );
        let clean = Task::new(
            format!("clean {}", project.name()),
            "remove build artifacts",
            move || Ok(project.clean(env.runner)?.into()),
        );
        fail_group(
            project.name(),
            [compile.into(), run_step(project, env).into(), clean.into()],
        )
        .into()
    });
    TaskGroup::new(
        config.name.as_str(),
        config.description.as_str(),
        TaskPolicy::new(config.policy),
        groups,
    )
}

/// Result of [`run_experiment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExperimentOutcome {
    pub experiment: Option<ExperimentRecord>,
    pub results: Vec<StepResult>,
}

impl ExperimentOutcome {
    pub fn worst(&self) -> StepResult {
        StepResult::worst(self.results.iter().copied())
    }

    pub fn succeeded(&self) -> bool {
        self.worst().permits_continuation()
    }
}

/// Runs every project inside one persisted experiment.
pub fn run_experiment<P>(
    config: &ExperimentConfig,
    projects: &[P],
    runner: &dyn ProcessRunner,
    store: RunStore,
    cancellation: Option<Cancellation>,
) -> Result<ExperimentOutcome, TaskError>
where
    P: Project,
{
    store.initialize()?;
    let transaction = ExperimentTransaction::new(
        store.clone(),
        config.name.as_str(),
        config.description.as_str(),
    );
    let env = PlanEnvironment {
        runner,
        store,
        experiment: transaction.handle(),
        cancellation: cancellation.clone(),
    };

    let mut manager = TaskManager::new(project_plan(config, projects, &env))
        .with_global_context(transaction)
        .with_task_context(LogTasks::new());
    if let Some(cancellation) = cancellation {
        manager = manager.with_cancellation(cancellation);
    }
    let results = manager.run()?;

    let experiment = env.experiment.borrow().clone();
    Ok(ExperimentOutcome {
        experiment,
        results,
    })
}
