//! Policy-governed execution trees.
//!
//! A plan is a tree of [`TaskGroup`]s whose leaves are [`Task`]s. The
//! [`TaskManager`] flattens the tree depth-first and runs the leaves one at a
//! time; each group's [`TaskPolicy`] decides whether its remaining
//! descendants still run after a result comes back.

pub mod contexts;
pub mod manager;
pub mod policy;

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::db::DbError;
use crate::process::ProcessError;

pub use contexts::{
    ExperimentHandle, ExperimentTransaction, GlobalContext, LogTasks, ScopeExit, TaskContext,
};
pub use manager::TaskManager;
pub use policy::{PolicyKind, TaskPolicy};

/// Outcome of one task, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    Ok,
    CanContinue,
    Unknown,
    Error,
}

impl StepResult {
    /// `Ok` and `CanContinue` still allow a fail-fast group to go on.
    pub fn permits_continuation(self) -> bool {
        matches!(self, Self::Ok | Self::CanContinue)
    }

    pub fn worst<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        results.into_iter().fold(Self::Ok, Self::max)
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ok => "OK",
            Self::CanContinue => "CAN_CONTINUE",
            Self::Unknown => "UNKNOWN",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// What a task hands back: one result, or the results of a sub-plan it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    Single(StepResult),
    Many(Vec<StepResult>),
}

impl StepOutput {
    pub fn worst(&self) -> StepResult {
        match self {
            Self::Single(result) => *result,
            Self::Many(results) => StepResult::worst(results.iter().copied()),
        }
    }
}

impl From<StepResult> for StepOutput {
    fn from(result: StepResult) -> Self {
        Self::Single(result)
    }
}

impl From<Vec<StepResult>> for StepOutput {
    fn from(results: Vec<StepResult>) -> Self {
        Self::Many(results)
    }
}

/// Appends a scalar output, or splices in every result of a list output.
pub fn merge_results(results: &mut Vec<StepResult>, output: StepOutput) {
    match output {
        StepOutput::Single(result) => results.push(result),
        StepOutput::Many(nested) => results.extend(nested),
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Process(ProcessError),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("interrupted by termination request")]
    Interrupted,
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("{0}")]
    Fatal(String),
    #[error("task '{0}' was already executed")]
    AlreadyExecuted(String),
}

/// A killed child means the whole run is being interrupted.
impl From<ProcessError> for TaskError {
    fn from(error: ProcessError) -> Self {
        if error.is_interrupted() {
            return Self::Interrupted;
        }
        Self::Process(error)
    }
}

impl TaskError {
    /// Failures the manager turns into [`StepResult::Error`] instead of
    /// aborting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Process(_) | Self::Io(_))
    }
}

type TaskFn<'a> = Box<dyn FnOnce() -> Result<StepOutput, TaskError> + 'a>;

/// A named unit of work, runnable exactly once.
pub struct Task<'a> {
    name: String,
    description: String,
    owner: Option<String>,
    call: Option<TaskFn<'a>>,
}

impl<'a> Task<'a> {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, call: F) -> Self
    where
        F: FnOnce() -> Result<StepOutput, TaskError> + 'a,
    {
        Self {
            name: name.into(),
            description: description.into(),
            owner: None,
            call: Some(Box::new(call)),
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn description(&self) -> &str {
        self.description.as_str()
    }

    /// Name of the group this task was declared in.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn has_run(&self) -> bool {
        self.call.is_none()
    }

    /// Runs the wrapped callable. Errors are not caught here.
    pub fn call(&mut self) -> Result<StepOutput, TaskError> {
        let call = self
            .call
            .take()
            .ok_or_else(|| TaskError::AlreadyExecuted(self.name.clone()))?;
        call()
    }
}

impl fmt::Debug for Task<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("has_run", &self.has_run())
            .finish()
    }
}

#[derive(Debug)]
pub enum Node<'a> {
    Task(Task<'a>),
    Group(TaskGroup<'a>),
}

impl<'a> From<Task<'a>> for Node<'a> {
    fn from(task: Task<'a>) -> Self {
        Self::Task(task)
    }
}

impl<'a> From<TaskGroup<'a>> for Node<'a> {
    fn from(group: TaskGroup<'a>) -> Self {
        Self::Group(group)
    }
}

/// Name and policy of a group, split from its children so the manager can
/// keep it after the tree is flattened.
#[derive(Debug)]
pub(crate) struct GroupScope {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) policy: TaskPolicy,
}

impl GroupScope {
    pub(crate) fn on_error(&mut self, prior: StepResult, failure: &TaskError) {
        error!(
            group = %self.name,
            prior = %prior,
            error = %failure,
            "task failed"
        );
        self.policy.can_continue(StepResult::Error);
    }
}

#[derive(Debug)]
pub struct TaskGroup<'a> {
    scope: GroupScope,
    children: Vec<Node<'a>>,
}

impl<'a> TaskGroup<'a> {
    pub fn new<I>(
        name: impl Into<String>,
        description: impl Into<String>,
        policy: TaskPolicy,
        children: I,
    ) -> Self
    where
        I: IntoIterator<Item = Node<'a>>,
    {
        let name = name.into();
        let children = children
            .into_iter()
            .map(|child| match child {
                Node::Task(mut task) => {
                    task.owner = Some(name.clone());
                    Node::Task(task)
                }
                group => group,
            })
            .collect();
        Self {
            scope: GroupScope {
                name,
                description: description.into(),
                policy,
            },
            children,
        }
    }

    pub fn name(&self) -> &str {
        self.scope.name.as_str()
    }

    pub fn description(&self) -> &str {
        self.scope.description.as_str()
    }

    pub fn policy(&self) -> &TaskPolicy {
        &self.scope.policy
    }

    pub fn children(&self) -> &[Node<'a>] {
        self.children.as_slice()
    }

    /// Leaf tasks in depth-first declaration order.
    pub fn tasks(&self) -> Vec<&Task<'a>> {
        let mut out = Vec::new();
        collect_tasks(self.children.as_slice(), &mut out);
        out
    }

    pub fn can_continue(&mut self, result: StepResult) -> bool {
        self.scope.policy.can_continue(result)
    }

    /// Records a failure reported by one of this group's tasks.
    pub fn on_error(&mut self, prior: StepResult, failure: &TaskError) {
        self.scope.on_error(prior, failure);
    }

    pub(crate) fn into_parts(self) -> (GroupScope, Vec<Node<'a>>) {
        (self.scope, self.children)
    }
}

fn collect_tasks<'n, 'a>(nodes: &'n [Node<'a>], out: &mut Vec<&'n Task<'a>>) {
    for node in nodes {
        match node {
            Node::Task(task) => out.push(task),
            Node::Group(group) => collect_tasks(group.children.as_slice(), out),
        }
    }
}

pub fn fail_group<'a, I>(name: impl Into<String>, children: I) -> TaskGroup<'a>
where
    I: IntoIterator<Item = Node<'a>>,
{
    TaskGroup::new(name, "stops at the first failure", TaskPolicy::fail(), children)
}

pub fn continue_group<'a, I>(name: impl Into<String>, children: I) -> TaskGroup<'a>
where
    I: IntoIterator<Item = Node<'a>>,
{
    TaskGroup::new(
        name,
        "keeps going after failures",
        TaskPolicy::continue_on_error(),
        children,
    )
}

/// A task that only logs `message`.
pub fn echo<'a>(message: impl Into<String>) -> Task<'a> {
    let message = message.into();
    let name = format!("echo: {message}");
    Task::new(name, "print a message", move || {
        info!(%message, "echo");
        Ok(StepResult::Ok.into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names<'n>(tasks: &[&'n Task<'_>]) -> Vec<&'n str> {
        tasks.iter().map(|task| task.name()).collect()
    }

    #[test]
    fn step_results_are_ordered_by_severity() {
        assert!(StepResult::Ok < StepResult::CanContinue);
        assert!(StepResult::CanContinue < StepResult::Unknown);
        assert!(StepResult::Unknown < StepResult::Error);
        assert_eq!(
            StepResult::worst([StepResult::Ok, StepResult::Error, StepResult::CanContinue]),
            StepResult::Error
        );
        assert_eq!(StepResult::worst([]), StepResult::Ok);
    }

    #[test]
    fn merge_results_flattens_lists_and_appends_scalars() {
        let mut results = vec![StepResult::Ok];
        merge_results(&mut results, StepResult::CanContinue.into());
        merge_results(
            &mut results,
            vec![StepResult::Ok, StepResult::Error].into(),
        );
        assert_eq!(
            results,
            vec![
                StepResult::Ok,
                StepResult::CanContinue,
                StepResult::Ok,
                StepResult::Error
            ]
        );
    }

    #[test]
    fn group_sets_owner_on_direct_children_only() {
        let inner = fail_group("inner", [echo("b").into()]);
        let outer = continue_group("outer", [echo("a").into(), inner.into()]);

        let tasks = outer.tasks();
        assert_eq!(tasks[0].owner(), Some("outer"));
        assert_eq!(tasks[1].owner(), Some("inner"));
    }

    #[test]
    fn tasks_flatten_depth_first_in_declaration_order() {
        let plan = continue_group(
            "root",
            [
                echo("1").into(),
                fail_group(
                    "g1",
                    [
                        echo("2").into(),
                        fail_group("g2", [echo("3").into(), echo("4").into()]).into(),
                        echo("5").into(),
                    ],
                )
                .into(),
                continue_group("g3", Vec::new()).into(),
                echo("6").into(),
            ],
        );

        assert_eq!(
            names(plan.tasks().as_slice()),
            vec!["echo: 1", "echo: 2", "echo: 3", "echo: 4", "echo: 5", "echo: 6"]
        );
    }

    #[test]
    fn task_runs_at_most_once() {
        let mut task = echo("once");
        assert_eq!(
            task.call().expect("first call should run"),
            StepOutput::Single(StepResult::Ok)
        );
        assert!(task.has_run());
        let err = task.call().expect_err("second call should be rejected");
        assert!(matches!(err, TaskError::AlreadyExecuted(name) if name == "echo: once"));
    }

    #[test]
    fn on_error_latches_a_fail_group() {
        let mut group = fail_group("compile", [echo("x").into()]);
        group.on_error(StepResult::Ok, &TaskError::Fatal(String::from("boom")));
        assert!(group.policy().is_halted());
        assert!(!group.can_continue(StepResult::Ok));
    }

    #[test]
    fn only_process_and_io_failures_are_recoverable() {
        assert!(TaskError::Io(std::io::Error::other("disk")).is_recoverable());
        assert!(!TaskError::Interrupted.is_recoverable());
        assert!(!TaskError::Fatal(String::from("bug")).is_recoverable());
    }

    #[test]
    fn killed_process_converts_to_interruption() {
        let killed = TaskError::from(ProcessError::Interrupted {
            program: String::from("sleep"),
        });
        assert!(matches!(killed, TaskError::Interrupted));

        let failed = TaskError::from(ProcessError::CommandFailed {
            program: String::from("make"),
            args: Vec::new(),
            status_code: 2,
            stderr: String::new(),
        });
        assert!(failed.is_recoverable());
    }
}
