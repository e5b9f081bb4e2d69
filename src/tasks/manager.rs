use tracing::{debug, warn};

use super::contexts::{GlobalContext, ScopeExit, TaskContext};
use super::{merge_results, GroupScope, Node, StepOutput, StepResult, Task, TaskError, TaskGroup};
use crate::signals::Cancellation;

struct GroupSlot {
    scope: GroupScope,
    parent: Option<usize>,
}

struct Leaf<'a> {
    task: Task<'a>,
    group: usize,
}

/// Runs a plan's leaf tasks in order.
///
/// A group whose policy has stopped skips its own remaining descendants.
/// Tasks outside that group keep running unless an enclosing group stopped
/// too; every result is fed to the policy of each enclosing group.
pub struct TaskManager<'a> {
    plan: TaskGroup<'a>,
    task_contexts: Vec<Box<dyn TaskContext + 'a>>,
    global_contexts: Vec<Box<dyn GlobalContext + 'a>>,
    cancellation: Option<Cancellation>,
}

impl<'a> TaskManager<'a> {
    pub fn new(plan: TaskGroup<'a>) -> Self {
        Self {
            plan,
            task_contexts: Vec::new(),
            global_contexts: Vec::new(),
            cancellation: None,
        }
    }

    pub fn with_task_context(mut self, context: impl TaskContext + 'a) -> Self {
        self.task_contexts.push(Box::new(context));
        self
    }

    pub fn with_global_context(mut self, context: impl GlobalContext + 'a) -> Self {
        self.global_contexts.push(Box::new(context));
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// Executes the plan once and returns one result per executed leaf,
    /// with list outputs spliced in place.
    pub fn run(self) -> Result<Vec<StepResult>, TaskError> {
        let Self {
            plan,
            mut task_contexts,
            mut global_contexts,
            cancellation,
        } = self;

        let mut groups = Vec::new();
        let mut leaves = Vec::new();
        flatten(plan, None, &mut groups, &mut leaves);

        let mut entered = 0usize;
        let mut outcome = Ok(Vec::new());
        for context in global_contexts.iter_mut() {
            if let Err(error) = context.enter() {
                outcome = Err(error);
                break;
            }
            entered += 1;
        }

        if outcome.is_ok() {
            outcome = execute(
                groups,
                leaves,
                task_contexts.as_mut_slice(),
                cancellation.as_ref(),
            );
        }

        for context in global_contexts[..entered].iter_mut().rev() {
            let exit = match &outcome {
                Ok(results) => ScopeExit::Completed(StepResult::worst(results.iter().copied())),
                Err(error) => ScopeExit::Failed(error),
            };
            context.exit(exit);
        }
        outcome
    }
}

fn flatten<'a>(
    group: TaskGroup<'a>,
    parent: Option<usize>,
    groups: &mut Vec<GroupSlot>,
    leaves: &mut Vec<Leaf<'a>>,
) {
    let (scope, children) = group.into_parts();
    let index = groups.len();
    groups.push(GroupSlot { scope, parent });
    for child in children {
        match child {
            Node::Task(task) => leaves.push(Leaf { task, group: index }),
            Node::Group(nested) => flatten(nested, Some(index), groups, leaves),
        }
    }
}

fn ancestry(groups: &[GroupSlot], start: usize) -> impl Iterator<Item = usize> + '_ {
    std::iter::successors(Some(start), move |index| groups[*index].parent)
}

fn execute<'a>(
    mut groups: Vec<GroupSlot>,
    leaves: Vec<Leaf<'a>>,
    task_contexts: &mut [Box<dyn TaskContext + 'a>],
    cancellation: Option<&Cancellation>,
) -> Result<Vec<StepResult>, TaskError> {
    let mut results = Vec::new();

    for Leaf { mut task, group } in leaves {
        let prior = results.last().copied().unwrap_or(StepResult::Ok);

        if cancellation.is_some_and(Cancellation::is_cancelled) {
            let error = TaskError::Interrupted;
            groups[group].scope.on_error(prior, &error);
            return Err(error);
        }

        if let Some(halted) = ancestry(&groups, group).find(|i| groups[*i].scope.policy.is_halted())
        {
            debug!(
                task = %task.name(),
                group = %groups[halted].scope.name,
                "skipping task, group stopped"
            );
            continue;
        }

        let output = run_in_contexts(&mut task, task_contexts, |task| {
            catch_failures(task, &mut groups[group].scope, prior)
        })?;

        let worst = output.worst();
        for index in ancestry(&groups, group).collect::<Vec<_>>() {
            groups[index].scope.policy.can_continue(worst);
        }
        merge_results(&mut results, output);
    }

    Ok(results)
}

/// Turns recoverable failures into [`StepResult::Error`] after reporting them
/// to the owning group. Interruption is reported and then propagated.
fn catch_failures(
    task: &mut Task<'_>,
    owner: &mut GroupScope,
    prior: StepResult,
) -> Result<StepOutput, TaskError> {
    match task.call() {
        Ok(output) => Ok(output),
        Err(error) if error.is_recoverable() => {
            owner.on_error(prior, &error);
            Ok(StepOutput::Single(StepResult::Error))
        }
        Err(error @ TaskError::Interrupted) => {
            owner.on_error(prior, &error);
            Err(error)
        }
        Err(error) => {
            warn!(task = %task.name(), %error, "task failed, aborting run");
            Err(error)
        }
    }
}

fn run_in_contexts<'a, F>(
    task: &mut Task<'a>,
    contexts: &mut [Box<dyn TaskContext + 'a>],
    body: F,
) -> Result<StepOutput, TaskError>
where
    F: FnOnce(&mut Task<'a>) -> Result<StepOutput, TaskError>,
{
    let mut entered = 0usize;
    let mut outcome = Ok(StepOutput::Many(Vec::new()));
    for context in contexts.iter_mut() {
        if let Err(error) = context.enter(task) {
            outcome = Err(error);
            break;
        }
        entered += 1;
    }
    if outcome.is_ok() {
        outcome = body(task);
    }
    for context in contexts[..entered].iter_mut().rev() {
        let exit = match &outcome {
            Ok(output) => ScopeExit::Completed(output.worst()),
            Err(error) => ScopeExit::Failed(error),
        };
        context.exit(task, exit);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessError;
    use crate::tasks::{continue_group, echo, fail_group};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Journal = Rc<RefCell<Vec<String>>>;

    fn recorded<'a>(journal: &Journal, name: &str, result: StepResult) -> Node<'a> {
        let journal = Rc::clone(journal);
        let label = name.to_string();
        Task::new(name, "record a call", move || {
            journal.borrow_mut().push(label);
            Ok(result.into())
        })
        .into()
    }

    fn process_failure<'a>(journal: &Journal, name: &str) -> Node<'a> {
        let journal = Rc::clone(journal);
        let label = name.to_string();
        Task::new(name, "fail like a crashed build", move || {
            journal.borrow_mut().push(label.clone());
            Err(ProcessError::CommandFailed {
                program: String::from("make"),
                args: vec![label],
                status_code: 2,
                stderr: String::from("make: *** [all] Error 2"),
            }
            .into())
        })
        .into()
    }

    struct Recorder {
        label: &'static str,
        journal: Journal,
    }

    impl TaskContext for Recorder {
        fn enter(&mut self, task: &Task<'_>) -> Result<(), TaskError> {
            self.journal
                .borrow_mut()
                .push(format!("{} enter {}", self.label, task.name()));
            Ok(())
        }

        fn exit(&mut self, task: &Task<'_>, outcome: ScopeExit<'_>) {
            let detail = match outcome {
                ScopeExit::Completed(result) => result.to_string(),
                ScopeExit::Failed(_) => String::from("failed"),
            };
            self.journal
                .borrow_mut()
                .push(format!("{} exit {} {detail}", self.label, task.name()));
        }
    }

    impl GlobalContext for Recorder {
        fn enter(&mut self) -> Result<(), TaskError> {
            self.journal.borrow_mut().push(format!("{} enter", self.label));
            Ok(())
        }

        fn exit(&mut self, outcome: ScopeExit<'_>) {
            let detail = if outcome.succeeded() { "ok" } else { "failed" };
            self.journal
                .borrow_mut()
                .push(format!("{} exit {detail}", self.label));
        }
    }

    #[test]
    fn nested_echo_groups_all_report_ok() {
        let plan = continue_group(
            "root",
            [
                fail_group("first", [echo("Hello").into(), echo("World").into()]).into(),
                fail_group("second", [echo("Task v2").into(), echo("Task Test").into()]).into(),
            ],
        );

        let results = TaskManager::new(plan).run().expect("run should succeed");
        assert_eq!(results, vec![StepResult::Ok; 4]);
    }

    #[test]
    fn process_failure_stops_the_rest_of_a_fail_group() {
        let journal = Journal::default();
        let plan = fail_group(
            "compile",
            [
                process_failure(&journal, "configure"),
                recorded(&journal, "build", StepResult::Ok),
            ],
        );

        let results = TaskManager::new(plan).run().expect("run should not abort");
        assert_eq!(results, vec![StepResult::Error]);
        assert_eq!(*journal.borrow(), vec![String::from("configure")]);
    }

    #[test]
    fn stopped_group_does_not_stop_siblings_under_continue_parent() {
        let journal = Journal::default();
        let plan = continue_group(
            "experiment",
            [
                fail_group(
                    "gzip",
                    [
                        process_failure(&journal, "gzip compile"),
                        recorded(&journal, "gzip run", StepResult::Ok),
                    ],
                )
                .into(),
                fail_group("bzip2", [recorded(&journal, "bzip2 run", StepResult::Ok)]).into(),
            ],
        );

        let results = TaskManager::new(plan).run().expect("run should not abort");
        assert_eq!(results, vec![StepResult::Error, StepResult::Ok]);
        assert_eq!(
            *journal.borrow(),
            vec![String::from("gzip compile"), String::from("bzip2 run")]
        );
    }

    #[test]
    fn stopped_group_stops_siblings_under_fail_parent() {
        let journal = Journal::default();
        let plan = fail_group(
            "experiment",
            [
                fail_group("gzip", [recorded(&journal, "gzip", StepResult::Unknown)]).into(),
                fail_group("bzip2", [recorded(&journal, "bzip2", StepResult::Ok)]).into(),
            ],
        );

        let results = TaskManager::new(plan).run().expect("run should not abort");
        assert_eq!(results, vec![StepResult::Unknown]);
        assert_eq!(*journal.borrow(), vec![String::from("gzip")]);
    }

    #[test]
    fn list_outputs_are_spliced_into_results() {
        let plan = continue_group(
            "root",
            [
                Task::new("sub-plan", "nested results", || {
                    Ok(vec![StepResult::Ok, StepResult::CanContinue].into())
                })
                .into(),
                echo("after").into(),
            ],
        );

        let results = TaskManager::new(plan).run().expect("run should succeed");
        assert_eq!(
            results,
            vec![StepResult::Ok, StepResult::CanContinue, StepResult::Ok]
        );
    }

    #[test]
    fn contexts_wrap_tasks_and_unwind_in_reverse() {
        let journal = Journal::default();
        let plan = fail_group("g", [process_failure(&journal, "t")]);

        TaskManager::new(plan)
            .with_global_context(Recorder {
                label: "db",
                journal: Rc::clone(&journal),
            })
            .with_global_context(Recorder {
                label: "lock",
                journal: Rc::clone(&journal),
            })
            .with_task_context(Recorder {
                label: "log",
                journal: Rc::clone(&journal),
            })
            .run()
            .expect("run should not abort");

        assert_eq!(
            *journal.borrow(),
            vec![
                "db enter",
                "lock enter",
                "log enter t",
                "t",
                "log exit t ERROR",
                "lock exit failed",
                "db exit failed",
            ]
        );
    }

    #[test]
    fn fatal_errors_abort_the_run_and_still_release_contexts() {
        let journal = Journal::default();
        let plan = continue_group(
            "root",
            [
                Task::new("broken", "programming error", || {
                    Err(TaskError::Fatal(String::from("unexpected state")))
                })
                .into(),
                recorded(&journal, "never", StepResult::Ok),
            ],
        );

        let err = TaskManager::new(plan)
            .with_global_context(Recorder {
                label: "db",
                journal: Rc::clone(&journal),
            })
            .run()
            .expect_err("fatal error should abort");
        assert!(matches!(err, TaskError::Fatal(_)));
        assert_eq!(*journal.borrow(), vec!["db enter", "db exit failed"]);
    }

    #[test]
    fn cancellation_stops_before_the_next_task() {
        let journal = Journal::default();
        let token = Cancellation::new();
        let trigger = token.clone();
        let plan = continue_group(
            "root",
            [
                Task::new("first", "cancel mid-run", move || {
                    trigger.cancel();
                    Ok(StepResult::Ok.into())
                })
                .into(),
                recorded(&journal, "second", StepResult::Ok),
            ],
        );

        let err = TaskManager::new(plan)
            .with_cancellation(token)
            .run()
            .expect_err("cancellation should propagate");
        assert!(matches!(err, TaskError::Interrupted));
        assert!(journal.borrow().is_empty());
    }

    #[test]
    fn interrupted_task_propagates_after_reporting() {
        let plan = continue_group(
            "root",
            [
                Task::new("sleep", "gets interrupted", || Err(TaskError::Interrupted)).into(),
                echo("never").into(),
            ],
        );
        let err = TaskManager::new(plan)
            .run()
            .expect_err("interruption should propagate");
        assert!(matches!(err, TaskError::Interrupted));
    }
}
