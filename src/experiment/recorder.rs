use tracing::{info, warn};

use crate::db::{RunRecord, RunStatus, RunStore};
use crate::process::{CommandOutput, CommandSpec, ProcessError, ProcessRunner};
use crate::signals::Cancellation;
use crate::tasks::TaskError;

/// Executes measured commands of one project run and persists each of them
/// as a run with its log.
pub struct RunRecorder<'r> {
    store: &'r RunStore,
    runner: &'r dyn ProcessRunner,
    group_id: String,
    project: String,
    experiment_name: String,
    cancellation: Option<Cancellation>,
    runs: Vec<RunRecord>,
}

impl<'r> RunRecorder<'r> {
    pub fn new(
        store: &'r RunStore,
        runner: &'r dyn ProcessRunner,
        group_id: impl Into<String>,
        project: impl Into<String>,
        experiment_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            runner,
            group_id: group_id.into(),
            project: project.into(),
            experiment_name: experiment_name.into(),
            cancellation: None,
            runs: Vec::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: Option<Cancellation>) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Runs recorded so far, in execution order.
    pub fn runs(&self) -> &[RunRecord] {
        self.runs.as_slice()
    }

    /// Runs `spec` as a tracked run.
    ///
    /// The run row is created before the process starts and closed with the
    /// exit code and captured output afterwards. A nonzero exit is returned
    /// as [`ProcessError::CommandFailed`] once it has been persisted.
    pub fn track(&mut self, spec: CommandSpec) -> Result<CommandOutput, TaskError> {
        if self
            .cancellation
            .as_ref()
            .is_some_and(Cancellation::is_cancelled)
        {
            return Err(TaskError::Interrupted);
        }

        let command = spec.display();
        let mut run = self.store.create_run(
            command.as_str(),
            self.project.as_str(),
            self.experiment_name.as_str(),
            self.group_id.as_str(),
        )?;

        let output = match self.runner.run(&spec) {
            Ok(output) => output,
            Err(error) => {
                let stderr = error.to_string();
                if let Err(db_error) = self.store.finish_run(run.id, None, "", stderr.as_str()) {
                    warn!(run_id = run.id, error = %db_error, "failed to close run after the process failed");
                }
                return Err(error.into());
            }
        };

        run.status = self.store.finish_run(
            run.id,
            Some(output.status_code),
            output.stdout.as_str(),
            output.stderr.as_str(),
        )?;
        info!(
            run_id = run.id,
            project = %self.project,
            %command,
            status = run.status.as_str(),
            "run finished"
        );
        let failed = run.status == RunStatus::Failed;
        self.runs.push(run);

        if failed {
            return Err(ProcessError::CommandFailed {
                program: spec.program,
                args: spec.args,
                status_code: output.status_code,
                stderr: output.stderr,
            }
            .into());
        }
        Ok(output)
    }
}
