use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::recorder::RunRecorder;
use crate::process::{run_checked, CommandSpec, ProcessRunner};
use crate::tasks::{StepResult, TaskError};

/// A benchmark project: how to build it, run it and clean up after it.
///
/// `run` must execute its measured commands through the [`RunRecorder`] so
/// every invocation ends up in the database.
pub trait Project {
    fn name(&self) -> &str;
    fn group(&self) -> &str;
    fn compile(&self, runner: &dyn ProcessRunner) -> Result<StepResult, TaskError>;
    fn run(&self, recorder: &mut RunRecorder<'_>) -> Result<StepResult, TaskError>;
    fn clean(&self, runner: &dyn ProcessRunner) -> Result<StepResult, TaskError>;
}

/// One step command: a shell line, or an argv list run without a shell.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ShellCommand {
    Line(String),
    Argv(Vec<String>),
}

impl ShellCommand {
    pub fn to_spec(&self) -> Option<CommandSpec> {
        match self {
            Self::Line(line) if line.trim().is_empty() => None,
            Self::Line(line) => Some(CommandSpec::new("sh").args(["-c", line.as_str()])),
            Self::Argv(argv) => {
                let (program, args) = argv.split_first()?;
                Some(CommandSpec::new(program.as_str()).args(args.iter().map(String::as_str)))
            }
        }
    }
}

/// A project declared in a projects file.
///
/// ```yaml
/// projects:
///   - name: gzip
///     group: compression
///     workdir: build/gzip
///     env: { CFLAGS: -O2 }
///     compile: ["./configure", "make -j4"]
///     run: [[./gzip, -k, input.txt]]
///     clean: ["make clean"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShellProject {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub compile: Vec<ShellCommand>,
    #[serde(default)]
    pub run: Vec<ShellCommand>,
    #[serde(default)]
    pub clean: Vec<ShellCommand>,
}

fn default_group() -> String {
    String::from("default")
}

impl ShellProject {
    fn specs<'c>(&'c self, commands: &'c [ShellCommand]) -> impl Iterator<Item = CommandSpec> + 'c {
        commands.iter().filter_map(ShellCommand::to_spec).map(move |spec| {
            let spec = self
                .env
                .iter()
                .fold(spec, |spec, (key, value)| spec.with_env(key.as_str(), value.as_str()));
            match self.workdir.as_deref() {
                Some(workdir) => spec.with_cwd(workdir),
                None => spec,
            }
        })
    }

    fn run_all(&self, runner: &dyn ProcessRunner, commands: &[ShellCommand]) -> Result<StepResult, TaskError> {
        for spec in self.specs(commands) {
            debug!(project = %self.name, command = %spec.display(), "running step command");
            run_checked(runner, &spec)?;
        }
        Ok(StepResult::Ok)
    }

    /// Resolves a relative `workdir` against the directory of the file that
    /// declared the project.
    fn anchored_at(mut self, base: &Path) -> Self {
        self.workdir = self
            .workdir
            .map(|dir| if dir.is_absolute() { dir } else { base.join(dir) });
        self
    }
}

impl Project for ShellProject {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    fn group(&self) -> &str {
        self.group.as_str()
    }

    fn compile(&self, runner: &dyn ProcessRunner) -> Result<StepResult, TaskError> {
        self.run_all(runner, self.compile.as_slice())
    }

    fn run(&self, recorder: &mut RunRecorder<'_>) -> Result<StepResult, TaskError> {
        for spec in self.specs(self.run.as_slice()) {
            recorder.track(spec)?;
        }
        Ok(StepResult::Ok)
    }

    fn clean(&self, runner: &dyn ProcessRunner) -> Result<StepResult, TaskError> {
        self.run_all(runner, self.clean.as_slice())
    }
}

#[derive(Debug, Deserialize)]
struct ProjectsFile {
    #[serde(default)]
    projects: Vec<ShellProject>,
}

#[derive(Debug, Error)]
pub enum ProjectsError {
    #[error("failed to read projects file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse projects file '{path}': {message}")]
    Parse { path: String, message: String },
    #[error("projects file '{path}' declares '{name}' more than once")]
    Duplicate { path: String, name: String },
    #[error("project in '{0}' has an empty name")]
    Unnamed(String),
}

/// Reads a YAML (or `.json`) projects file.
pub fn load_projects(path: &Path) -> Result<Vec<ShellProject>, ProjectsError> {
    let display = path.display().to_string();
    let raw = fs::read_to_string(path).map_err(|source| ProjectsError::Read {
        path: display.clone(),
        source,
    })?;
    let parse_error = |message: String| ProjectsError::Parse {
        path: display.clone(),
        message,
    };
    let tree = match path.extension().and_then(|v| v.to_str()) {
        Some("json") => serde_json::from_str::<Value>(raw.as_str())
            .map_err(|error| parse_error(error.to_string()))?,
        _ => serde_yaml::from_str::<Value>(raw.as_str())
            .map_err(|error| parse_error(error.to_string()))?,
    };
    let file: ProjectsFile =
        serde_json::from_value(tree).map_err(|error| parse_error(error.to_string()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut names = BTreeSet::new();
    let mut projects = Vec::with_capacity(file.projects.len());
    for project in file.projects {
        if project.name.trim().is_empty() {
            return Err(ProjectsError::Unnamed(display));
        }
        if !names.insert(project.name.clone()) {
            return Err(ProjectsError::Duplicate {
                path: display,
                name: project.name,
            });
        }
        projects.push(project.anchored_at(base));
    }
    Ok(projects)
}

/// Projects whose name or group matches one of `filters`; all of them when
/// no filter is given.
pub fn select_projects<P>(projects: Vec<P>, filters: &[String]) -> Vec<P>
where
    P: Project,
{
    if filters.is_empty() {
        return projects;
    }
    projects
        .into_iter()
        .filter(|project| {
            filters
                .iter()
                .any(|filter| filter == project.name() || filter == project.group())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandOutput, ProcessError};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRunner {
        seen: Mutex<Vec<CommandSpec>>,
        next: Mutex<Option<CommandOutput>>,
    }

    impl ProcessRunner for FakeRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
            self.seen
                .lock()
                .expect("fake runner mutex poisoned")
                .push(spec.clone());
            Ok(self
                .next
                .lock()
                .expect("fake runner mutex poisoned")
                .take()
                .unwrap_or(CommandOutput {
                    status_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                }))
        }
    }

    fn write_projects(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("projects.yml");
        fs::write(&path, body).expect("projects file should be written");
        path
    }

    #[test]
    fn loads_shell_projects_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let path = write_projects(
            dir.path(),
            r#"
projects:
  - name: gzip
    group: compression
    workdir: build/gzip
    env: { CFLAGS: -O2 }
    compile: ["make -j4"]
    run: [[./gzip, -k, input.txt]]
  - name: lua
"#,
        );
        let projects = load_projects(&path).expect("projects should load");
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].group, "compression");
        assert_eq!(projects[0].workdir, Some(dir.path().join("build/gzip")));
        assert_eq!(
            projects[0].run,
            vec![ShellCommand::Argv(vec![
                String::from("./gzip"),
                String::from("-k"),
                String::from("input.txt")
            ])]
        );
        assert_eq!(projects[1].group, "default");
        assert!(projects[1].clean.is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let path = write_projects(dir.path(), "projects:\n  - name: a\n  - name: a\n");
        let err = load_projects(&path).expect_err("duplicates should fail");
        assert!(matches!(err, ProjectsError::Duplicate { name, .. } if name == "a"));
    }

    #[test]
    fn malformed_file_reports_the_path() {
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let path = write_projects(dir.path(), "projects: [name: ");
        let err = load_projects(&path).expect_err("bad yaml should fail");
        assert!(err.to_string().contains("projects.yml"));
    }

    #[test]
    fn shell_lines_go_through_sh_and_argv_runs_directly() {
        assert_eq!(
            ShellCommand::Line(String::from("make -j4")).to_spec(),
            Some(CommandSpec::new("sh").args(["-c", "make -j4"]))
        );
        assert_eq!(
            ShellCommand::Argv(vec![String::from("ls"), String::from("-l")]).to_spec(),
            Some(CommandSpec::new("ls").arg("-l"))
        );
        assert_eq!(ShellCommand::Argv(Vec::new()).to_spec(), None);
        assert_eq!(ShellCommand::Line(String::from("  ")).to_spec(), None);
    }

    #[test]
    fn compile_applies_workdir_and_env() {
        let project = ShellProject {
            name: String::from("gzip"),
            group: default_group(),
            workdir: Some(PathBuf::from("/src/gzip")),
            env: BTreeMap::from([(String::from("CC"), String::from("clang"))]),
            compile: vec![ShellCommand::Line(String::from("make"))],
            run: Vec::new(),
            clean: Vec::new(),
        };
        let runner = FakeRunner::default();
        assert_eq!(
            project.compile(&runner).expect("compile should succeed"),
            StepResult::Ok
        );

        let seen = runner.seen.lock().expect("fake runner mutex poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].cwd, Some(PathBuf::from("/src/gzip")));
        assert_eq!(seen[0].env, vec![(String::from("CC"), String::from("clang"))]);
    }

    #[test]
    fn failing_compile_command_is_a_process_error() {
        let project = ShellProject {
            name: String::from("broken"),
            group: default_group(),
            workdir: None,
            env: BTreeMap::new(),
            compile: vec![
                ShellCommand::Line(String::from("false")),
                ShellCommand::Line(String::from("never")),
            ],
            run: Vec::new(),
            clean: Vec::new(),
        };
        let runner = FakeRunner::default();
        *runner.next.lock().expect("fake runner mutex poisoned") = Some(CommandOutput {
            status_code: 2,
            stdout: String::new(),
            stderr: String::from("boom"),
        });

        let err = project.compile(&runner).expect_err("nonzero exit should fail");
        assert!(matches!(err, TaskError::Process(_)));
        assert_eq!(runner.seen.lock().expect("fake runner mutex poisoned").len(), 1);
    }

    #[test]
    fn filters_match_names_and_groups() {
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let path = write_projects(
            dir.path(),
            "projects:\n  - { name: gzip, group: compression }\n  - { name: bzip2, group: compression }\n  - { name: lua, group: interpreters }\n",
        );
        let projects = load_projects(&path).expect("projects should load");

        let names = |selected: Vec<ShellProject>| {
            selected.into_iter().map(|p| p.name).collect::<Vec<_>>()
        };
        assert_eq!(
            names(select_projects(projects.clone(), &[String::from("compression")])),
            vec!["gzip", "bzip2"]
        );
        assert_eq!(
            names(select_projects(projects.clone(), &[String::from("lua")])),
            vec!["lua"]
        );
        assert_eq!(names(select_projects(projects.clone(), &[])).len(), 3);
        assert!(select_projects(projects, &[String::from("nope")]).is_empty());
    }
}
