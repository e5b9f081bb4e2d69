use std::path::PathBuf;

use benchbuild_core::db::RunStore;
use benchbuild_core::environments::domain::{
    CreateBenchbuildBase, CreateImage, DeleteImage, ExportImage, ImportImage, RunProjectContainer,
    UpdateImage,
};
use benchbuild_core::environments::{bootstrap, load_image_declaration, BusReport, Command};
use benchbuild_core::experiment::{load_projects, run_experiment, select_projects, ExperimentConfig};
use benchbuild_core::process::StdProcessRunner;
use benchbuild_core::settings::{load_settings, Settings};
use benchbuild_core::signals::{install_termination_handler, TERMINATION_EXIT_CODE};
use benchbuild_core::tasks::{PolicyKind, TaskError};
use serde_json::json;
use tracing::level_filters::LevelFilter;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Exit status when no project matched the selection.
const NOTHING_SELECTED_EXIT_CODE: i32 = -2;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let code = match dispatch(cli_args) {
        Ok(code) => code,
        Err(error) => {
            error!(%error, "benchbuild failed");
            eprintln!("error: {error}");
            1
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn dispatch(mut args: Vec<String>) -> CliResult<i32> {
    let mut config_path = None::<PathBuf>;
    if args.first().map(String::as_str) == Some("--config") {
        let path = args
            .get(1)
            .cloned()
            .ok_or_else(|| std::io::Error::other("Missing value for --config"))?;
        config_path = Some(PathBuf::from(path));
        args.drain(..2);
    }

    let Some(command) = args.first().cloned() else {
        print_usage();
        return Ok(2);
    };
    let rest = args.split_off(1);
    if rest
        .iter()
        .take_while(|arg| arg.as_str() != "--")
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_usage();
        return Ok(0);
    }

    let cwd = std::env::current_dir()?;
    let load = || load_settings(config_path.as_deref(), cwd.as_path());
    match (command.as_str(), rest.split_first()) {
        ("run", _) => run_projects_cli(&load()?, parse_run_cli_args(rest.as_slice())?),
        ("image", Some((action, flags))) => {
            let command = parse_image_cli_args(action.as_str(), flags)?;
            publish(&load()?, command)
        }
        ("container", Some((action, flags))) if action == "run" => {
            let command = parse_container_run_cli_args(flags)?;
            publish(&load()?, command)
        }
        ("-h" | "--help", _) => {
            print_usage();
            Ok(0)
        }
        (unknown, _) => Err(std::io::Error::other(format!(
            "Unknown command: {unknown}\n\nUse --help for usage."
        ))
        .into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunCliArgs {
    projects: PathBuf,
    experiment: String,
    filters: Vec<String>,
    fail_fast: bool,
}

fn parse_run_cli_args(args: &[String]) -> CliResult<RunCliArgs> {
    let mut projects = None::<PathBuf>;
    let mut experiment = String::from("raw");
    let mut filters = Vec::new();
    let mut fail_fast = false;

    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> CliResult<String> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--projects" => {
                projects = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--experiment" => {
                experiment = needs_value(i)?;
                i += 2;
            }
            "--filter" => {
                filters.push(needs_value(i)?);
                i += 2;
            }
            "--fail-fast" => {
                fail_fast = true;
                i += 1;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }

    let projects = projects.ok_or_else(|| std::io::Error::other("Missing required --projects"))?;
    let experiment = Some(experiment.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| std::io::Error::other("--experiment must not be empty"))?;
    Ok(RunCliArgs {
        projects,
        experiment,
        filters,
        fail_fast,
    })
}

/// Flags of the `image` and `container` subcommands.
#[derive(Debug, Default)]
struct ContainerFlags {
    file: Option<PathBuf>,
    image: Option<String>,
    name: Option<String>,
    out: Option<PathBuf>,
    input: Option<PathBuf>,
    build_dir: Option<PathBuf>,
    trailing: Vec<String>,
}

fn parse_container_flags(args: &[String]) -> CliResult<ContainerFlags> {
    let mut flags = ContainerFlags::default();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> CliResult<String> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--file" => flags.file = Some(PathBuf::from(needs_value(i)?)),
            "--image" => flags.image = Some(needs_value(i)?),
            "--name" => flags.name = Some(needs_value(i)?),
            "--out" => flags.out = Some(PathBuf::from(needs_value(i)?)),
            "--in" => flags.input = Some(PathBuf::from(needs_value(i)?)),
            "--build-dir" => flags.build_dir = Some(PathBuf::from(needs_value(i)?)),
            "--" => {
                flags.trailing = args[i + 1..].to_vec();
                break;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
        i += 2;
    }
    Ok(flags)
}

fn required<T>(value: Option<T>, flag: &str) -> CliResult<T> {
    value.ok_or_else(|| std::io::Error::other(format!("Missing required {flag}")).into())
}

fn parse_image_cli_args(action: &str, args: &[String]) -> CliResult<Command> {
    let flags = parse_container_flags(args)?;
    let declared = |file: Option<PathBuf>| -> CliResult<_> {
        let path = required(file, "--file")?;
        Ok(load_image_declaration(path.as_path())?.into_container_image())
    };
    let command: Command = match action {
        "create" => {
            let (name, layers) = declared(flags.file)?;
            CreateImage { name, layers }.into()
        }
        "base" => {
            let (name, layers) = declared(flags.file)?;
            CreateBenchbuildBase { name, layers }.into()
        }
        "update" => {
            let (name, layers) = declared(flags.file)?;
            UpdateImage { name, layers }.into()
        }
        "export" => ExportImage {
            image: required(flags.image, "--image")?,
            out_path: required(flags.out, "--out")?,
        }
        .into(),
        "import" => ImportImage {
            image: required(flags.image, "--image")?,
            in_path: required(flags.input, "--in")?,
        }
        .into(),
        "delete" => DeleteImage {
            name: required(flags.image, "--image")?,
        }
        .into(),
        unknown => {
            return Err(std::io::Error::other(format!(
                "Unknown image action: {unknown}\n\nUse --help for usage."
            ))
            .into())
        }
    };
    Ok(command)
}

fn parse_container_run_cli_args(args: &[String]) -> CliResult<Command> {
    let flags = parse_container_flags(args)?;
    Ok(RunProjectContainer {
        image: required(flags.image, "--image")?,
        name: required(flags.name, "--name")?,
        build_dir: flags.build_dir,
        args: flags.trailing,
    }
    .into())
}

fn run_projects_cli(settings: &Settings, parsed: RunCliArgs) -> CliResult<i32> {
    let projects = select_projects(load_projects(parsed.projects.as_path())?, &parsed.filters);
    if projects.is_empty() {
        warn!(filters = ?parsed.filters, "no project matched the selection");
        eprintln!("No projects selected.");
        return Ok(NOTHING_SELECTED_EXIT_CODE);
    }

    let policy = if parsed.fail_fast {
        PolicyKind::Fail
    } else {
        PolicyKind::Continue
    };
    let config = ExperimentConfig::new(parsed.experiment).with_policy(policy);
    let store = RunStore::new(settings.db.path.as_path());
    let cancellation = install_termination_handler()?;
    let runner = StdProcessRunner::new().with_cancellation(cancellation.clone());

    match run_experiment(&config, projects.as_slice(), &runner, store, Some(cancellation)) {
        Ok(outcome) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "ok": outcome.succeeded(),
                    "experiment": outcome.experiment,
                    "worst": outcome.worst(),
                    "results": outcome.results,
                }))?
            );
            Ok(if outcome.succeeded() { 0 } else { 1 })
        }
        Err(TaskError::Interrupted) => {
            eprintln!("Interrupted.");
            Ok(TERMINATION_EXIT_CODE)
        }
        Err(error) => Err(error.into()),
    }
}

fn publish(settings: &Settings, command: Command) -> CliResult<i32> {
    let cancellation = install_termination_handler()?;
    let runner = StdProcessRunner::new().with_cancellation(cancellation.clone());
    let mut bus = bootstrap(settings, runner, Some(cancellation));
    match bus.handle(command) {
        Ok(report) => print_report(&report),
        Err(error) if error.is_interrupted() => {
            eprintln!("Interrupted.");
            Ok(TERMINATION_EXIT_CODE)
        }
        Err(error) => Err(error.into()),
    }
}

fn print_report(report: &BusReport) -> CliResult<i32> {
    for notice in &report.notices {
        eprintln!("{notice}");
    }
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(if report.notices.is_empty() { 0 } else { 1 })
}

fn print_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  benchbuild [--config PATH] <command> [flags]\n\n",
        "Commands:\n",
        "  run --projects FILE [--experiment NAME] [--filter NAME]... [--fail-fast]\n",
        "  image create|base|update --file FILE\n",
        "  image export --image TAG --out PATH\n",
        "  image import --image TAG --in PATH\n",
        "  image delete --image TAG\n",
        "  container run --image TAG --name NAME [--build-dir PATH] [-- ARGS...]\n\n",
        "Settings are read from --config, else the nearest .benchbuild.yml upwards,\n",
        "then overridden by BB_* environment variables.\n"
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn parse_run_requires_projects() {
        let err = parse_run_cli_args(&[]).expect_err("projects should be required");
        assert!(err.to_string().contains("--projects"));
    }

    #[test]
    fn parse_run_collects_filters() {
        let parsed = parse_run_cli_args(&args(&[
            "--projects",
            "projects.yml",
            "--filter",
            "gzip",
            "--filter",
            "compression",
            "--fail-fast",
        ]))
        .expect("parse should succeed");
        assert_eq!(parsed.projects, PathBuf::from("projects.yml"));
        assert_eq!(parsed.experiment, "raw");
        assert_eq!(parsed.filters, vec!["gzip", "compression"]);
        assert!(parsed.fail_fast);
    }

    #[test]
    fn parse_run_rejects_unknown_flags() {
        let err = parse_run_cli_args(&args(&["--projects", "p.yml", "--jobs", "4"]))
            .expect_err("unknown flag should fail");
        assert!(err.to_string().contains("--jobs"));
    }

    #[test]
    fn parse_image_delete_needs_an_image() {
        let err = parse_image_cli_args("delete", &[]).expect_err("image should be required");
        assert!(err.to_string().contains("--image"));
        let command = parse_image_cli_args("delete", &args(&["--image", "bb-gzip"]))
            .expect("parse should succeed");
        assert!(matches!(command, Command::DeleteImage(cmd) if cmd.name == "bb-gzip"));
    }

    #[test]
    fn parse_image_create_reads_the_declaration() {
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let path = dir.path().join("image.yml");
        std::fs::write(
            &path,
            "name: bb-gzip\nlayers:\n  - from: debian:bookworm\n  - workingdir: /app\n",
        )
        .expect("declaration should be written");

        let command = parse_image_cli_args("create", &args(&["--file", &path.to_string_lossy()]))
            .expect("parse should succeed");
        let Command::CreateImage(cmd) = command else {
            panic!("expected CreateImage");
        };
        assert_eq!(cmd.name, "bb-gzip");
        assert_eq!(cmd.layers.base(), Some("debian:bookworm"));
    }

    #[test]
    fn parse_container_run_keeps_trailing_args() {
        let command = parse_container_run_cli_args(&args(&[
            "--image",
            "bb-gzip",
            "--name",
            "gzip-1",
            "--build-dir",
            "/results",
            "--",
            "--fast",
            "input.txt",
        ]))
        .expect("parse should succeed");
        let Command::RunProjectContainer(cmd) = command else {
            panic!("expected RunProjectContainer");
        };
        assert_eq!(cmd.build_dir, Some(PathBuf::from("/results")));
        assert_eq!(cmd.args, vec!["--fast", "input.txt"]);
    }
}
