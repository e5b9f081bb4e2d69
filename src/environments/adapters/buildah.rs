use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{parse_env_entries, BackendError};
use crate::environments::domain::{Container, Layer};
use crate::process::{run_checked, CommandOutput, CommandSpec, ProcessRunner};
use crate::settings::ContainerSettings;

/// Image entry as listed by `buildah images --json`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BuildahImage {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Buildah<R> {
    runner: R,
    program: String,
    root: PathBuf,
    runroot: PathBuf,
    storage_driver: String,
}

impl<R> Buildah<R>
where
    R: ProcessRunner,
{
    pub fn new(settings: &ContainerSettings, runner: R) -> Self {
        Self {
            runner,
            program: settings.buildah.clone(),
            root: settings.root.clone(),
            runroot: settings.runroot.clone(),
            storage_driver: settings.storage_driver.clone(),
        }
    }

    fn base_command(&self) -> CommandSpec {
        CommandSpec::new(self.program.as_str())
            .arg("--root")
            .arg(self.root.to_string_lossy())
            .arg("--runroot")
            .arg(self.runroot.to_string_lossy())
            .arg("--storage-driver")
            .arg(self.storage_driver.as_str())
    }

    pub fn build_from_command(&self, base: &str) -> CommandSpec {
        self.base_command().arg("from").arg(base)
    }

    pub fn build_commit_command(&self, container_id: &str, tag: &str) -> CommandSpec {
        self.base_command().arg("commit").arg(container_id).arg(tag)
    }

    pub fn build_rm_command(&self, container_id: &str) -> CommandSpec {
        self.base_command().arg("rm").arg(container_id)
    }

    pub fn build_images_command(&self, tag: &str) -> CommandSpec {
        self.base_command().arg("images").arg("--json").arg(tag)
    }

    pub fn build_inspect_command(&self, tag: &str) -> CommandSpec {
        self.base_command()
            .args(["inspect", "--type", "image"])
            .arg(tag)
    }

    /// The one backend command realizing `layer`, or `None` for layers that
    /// run in-process.
    pub fn build_layer_command(
        &self,
        container: &Container,
        layer: &Layer,
    ) -> Result<Option<CommandSpec>, BackendError> {
        let id = container.container_id.as_str();
        let spec = match layer {
            Layer::From { base } => return Err(BackendError::MisplacedFrom(base.clone())),
            Layer::Add {
                sources,
                destination,
            } => self
                .base_command()
                .args(["add", "--add-history", id])
                .args(sources.iter().map(String::as_str))
                .arg(destination.as_str()),
            Layer::Copy {
                sources,
                destination,
            } => self
                .base_command()
                .args(["copy", "--add-history", id])
                .args(sources.iter().map(String::as_str))
                .arg(destination.as_str()),
            Layer::Run {
                command,
                args,
                kwargs,
            } => {
                let mut spec = self.base_command().arg("run");
                for (key, value) in kwargs {
                    spec = spec.arg(format!("--{key}")).arg(value.as_str());
                }
                spec.arg(id)
                    .arg("--")
                    .arg(command.as_str())
                    .args(args.iter().map(String::as_str))
            }
            Layer::Context { .. } => return Ok(None),
            Layer::Env(env) => {
                let mut spec = self.base_command().arg("config");
                for (key, value) in env {
                    spec = spec.arg("--env").arg(format!("{key}={value}"));
                }
                spec.arg(id)
            }
            Layer::WorkingDirectory(directory) => self
                .base_command()
                .args(["config", "--workingdir", directory.as_str(), id]),
            Layer::EntryPoint(command) => self
                .base_command()
                .args(["config", "--entrypoint"])
                .arg(Value::from(command.clone()).to_string())
                .arg(id),
            Layer::SetCommand(command) => self
                .base_command()
                .args(["config", "--cmd"])
                .arg(Value::from(command.clone()).to_string())
                .arg(id),
        };
        Ok(Some(match container.context() {
            Some(context) => spec.with_cwd(context),
            None => spec,
        }))
    }

    /// Creates a working container from `base` and returns its id.
    pub fn from(&self, base: &str) -> Result<String, BackendError> {
        let spec = self.build_from_command(base);
        let output = run_checked(&self.runner, &spec)?;
        container_id_from(&spec, &output)
    }

    pub fn spawn_layer(&self, container: &Container, layer: &Layer) -> Result<(), BackendError> {
        debug!(container = %container.container_id, %layer, "spawning layer");
        if let Layer::Context { name, func } = layer {
            let context = container
                .context()
                .ok_or_else(|| BackendError::MissingContext(container.container_id.clone()))?;
            return func
                .call(context)
                .map_err(|source| BackendError::ContextHook {
                    name: name.clone(),
                    source,
                });
        }
        if let Some(spec) = self.build_layer_command(container, layer)? {
            run_checked(&self.runner, &spec)?;
        }
        Ok(())
    }

    pub fn commit(&self, container_id: &str, tag: &str) -> Result<(), BackendError> {
        run_checked(&self.runner, &self.build_commit_command(container_id, tag))?;
        Ok(())
    }

    pub fn remove(&self, container_id: &str) -> Result<(), BackendError> {
        run_checked(&self.runner, &self.build_rm_command(container_id))?;
        Ok(())
    }

    /// Looks `tag` up in local storage. A nonzero exit means "not known".
    pub fn find_image(&self, tag: &str) -> Result<Option<BuildahImage>, BackendError> {
        let spec = self.build_images_command(tag);
        let output = self.runner.run(&spec)?;
        if !output.success() {
            debug!(image = tag, stderr = %output.stderr.trim(), "image not found");
            return Ok(None);
        }
        let images: Vec<BuildahImage> = decode(&spec, output.stdout.as_str())?;
        Ok(images.into_iter().next())
    }

    /// Environment baked into the image config.
    pub fn image_env(&self, tag: &str) -> Result<BTreeMap<String, String>, BackendError> {
        let spec = self.build_inspect_command(tag);
        let output = run_checked(&self.runner, &spec)?;
        let inspected: Value = decode(&spec, output.stdout.as_str())?;
        let entries = inspected
            .pointer("/OCIv1/config/Env")
            .and_then(Value::as_array)
            .into_iter()
            .flatten();
        Ok(parse_env_entries(entries))
    }
}

pub(crate) fn decode<T>(spec: &CommandSpec, stdout: &str) -> Result<T, BackendError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_str(stdout).map_err(|source| BackendError::Decode {
        command: spec.display(),
        source,
    })
}

pub(crate) fn container_id_from(
    spec: &CommandSpec,
    output: &CommandOutput,
) -> Result<String, BackendError> {
    output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
        .ok_or_else(|| BackendError::MissingContainerId(spec.display()))
}
