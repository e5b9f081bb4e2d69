use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use super::buildah::{container_id_from, decode};
use super::{parse_env_entries, BackendError};
use crate::process::{run_checked, CommandOutput, CommandSpec, ProcessRunner};
use crate::settings::ContainerSettings;

/// A bind mount passed to `podman create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
}

impl Mount {
    fn render(&self) -> String {
        format!(
            "type=bind,source={},target={}",
            self.source.display(),
            self.target
        )
    }
}

#[derive(Debug, Clone)]
pub struct Podman<R> {
    runner: R,
    program: String,
    root: PathBuf,
    runroot: PathBuf,
    storage_driver: String,
}

impl<R> Podman<R>
where
    R: ProcessRunner,
{
    pub fn new(settings: &ContainerSettings, runner: R) -> Self {
        Self {
            runner,
            program: settings.podman.clone(),
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

    pub fn build_create_command(
        &self,
        image: &str,
        name: &str,
        mounts: &[Mount],
        args: &[String],
    ) -> CommandSpec {
        let mut spec = self.base_command().args(["create", "--name", name]);
        for mount in mounts {
            spec = spec.arg("--mount").arg(mount.render());
        }
        spec.arg(image).args(args.iter().map(String::as_str))
    }

    pub fn build_start_command(&self, container_id: &str) -> CommandSpec {
        self.base_command()
            .args(["start", "--attach"])
            .arg(container_id)
    }

    pub fn build_rm_command(&self, container_id: &str) -> CommandSpec {
        self.base_command().arg("rm").arg(container_id)
    }

    pub fn build_inspect_command(&self, tag: &str) -> CommandSpec {
        self.base_command().args(["image", "inspect"]).arg(tag)
    }

    pub fn build_save_command(&self, tag: &str, out_path: &Path) -> CommandSpec {
        self.base_command()
            .args(["save", "-o"])
            .arg(out_path.to_string_lossy())
            .arg(tag)
    }

    pub fn build_load_command(&self, in_path: &Path) -> CommandSpec {
        self.base_command()
            .args(["load", "-i"])
            .arg(in_path.to_string_lossy())
    }

    pub fn build_rmi_command(&self, tag: &str) -> CommandSpec {
        self.base_command().arg("rmi").arg(tag)
    }

    /// Environment of `tag`, or `None` when the image is unknown.
    pub fn inspect_image(&self, tag: &str) -> Result<Option<BTreeMap<String, String>>, BackendError> {
        let spec = self.build_inspect_command(tag);
        let output = self.runner.run(&spec)?;
        if !output.success() {
            debug!(image = tag, stderr = %output.stderr.trim(), "image not found");
            return Ok(None);
        }
        let inspected: Value = decode(&spec, output.stdout.as_str())?;
        let entries = inspected
            .pointer("/0/Config/Env")
            .and_then(Value::as_array)
            .into_iter()
            .flatten();
        Ok(Some(parse_env_entries(entries)))
    }

    pub fn create(
        &self,
        image: &str,
        name: &str,
        mounts: &[Mount],
        args: &[String],
    ) -> Result<String, BackendError> {
        let spec = self.build_create_command(image, name, mounts, args);
        let output = run_checked(&self.runner, &spec)?;
        container_id_from(&spec, &output)
    }

    /// Starts and attaches; the caller decides what a nonzero exit means.
    pub fn start(&self, container_id: &str) -> Result<CommandOutput, BackendError> {
        Ok(self.runner.run(&self.build_start_command(container_id))?)
    }

    pub fn remove(&self, container_id: &str) -> Result<(), BackendError> {
        run_checked(&self.runner, &self.build_rm_command(container_id))?;
        Ok(())
    }

    pub fn save(&self, tag: &str, out_path: &Path) -> Result<(), BackendError> {
        run_checked(&self.runner, &self.build_save_command(tag, out_path))?;
        Ok(())
    }

    pub fn load(&self, in_path: &Path) -> Result<(), BackendError> {
        run_checked(&self.runner, &self.build_load_command(in_path))?;
        Ok(())
    }

    pub fn remove_image(&self, tag: &str) -> Result<(), BackendError> {
        run_checked(&self.runner, &self.build_rmi_command(tag))?;
        Ok(())
    }
}
