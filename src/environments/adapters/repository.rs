use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::podman::Mount;
use super::{check_interrupted, BackendError, Buildah, Podman};
use crate::environments::domain::{Container, Event, Image};
use crate::process::ProcessRunner;
use crate::signals::Cancellation;

/// What a unit of work needs from the registry it wraps.
pub trait Registry {
    /// Looks `tag` up, first among images touched by this registry, then in
    /// the backend.
    fn find(&mut self, tag: &str) -> Result<Option<&Image>, BackendError>;

    /// Finalizes every provisional container.
    fn commit(&mut self) -> Result<(), BackendError>;

    /// Destroys every provisional container. Never fails; problems are logged.
    fn rollback(&mut self);

    /// Pops the oldest undelivered event.
    fn next_event(&mut self) -> Option<Event>;

    fn has_provisional(&self) -> bool;
}

#[derive(Debug)]
struct Provisional {
    container: Container,
    complete: bool,
}

fn drain_into(image: &mut Image, queue: &mut VecDeque<Event>) {
    while let Some(event) = image.next_event() {
        queue.push_back(event);
    }
}

fn next_from(seen: &mut [Image], retired: &mut VecDeque<Event>) -> Option<Event> {
    seen.iter_mut()
        .find_map(Image::next_event)
        .or_else(|| retired.pop_front())
}

/// Builds images with buildah, one working container per image.
#[derive(Debug)]
pub struct ImageRegistry<R> {
    buildah: Buildah<R>,
    tmp_dir: PathBuf,
    keep_suffix: Option<String>,
    cancellation: Option<Cancellation>,
    provisional: Vec<Provisional>,
    seen: Vec<Image>,
    retired: VecDeque<Event>,
}

impl<R> ImageRegistry<R>
where
    R: ProcessRunner,
{
    pub fn new(buildah: Buildah<R>, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            buildah,
            tmp_dir: tmp_dir.into(),
            keep_suffix: None,
            cancellation: None,
            provisional: Vec::new(),
            seen: Vec::new(),
            retired: VecDeque::new(),
        }
    }

    /// Commit half-built containers as `<tag>-<suffix>` before discarding them.
    pub fn keep_failed_as(mut self, suffix: Option<String>) -> Self {
        self.keep_suffix = suffix;
        self
    }

    /// Stop before the next backend call once `cancellation` fired.
    pub fn interrupted_by(mut self, cancellation: Option<Cancellation>) -> Self {
        self.cancellation = cancellation;
        self
    }

    fn new_context(&self) -> Result<tempfile::TempDir, BackendError> {
        fs::create_dir_all(self.tmp_dir.as_path())?;
        Ok(tempfile::Builder::new()
            .prefix("bb-context-")
            .tempdir_in(self.tmp_dir.as_path())?)
    }

    fn retire(&mut self, mut image: Image) {
        drain_into(&mut image, &mut self.retired);
    }

    /// Creates a working container from the image's base and realizes every
    /// layer against it, in order.
    ///
    /// The container is tracked for rollback as soon as it exists; the image
    /// only becomes visible to [`Registry::find`] once all layers succeeded.
    /// A termination request is honoured between layers; the container is
    /// left for rollback.
    pub fn add(&mut self, mut image: Image) -> Result<(), BackendError> {
        check_interrupted(self.cancellation.as_ref())?;
        let tag = image.name.clone();
        let context = self.new_context()?;
        let container_id = match self.buildah.from(image.base.as_str()) {
            Ok(id) => id,
            Err(error) => {
                image.record(Event::ImageCreationFailed {
                    name: tag,
                    message: error.to_string(),
                });
                self.retire(image);
                return Err(error);
            }
        };
        info!(image = %tag, container = %container_id, base = %image.base, "working container created");

        let layers = image.layers.clone();
        self.provisional.push(Provisional {
            container: Container::new(container_id, image, Some(context)),
            complete: false,
        });
        let index = self.provisional.len() - 1;

        for layer in &layers {
            let outcome = check_interrupted(self.cancellation.as_ref()).and_then(|()| {
                self.buildah
                    .spawn_layer(&self.provisional[index].container, layer)
            });
            let entry = &mut self.provisional[index];
            match outcome {
                Ok(()) => entry.container.image.record(Event::LayerCreated {
                    name: layer.to_string(),
                    image_tag: tag.clone(),
                }),
                Err(error) => {
                    entry.container.image.record(Event::LayerCreationFailed {
                        name: layer.to_string(),
                        image_tag: tag.clone(),
                        message: error.to_string(),
                    });
                    if error.is_interrupted() {
                        warn!(image = %tag, layer = %layer, "build interrupted");
                        return Err(error);
                    }
                    if let Some(suffix) = self.keep_suffix.as_deref() {
                        let failed_tag = format!("{tag}-{suffix}");
                        match self
                            .buildah
                            .commit(entry.container.container_id.as_str(), failed_tag.as_str())
                        {
                            Ok(()) => entry.container.image.record(Event::DebugImageKept {
                                image_tag: tag.clone(),
                                failed_image_tag: failed_tag,
                            }),
                            Err(keep_error) => {
                                warn!(image = %tag, error = %keep_error, "failed to keep debug image")
                            }
                        }
                    }
                    return Err(error);
                }
            }
        }

        self.provisional[index].complete = true;
        Ok(())
    }

    pub fn context_of(&self, tag: &str) -> Option<&Path> {
        self.provisional
            .iter()
            .find(|entry| entry.container.image.name == tag)
            .and_then(|entry| entry.container.context())
    }
}

impl<R> Registry for ImageRegistry<R>
where
    R: ProcessRunner,
{
    fn find(&mut self, tag: &str) -> Result<Option<&Image>, BackendError> {
        if let Some(index) = self.seen.iter().position(|image| image.name == tag) {
            return Ok(self.seen.get(index));
        }
        if let Some(index) = self
            .provisional
            .iter()
            .position(|entry| entry.complete && entry.container.image.name == tag)
        {
            return Ok(self.provisional.get(index).map(|entry| &entry.container.image));
        }
        if self.buildah.find_image(tag)?.is_none() {
            return Ok(None);
        }
        let env = self.buildah.image_env(tag)?;
        self.seen.push(Image::new(tag, tag, Vec::new()).with_env(env));
        Ok(self.seen.last())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        let mut pending = std::mem::take(&mut self.provisional).into_iter();
        while let Some(mut entry) = pending.next() {
            if !entry.complete {
                warn!(image = %entry.container.image.name, "skipping commit of incomplete image");
                self.provisional.push(entry);
                continue;
            }
            let tag = entry.container.image.name.clone();
            if let Err(error) = self
                .buildah
                .commit(entry.container.container_id.as_str(), tag.as_str())
            {
                self.provisional.push(entry);
                self.provisional.extend(pending);
                return Err(error);
            }
            if let Err(error) = entry.container.discard_context() {
                warn!(image = %tag, %error, "failed to remove build context");
            }
            info!(image = %tag, container = %entry.container.container_id, "image committed");
            let mut image = entry.container.into_image();
            image.record(Event::ImageCreated { name: tag });
            self.seen.push(image);
        }
        Ok(())
    }

    fn rollback(&mut self) {
        for mut entry in std::mem::take(&mut self.provisional) {
            let id = entry.container.container_id.clone();
            if let Err(error) = self.buildah.remove(id.as_str()) {
                warn!(container = %id, %error, "failed to remove working container");
            }
            if let Err(error) = entry.container.discard_context() {
                warn!(container = %id, %error, "failed to remove build context");
            }
            info!(image = %entry.container.image.name, container = %id, "working container rolled back");
            self.retire(entry.container.into_image());
        }
    }

    fn next_event(&mut self) -> Option<Event> {
        next_from(self.seen.as_mut_slice(), &mut self.retired)
    }

    fn has_provisional(&self) -> bool {
        !self.provisional.is_empty()
    }
}

/// Runs containers from finished images with podman.
#[derive(Debug)]
pub struct ContainerRegistry<R> {
    podman: Podman<R>,
    cancellation: Option<Cancellation>,
    running: Vec<Container>,
    seen: Vec<Image>,
    retired: VecDeque<Event>,
}

impl<R> ContainerRegistry<R>
where
    R: ProcessRunner,
{
    pub fn new(podman: Podman<R>) -> Self {
        Self {
            podman,
            cancellation: None,
            running: Vec::new(),
            seen: Vec::new(),
            retired: VecDeque::new(),
        }
    }

    /// Stop before the next backend call once `cancellation` fired.
    pub fn interrupted_by(mut self, cancellation: Option<Cancellation>) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Creates a container named `name` from the image `tag`.
    pub fn create(
        &mut self,
        tag: &str,
        name: &str,
        mounts: &[Mount],
        args: &[String],
    ) -> Result<String, BackendError> {
        check_interrupted(self.cancellation.as_ref())?;
        let env = self
            .find(tag)?
            .map(|image| image.env.clone())
            .unwrap_or_default();
        let container_id = self.podman.create(tag, name, mounts, args)?;
        let mut image = Image::new(tag, tag, Vec::new()).with_env(env);
        image.record(Event::ContainerCreated {
            image_tag: tag.to_string(),
            name: name.to_string(),
        });
        info!(image = %tag, container = %container_id, %name, "container created");
        self.running
            .push(Container::new(container_id.clone(), image, None));
        Ok(container_id)
    }

    /// Starts the container and returns its exit status. A nonzero status is
    /// recorded as [`Event::ContainerStartFailed`].
    pub fn start(&mut self, container_id: &str) -> Result<i32, BackendError> {
        check_interrupted(self.cancellation.as_ref())?;
        let output = self.podman.start(container_id)?;
        if !output.success() {
            let message = match output.stderr.trim() {
                "" => format!("exit code {}", output.status_code),
                stderr => stderr.to_string(),
            };
            warn!(container = %container_id, status = output.status_code, "container exited with failure");
            if let Some(container) = self
                .running
                .iter_mut()
                .find(|container| container.container_id == container_id)
            {
                let name = container.image.name.clone();
                container.image.record(Event::ContainerStartFailed {
                    name,
                    container_id: container_id.to_string(),
                    message,
                });
            }
        }
        Ok(output.status_code)
    }

    pub fn export(&mut self, tag: &str, out_path: &Path) -> Result<(), BackendError> {
        self.podman.save(tag, out_path)?;
        info!(image = %tag, path = %out_path.display(), "image exported");
        Ok(())
    }

    pub fn import(&mut self, in_path: &Path) -> Result<(), BackendError> {
        self.podman.load(in_path)?;
        info!(path = %in_path.display(), "image imported");
        Ok(())
    }

    pub fn delete(&mut self, tag: &str) -> Result<(), BackendError> {
        self.podman.remove_image(tag)?;
        self.seen.retain(|image| image.name != tag);
        info!(image = %tag, "image deleted");
        Ok(())
    }
}

impl<R> Registry for ContainerRegistry<R>
where
    R: ProcessRunner,
{
    fn find(&mut self, tag: &str) -> Result<Option<&Image>, BackendError> {
        if let Some(index) = self.seen.iter().position(|image| image.name == tag) {
            return Ok(self.seen.get(index));
        }
        let Some(env) = self.podman.inspect_image(tag)? else {
            return Ok(None);
        };
        self.seen.push(Image::new(tag, tag, Vec::new()).with_env(env));
        Ok(self.seen.last())
    }

    /// Keeps the run containers instead of removing them.
    fn commit(&mut self) -> Result<(), BackendError> {
        for container in std::mem::take(&mut self.running) {
            info!(container = %container.container_id, "container kept");
            self.seen.push(container.into_image());
        }
        Ok(())
    }

    fn rollback(&mut self) {
        for container in std::mem::take(&mut self.running) {
            if let Err(error) = self.podman.remove(container.container_id.as_str()) {
                warn!(container = %container.container_id, %error, "failed to remove container");
            }
            let mut image = container.into_image();
            drain_into(&mut image, &mut self.retired);
        }
    }

    fn next_event(&mut self) -> Option<Event> {
        next_from(self.seen.as_mut_slice(), &mut self.retired)
    }

    fn has_provisional(&self) -> bool {
        !self.running.is_empty()
    }
}
