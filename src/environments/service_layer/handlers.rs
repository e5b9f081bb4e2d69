use std::path::PathBuf;

use tracing::{debug, info};

use super::ensure;
use super::unit_of_work::{Committed, UnitOfWork};
use super::HandlerError;
use crate::environments::adapters::podman::Mount;
use crate::environments::adapters::{ContainerRegistry, ImageRegistry, Registry};
use crate::environments::declarative::ContainerImage;
use crate::environments::domain::{
    CreateBenchbuildBase, CreateImage, DeleteImage, ExportImage, Image, ImportImage,
    RunProjectContainer, UpdateImage,
};
use crate::process::ProcessRunner;

/// Environment key naming where an image expects the build directory.
pub const BUILD_DIR_ENV: &str = "BB_BUILD_DIR";

pub type ImageUnitOfWork<R> = UnitOfWork<ImageRegistry<R>>;
pub type ContainerUnitOfWork<R> = UnitOfWork<ContainerRegistry<R>>;

fn declared_image(name: &str, layers: &ContainerImage) -> Result<Image, HandlerError> {
    layers
        .to_image(name)
        .ok_or_else(|| HandlerError::MissingBase(name.to_string()))
}

/// Returns the tag, building and committing the image only when it is not
/// already known.
pub fn create_image<R>(cmd: CreateImage, uow: &mut ImageUnitOfWork<R>) -> Result<String, HandlerError>
where
    R: ProcessRunner,
{
    let mut tx = uow.begin();
    if let Some(image) = tx.find(cmd.name.as_str())? {
        info!(image = %image.name, "image exists, skipping build");
        return Ok(image.name.clone());
    }
    tx.add(declared_image(cmd.name.as_str(), &cmd.layers)?)?;
    let Committed = tx.commit()?;
    Ok(cmd.name)
}

pub fn create_benchbuild_base<R>(
    cmd: CreateBenchbuildBase,
    uow: &mut ImageUnitOfWork<R>,
) -> Result<String, HandlerError>
where
    R: ProcessRunner,
{
    let mut tx = uow.begin();
    tx.add(declared_image(cmd.name.as_str(), &cmd.layers)?)?;
    let Committed = tx.commit()?;
    Ok(cmd.name)
}

/// Realizes `cmd.layers` on top of the existing tag and commits the result
/// under the same tag. `FROM` layers of the declaration are ignored.
pub fn update_image<R>(cmd: UpdateImage, uow: &mut ImageUnitOfWork<R>) -> Result<String, HandlerError>
where
    R: ProcessRunner,
{
    let mut tx = uow.begin();
    ensure::image_exists(&mut *tx, cmd.name.as_str())?;
    let image = Image::new(cmd.name.as_str(), cmd.name.as_str(), cmd.layers.without_from());
    tx.add(image)?;
    let Committed = tx.commit()?;
    Ok(cmd.name)
}

/// Creates and starts a container, returning its id. The container is
/// removed again when the unit of work ends.
pub fn run_project_container<R>(
    cmd: RunProjectContainer,
    uow: &mut ContainerUnitOfWork<R>,
) -> Result<String, HandlerError>
where
    R: ProcessRunner,
{
    let mut tx = uow.begin();
    let target = ensure::image_exists(&mut *tx, cmd.image.as_str())?
        .env
        .get(BUILD_DIR_ENV)
        .cloned();

    let mounts = match cmd.build_dir {
        Some(source) => {
            let target = target.unwrap_or_else(|| {
                debug!(image = %cmd.image, "image has no {BUILD_DIR_ENV}, mounting at the host path");
                source.to_string_lossy().to_string()
            });
            vec![Mount { source, target }]
        }
        None => Vec::new(),
    };

    let container_id = tx.create(
        cmd.image.as_str(),
        cmd.name.as_str(),
        mounts.as_slice(),
        cmd.args.as_slice(),
    )?;
    let status = tx.start(container_id.as_str())?;
    info!(container = %container_id, name = %cmd.name, status, "container finished");
    Ok(container_id)
}

pub fn export_image<R>(cmd: ExportImage, uow: &mut ContainerUnitOfWork<R>) -> Result<String, HandlerError>
where
    R: ProcessRunner,
{
    let mut tx = uow.begin();
    ensure::image_exists(&mut *tx, cmd.image.as_str())?;
    tx.export(cmd.image.as_str(), cmd.out_path.as_path())?;
    Ok(path_string(cmd.out_path))
}

pub fn import_image<R>(cmd: ImportImage, uow: &mut ContainerUnitOfWork<R>) -> Result<String, HandlerError>
where
    R: ProcessRunner,
{
    let mut tx = uow.begin();
    tx.import(cmd.in_path.as_path())?;
    ensure::image_exists(&mut *tx, cmd.image.as_str())?;
    Ok(cmd.image)
}

pub fn delete_image<R>(cmd: DeleteImage, uow: &mut ContainerUnitOfWork<R>) -> Result<String, HandlerError>
where
    R: ProcessRunner,
{
    let mut tx = uow.begin();
    ensure::image_exists(&mut *tx, cmd.name.as_str())?;
    tx.delete(cmd.name.as_str())?;
    Ok(cmd.name)
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().to_string()
}
