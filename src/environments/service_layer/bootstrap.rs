use tracing::{debug, error, info, warn};

use super::handlers::{self, ContainerUnitOfWork, ImageUnitOfWork};
use super::messagebus::MessageBus;
use super::unit_of_work::UnitOfWork;
use super::HandlerError;
use crate::environments::adapters::{Buildah, ContainerRegistry, ImageRegistry, Podman, Registry};
use crate::environments::domain::{Command, CommandKind, Event, EventKind, Message};
use crate::process::ProcessRunner;
use crate::settings::Settings;
use crate::signals::Cancellation;

pub fn image_unit_of_work<R>(
    settings: &Settings,
    runner: R,
    cancellation: Option<Cancellation>,
) -> ImageUnitOfWork<R>
where
    R: ProcessRunner,
{
    let keep = settings
        .container
        .keep
        .then(|| settings.container.keep_suffix.clone());
    UnitOfWork::new(
        ImageRegistry::new(
            Buildah::new(&settings.container, runner),
            settings.tmp_dir.as_path(),
        )
        .keep_failed_as(keep)
        .interrupted_by(cancellation),
    )
}

pub fn container_unit_of_work<R>(
    settings: &Settings,
    runner: R,
    cancellation: Option<Cancellation>,
) -> ContainerUnitOfWork<R>
where
    R: ProcessRunner,
{
    UnitOfWork::new(
        ContainerRegistry::new(Podman::new(&settings.container, runner))
            .interrupted_by(cancellation),
    )
}

/// Turns a handler outcome into the messages the bus queues next.
///
/// Events recorded by a failed command cannot be queued, so they are logged.
fn finish<G>(
    kind: CommandKind,
    uow: &mut UnitOfWork<G>,
    outcome: Result<String, HandlerError>,
) -> Result<Vec<Message>, HandlerError>
where
    G: Registry,
{
    let events = uow.collect_new_events().collect::<Vec<_>>();
    match outcome {
        Ok(result) => {
            debug!(command = ?kind, %result, "command handled");
            Ok(events.into_iter().map(Message::Event).collect())
        }
        Err(failure) => {
            for event in &events {
                warn!(command = ?kind, ?event, "event recorded before the command failed");
            }
            Err(failure)
        }
    }
}

macro_rules! route {
    ($bus:expr, $variant:ident, $factory:expr, $handler:path) => {{
        let make_uow = $factory;
        $bus.register_command(CommandKind::$variant, move |command| match command {
            Command::$variant(cmd) => {
                let mut uow = make_uow();
                let outcome = $handler(cmd, &mut uow);
                finish(CommandKind::$variant, &mut uow, outcome)
            }
            other => Err(HandlerError::Misrouted {
                expected: CommandKind::$variant,
                received: other.kind(),
            }),
        });
    }};
}

fn log_event(event: &Event) -> Result<Vec<Message>, HandlerError> {
    match event {
        Event::LayerCreated { name, image_tag } => {
            debug!(image = %image_tag, layer = %name, "layer created")
        }
        Event::ImageCreated { name } => info!(image = %name, "image created"),
        Event::ContainerCreated { image_tag, name } => {
            info!(image = %image_tag, container = %name, "container created")
        }
        Event::ContainerStartFailed {
            name,
            container_id,
            message,
        } => error!(image = %name, container = %container_id, %message, "container failed"),
        Event::LayerCreationFailed {
            name,
            image_tag,
            message,
        } => error!(image = %image_tag, layer = %name, %message, "layer failed"),
        Event::ImageCreationFailed { name, message } => {
            error!(image = %name, %message, "image creation failed")
        }
        Event::DebugImageKept {
            image_tag,
            failed_image_tag,
        } => warn!(
            image = %image_tag,
            debug_image = %failed_image_tag,
            "kept the failed build for debugging"
        ),
    }
    Ok(Vec::new())
}

/// Wires every command to its handler, each run in a fresh unit of work,
/// and logs every event.
///
/// Once `cancellation` fires, the running command stops at its next backend
/// call and its unit of work rolls back.
pub fn bootstrap<'a, R>(
    settings: &Settings,
    runner: R,
    cancellation: Option<Cancellation>,
) -> MessageBus<'a>
where
    R: ProcessRunner + Clone + 'a,
{
    let images = || {
        let settings = settings.clone();
        let runner = runner.clone();
        let cancellation = cancellation.clone();
        move || image_unit_of_work(&settings, runner.clone(), cancellation.clone())
    };
    let containers = || {
        let settings = settings.clone();
        let runner = runner.clone();
        let cancellation = cancellation.clone();
        move || container_unit_of_work(&settings, runner.clone(), cancellation.clone())
    };

    let mut bus = MessageBus::new();
    route!(bus, CreateImage, images(), handlers::create_image);
    route!(bus, CreateBenchbuildBase, images(), handlers::create_benchbuild_base);
    route!(bus, UpdateImage, images(), handlers::update_image);
    route!(bus, RunProjectContainer, containers(), handlers::run_project_container);
    route!(bus, ExportImage, containers(), handlers::export_image);
    route!(bus, ImportImage, containers(), handlers::import_image);
    route!(bus, DeleteImage, containers(), handlers::delete_image);

    for kind in EventKind::ALL {
        bus.subscribe(kind, log_event);
    }
    bus
}
