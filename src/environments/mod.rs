//! Container images for reproducible benchmark environments.
//!
//! Images are declared as ordered layers ([`declarative::ContainerImage`]),
//! realized by buildah inside a unit of work, and run with podman. Callers
//! talk to all of it through the message bus built by
//! [`service_layer::bootstrap`].

pub mod adapters;
pub mod declarative;
pub mod domain;
pub mod service_layer;

pub use declarative::{load_image_declaration, ContainerImage, ImageDeclaration};
pub use domain::{Command, Event, Image, Layer, Message};
pub use service_layer::{bootstrap, BusError, BusReport, HandlerError, MessageBus};
