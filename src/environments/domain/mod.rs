pub mod commands;
pub mod events;
pub mod model;

pub use commands::{
    Command, CommandKind, CreateBenchbuildBase, CreateImage, DeleteImage, ExportImage,
    ImportImage, RunProjectContainer, UpdateImage,
};
pub use events::{Event, EventKind};
pub use model::{Container, ContextFn, Image, Layer};

/// Anything the message bus can queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command(Command),
    Event(Event),
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}
