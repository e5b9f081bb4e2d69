use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use super::HandlerError;
use crate::environments::domain::{Command, CommandKind, Event, EventKind, Message};

pub type CommandHandler<'a> = Box<dyn FnMut(Command) -> Result<Vec<Message>, HandlerError> + 'a>;
pub type EventHandler<'a> = Box<dyn FnMut(&Event) -> Result<Vec<Message>, HandlerError> + 'a>;

/// Summary of one [`MessageBus::handle`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusReport {
    /// User-facing messages for commands that could not run.
    pub notices: Vec<String>,
    pub commands_handled: usize,
    pub events_handled: usize,
    pub event_handler_failures: usize,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no handler registered for command {0:?}")]
    UnregisteredCommand(CommandKind),
    #[error("command {kind:?} failed: {source}")]
    CommandFailed {
        kind: CommandKind,
        #[source]
        source: HandlerError,
    },
}

impl BusError {
    /// The command stopped because of a termination request.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::CommandFailed { source, .. } if source.is_interrupted())
    }
}

/// FIFO dispatcher for commands and events.
///
/// Event handler failures are logged and skipped. Command handler failures
/// abort the call, except [`HandlerError::ImageNotFound`], which becomes a
/// notice in the [`BusReport`].
#[derive(Default)]
pub struct MessageBus<'a> {
    command_handlers: HashMap<CommandKind, CommandHandler<'a>>,
    event_handlers: HashMap<EventKind, Vec<EventHandler<'a>>>,
}

impl<'a> MessageBus<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the single handler for `kind`, replacing any previous one.
    pub fn register_command<F>(&mut self, kind: CommandKind, handler: F)
    where
        F: FnMut(Command) -> Result<Vec<Message>, HandlerError> + 'a,
    {
        self.command_handlers.insert(kind, Box::new(handler));
    }

    /// Adds a handler for `kind`; handlers run in subscription order.
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&Event) -> Result<Vec<Message>, HandlerError> + 'a,
    {
        self.event_handlers
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    pub fn handle(&mut self, message: impl Into<Message>) -> Result<BusReport, BusError> {
        let mut queue = VecDeque::from([message.into()]);
        let mut report = BusReport::default();
        while let Some(message) = queue.pop_front() {
            match message {
                Message::Event(event) => self.handle_event(&event, &mut queue, &mut report),
                Message::Command(command) => {
                    self.handle_command(command, &mut queue, &mut report)?
                }
            }
        }
        Ok(report)
    }

    fn handle_event(
        &mut self,
        event: &Event,
        queue: &mut VecDeque<Message>,
        report: &mut BusReport,
    ) {
        report.events_handled += 1;
        let Some(handlers) = self.event_handlers.get_mut(&event.kind()) else {
            debug!(event = ?event.kind(), "no handlers for event");
            return;
        };
        for handler in handlers.iter_mut() {
            match handler(event) {
                Ok(messages) => queue.extend(messages),
                Err(failure) => {
                    report.event_handler_failures += 1;
                    error!(event = ?event, error = %failure, "event handler failed");
                }
            }
        }
    }

    fn handle_command(
        &mut self,
        command: Command,
        queue: &mut VecDeque<Message>,
        report: &mut BusReport,
    ) -> Result<(), BusError> {
        let kind = command.kind();
        let handler = self
            .command_handlers
            .get_mut(&kind)
            .ok_or(BusError::UnregisteredCommand(kind))?;
        debug!(command = ?kind, "handling command");
        match handler(command) {
            Ok(messages) => {
                report.commands_handled += 1;
                queue.extend(messages);
                Ok(())
            }
            Err(HandlerError::ImageNotFound(name)) => {
                let notice = format!(
                    "Could not find the required image '{name}'. Create it first, e.g. with `benchbuild image create`."
                );
                error!(command = ?kind, image = %name, "{notice}");
                report.notices.push(notice);
                Ok(())
            }
            Err(source) => {
                error!(command = ?kind, error = %source, "command failed");
                Err(BusError::CommandFailed { kind, source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environments::domain::DeleteImage;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn delete(name: &str) -> Command {
        Command::DeleteImage(DeleteImage {
            name: name.to_string(),
        })
    }

    fn created(name: &str) -> Event {
        Event::ImageCreated {
            name: name.to_string(),
        }
    }

    #[test]
    fn failing_event_handler_does_not_stop_siblings_or_the_queue() {
        let seen = Rc::new(RefCell::new(Vec::<String>::new()));
        let mut bus = MessageBus::new();
        bus.register_command(CommandKind::DeleteImage, |command| {
            let Command::DeleteImage(cmd) = command else {
                return Ok(Vec::new());
            };
            Ok(vec![
                created(format!("{}-1", cmd.name).as_str()).into(),
                created(format!("{}-2", cmd.name).as_str()).into(),
            ])
        });
        bus.subscribe(EventKind::ImageCreated, |_| {
            Err(HandlerError::ImageNotFound(String::from("telemetry")))
        });
        let sink = Rc::clone(&seen);
        bus.subscribe(EventKind::ImageCreated, move |event| {
            if let Event::ImageCreated { name } = event {
                sink.borrow_mut().push(name.clone());
            }
            Ok(Vec::new())
        });

        let report = bus.handle(delete("img")).expect("events never abort");
        assert_eq!(*seen.borrow(), vec!["img-1", "img-2"]);
        assert_eq!(report.events_handled, 2);
        assert_eq!(report.event_handler_failures, 2);
        assert_eq!(report.commands_handled, 1);
    }

    #[test]
    fn failing_command_aborts_the_remaining_queue() {
        let later = Rc::new(RefCell::new(0usize));
        let mut bus = MessageBus::new();
        bus.register_command(CommandKind::DeleteImage, |command| match command {
            Command::DeleteImage(cmd) if cmd.name == "first" => {
                Ok(vec![delete("boom").into(), created("never").into()])
            }
            _ => Err(HandlerError::MissingBase(String::from("boom"))),
        });
        let counter = Rc::clone(&later);
        bus.subscribe(EventKind::ImageCreated, move |_| {
            *counter.borrow_mut() += 1;
            Ok(Vec::new())
        });

        let err = bus
            .handle(delete("first"))
            .expect_err("command failure should abort");
        assert!(matches!(
            err,
            BusError::CommandFailed {
                kind: CommandKind::DeleteImage,
                source: HandlerError::MissingBase(_)
            }
        ));
        assert_eq!(*later.borrow(), 0);
    }

    #[test]
    fn image_not_found_becomes_a_notice() {
        let mut bus = MessageBus::new();
        bus.register_command(CommandKind::DeleteImage, |_| {
            Err(HandlerError::ImageNotFound(String::from("bb-missing")))
        });

        let report = bus.handle(delete("bb-missing")).expect("not found is recovered");
        assert_eq!(report.notices.len(), 1);
        assert!(report.notices[0].contains("Could not find the required image 'bb-missing'"));
        assert_eq!(report.commands_handled, 0);
    }

    #[test]
    fn unregistered_command_is_rejected() {
        let mut bus = MessageBus::new();
        let err = bus
            .handle(delete("x"))
            .expect_err("no handler should fail");
        assert!(matches!(
            err,
            BusError::UnregisteredCommand(CommandKind::DeleteImage)
        ));
    }

    #[test]
    fn events_without_subscribers_are_skipped() {
        let mut bus = MessageBus::new();
        let report = bus.handle(created("img")).expect("events never abort");
        assert_eq!(report.events_handled, 1);
        assert_eq!(report.event_handler_failures, 0);
    }
}
