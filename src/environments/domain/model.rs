use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use super::events::Event;

type ContextHook = dyn Fn(&Path) -> io::Result<()> + Send + Sync;

/// A callback that stages files into a build context directory.
///
/// Two hooks are equal only when they share the same allocation.
#[derive(Clone)]
pub struct ContextFn(Arc<ContextHook>);

impl ContextFn {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Path) -> io::Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(func))
    }

    pub fn call(&self, context: &Path) -> io::Result<()> {
        (self.0)(context)
    }
}

impl PartialEq for ContextFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ContextFn {}

impl Hash for ContextFn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).cast::<()>().hash(state);
    }
}

impl fmt::Debug for ContextFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContextFn(..)")
    }
}

/// One declarative build instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Layer {
    From {
        base: String,
    },
    Add {
        sources: Vec<String>,
        destination: String,
    },
    Copy {
        sources: Vec<String>,
        destination: String,
    },
    Run {
        command: String,
        args: Vec<String>,
        kwargs: BTreeMap<String, String>,
    },
    Context {
        name: String,
        func: ContextFn,
    },
    Env(BTreeMap<String, String>),
    WorkingDirectory(String),
    EntryPoint(Vec<String>),
    SetCommand(Vec<String>),
}

impl Layer {
    pub fn from_base(base: impl Into<String>) -> Self {
        Self::From { base: base.into() }
    }

    pub fn add<I, S>(sources: I, destination: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Add {
            sources: sources.into_iter().map(Into::into).collect(),
            destination: destination.into(),
        }
    }

    pub fn copy<I, S>(sources: I, destination: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Copy {
            sources: sources.into_iter().map(Into::into).collect(),
            destination: destination.into(),
        }
    }

    pub fn run<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Run {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Whether realizing this layer touches the filesystem or runs a process.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Self::Add { .. } | Self::Copy { .. } | Self::Run { .. } | Self::Context { .. }
        )
    }
}

fn join_words(words: &[String]) -> String {
    words.join(" ")
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::From { base } => write!(f, "FROM {base}"),
            Self::Add {
                sources,
                destination,
            } => write!(f, "ADD {} {destination}", join_words(sources)),
            Self::Copy {
                sources,
                destination,
            } => write!(f, "COPY {} {destination}", join_words(sources)),
            Self::Run {
                command,
                args,
                kwargs,
            } => {
                write!(f, "RUN {command}")?;
                if !args.is_empty() {
                    write!(f, " {}", join_words(args))?;
                }
                if !kwargs.is_empty() {
                    let rendered = kwargs
                        .iter()
                        .map(|(key, value)| format!("{key}={value}"))
                        .collect::<Vec<_>>();
                    write!(f, " [{}]", rendered.join(", "))?;
                }
                Ok(())
            }
            Self::Context { name, .. } => write!(f, "CONTEXT {name}"),
            Self::Env(env) => {
                let rendered = env
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>();
                write!(f, "ENV {}", rendered.join(" "))
            }
            Self::WorkingDirectory(directory) => write!(f, "WORKDIR {directory}"),
            Self::EntryPoint(command) => write!(f, "ENTRYPOINT {}", join_words(command)),
            Self::SetCommand(command) => write!(f, "CMD {}", join_words(command)),
        }
    }
}

/// An image under construction, or one found in the backend's store.
///
/// Equality is by identity: two images with the same layers are still
/// different images, so no `PartialEq` is provided.
#[derive(Debug)]
pub struct Image {
    pub name: String,
    pub base: String,
    pub layers: Vec<Layer>,
    pub env: BTreeMap<String, String>,
    events: VecDeque<Event>,
}

impl Image {
    pub fn new(name: impl Into<String>, base: impl Into<String>, layers: Vec<Layer>) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
            layers,
            env: BTreeMap::new(),
            events: VecDeque::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn from_layer(&self) -> Layer {
        Layer::from_base(self.base.clone())
    }

    pub fn append(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn prepend(&mut self, layer: Layer) {
        self.layers.insert(0, layer);
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn record(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub(crate) fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }
}

/// A working container and the scratch directory its layers are staged in.
#[derive(Debug)]
pub struct Container {
    pub container_id: String,
    pub image: Image,
    context: Option<TempDir>,
}

impl Container {
    pub fn new(container_id: impl Into<String>, image: Image, context: Option<TempDir>) -> Self {
        Self {
            container_id: container_id.into(),
            image,
            context,
        }
    }

    pub fn context(&self) -> Option<&Path> {
        self.context.as_ref().map(TempDir::path)
    }

    /// Deletes the build context. Calling it again does nothing.
    pub fn discard_context(&mut self) -> io::Result<()> {
        match self.context.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }

    pub fn into_image(self) -> Image {
        self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn layers_render_like_dockerfile_instructions() {
        let rendered = [
            Layer::from_base("debian:bookworm"),
            Layer::add(["a", "b"], "/dest"),
            Layer::copy(["c"], "/opt"),
            Layer::run("echo", ["hi"]),
            Layer::Run {
                command: String::from("make"),
                args: Vec::new(),
                kwargs: BTreeMap::from([(String::from("network"), String::from("host"))]),
            },
            Layer::Env(BTreeMap::from([
                (String::from("A"), String::from("1")),
                (String::from("B"), String::from("2")),
            ])),
            Layer::WorkingDirectory(String::from("/app")),
            Layer::EntryPoint(vec![String::from("bash"), String::from("-c")]),
            Layer::SetCommand(vec![String::from("true")]),
        ]
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

        assert_eq!(
            rendered,
            vec![
                "FROM debian:bookworm",
                "ADD a b /dest",
                "COPY c /opt",
                "RUN echo hi",
                "RUN make [network=host]",
                "ENV A=1 B=2",
                "WORKDIR /app",
                "ENTRYPOINT bash -c",
                "CMD true",
            ]
        );
    }

    #[test]
    fn layers_are_usable_as_set_members() {
        let hook = ContextFn::new(|_| Ok(()));
        let mut set = HashSet::new();
        set.insert(Layer::run("echo", ["hi"]));
        set.insert(Layer::run("echo", ["hi"]));
        set.insert(Layer::Context {
            name: String::from("stage"),
            func: hook.clone(),
        });
        set.insert(Layer::Context {
            name: String::from("stage"),
            func: hook,
        });
        set.insert(Layer::Context {
            name: String::from("stage"),
            func: ContextFn::new(|_| Ok(())),
        });
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn prepend_keeps_the_remaining_order() {
        let mut image = Image::new("img", "base", vec![Layer::run("b", Vec::<String>::new())]);
        image.append(Layer::run("c", Vec::<String>::new()));
        image.prepend(Layer::run("a", Vec::<String>::new()));
        let commands = image
            .layers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        assert_eq!(commands, vec!["RUN a", "RUN b", "RUN c"]);
    }

    #[test]
    fn image_events_drain_in_fifo_order() {
        let mut image = Image::new("img", "base", Vec::new());
        image.record(Event::ImageCreated {
            name: String::from("first"),
        });
        image.record(Event::ImageCreated {
            name: String::from("second"),
        });
        assert_eq!(image.pending_events(), 2);
        assert_eq!(
            image.next_event(),
            Some(Event::ImageCreated {
                name: String::from("first")
            })
        );
        assert_eq!(
            image.next_event(),
            Some(Event::ImageCreated {
                name: String::from("second")
            })
        );
        assert_eq!(image.next_event(), None);
    }

    #[test]
    fn discarding_a_context_twice_is_harmless() {
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let path = dir.path().to_path_buf();
        let mut container = Container::new("ctr-1", Image::new("img", "base", Vec::new()), Some(dir));

        assert_eq!(container.context(), Some(path.as_path()));
        container.discard_context().expect("first discard should succeed");
        container
            .discard_context()
            .expect("second discard should be a no-op");
        assert!(!path.exists());
        assert_eq!(container.context(), None);
    }
}
