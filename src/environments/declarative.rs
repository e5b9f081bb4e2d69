//! Declarative image descriptions.
//!
//! Building a [`ContainerImage`] never runs anything; layers are realized
//! later, in order, by a unit of work.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::domain::{ContextFn, Image, Layer};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ContainerImage {
    layers: Vec<Layer>,
}

impl ContainerImage {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn from_(self, base: impl Into<String>) -> Self {
        self.push(Layer::from_base(base))
    }

    pub fn add<I, S>(self, sources: I, destination: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Layer::add(sources, destination))
    }

    pub fn copy_<I, S>(self, sources: I, destination: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Layer::copy(sources, destination))
    }

    pub fn run<I, S>(self, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Layer::run(command, args))
    }

    /// `RUN` with backend options, e.g. `("network", "host")`.
    pub fn run_with<I, S, K, KS, KV>(self, command: impl Into<String>, args: I, kwargs: K) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        K: IntoIterator<Item = (KS, KV)>,
        KS: Into<String>,
        KV: Into<String>,
    {
        self.push(Layer::Run {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            kwargs: kwargs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        })
    }

    pub fn context<F>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Path) -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.push(Layer::Context {
            name: name.into(),
            func: ContextFn::new(func),
        })
    }

    pub fn env<I, K, V>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.push(Layer::Env(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        ))
    }

    pub fn workingdir(self, directory: impl Into<String>) -> Self {
        self.push(Layer::WorkingDirectory(directory.into()))
    }

    pub fn entrypoint<I, S>(self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Layer::EntryPoint(
            command.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn command<I, S>(self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Layer::SetCommand(
            command.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn layers(&self) -> &[Layer] {
        self.layers.as_slice()
    }

    /// True until `from_` or any other layer was added; a declaration is
    /// worth building exactly when this is false.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The first `FROM` of the declaration.
    pub fn base(&self) -> Option<&str> {
        self.layers.iter().find_map(|layer| match layer {
            Layer::From { base } => Some(base.as_str()),
            _ => None,
        })
    }

    /// Splits off the first `FROM` and returns an image for the rest.
    pub fn to_image(&self, name: impl Into<String>) -> Option<Image> {
        let position = self
            .layers
            .iter()
            .position(|layer| matches!(layer, Layer::From { .. }))?;
        let base = self.base()?.to_string();
        let layers = self
            .layers
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != position)
            .map(|(_, layer)| layer.clone())
            .collect();
        Some(Image::new(name, base, layers))
    }

    /// Every layer except `FROM` ones.
    pub fn without_from(&self) -> Vec<Layer> {
        self.layers
            .iter()
            .filter(|layer| !matches!(layer, Layer::From { .. }))
            .cloned()
            .collect()
    }
}

/// File form of a [`ContainerImage`], used by the command line.
///
/// ```yaml
/// name: bb-base
/// layers:
///   - from: debian:bookworm-slim
///   - run: { command: apt-get, args: [install, -y, gcc] }
///   - env: { BB_BUILD_DIR: /app }
///   - workingdir: /app
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageDeclaration {
    pub name: String,
    #[serde(default)]
    pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerSpec {
    From(String),
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
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        kwargs: BTreeMap<String, String>,
    },
    Env(BTreeMap<String, String>),
    Workingdir(String),
    Entrypoint(Vec<String>),
    Command(Vec<String>),
}

impl From<LayerSpec> for Layer {
    fn from(spec: LayerSpec) -> Self {
        match spec {
            LayerSpec::From(base) => Layer::From { base },
            LayerSpec::Add {
                sources,
                destination,
            } => Layer::Add {
                sources,
                destination,
            },
            LayerSpec::Copy {
                sources,
                destination,
            } => Layer::Copy {
                sources,
                destination,
            },
            LayerSpec::Run {
                command,
                args,
                kwargs,
            } => Layer::Run {
                command,
                args,
                kwargs,
            },
            LayerSpec::Env(env) => Layer::Env(env),
            LayerSpec::Workingdir(directory) => Layer::WorkingDirectory(directory),
            LayerSpec::Entrypoint(command) => Layer::EntryPoint(command),
            LayerSpec::Command(command) => Layer::SetCommand(command),
        }
    }
}

impl ImageDeclaration {
    pub fn into_container_image(self) -> (String, ContainerImage) {
        let layers = self.layers.into_iter().map(Layer::from).collect();
        (self.name, ContainerImage { layers })
    }
}

#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("failed to read image declaration '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse image declaration '{path}': {message}")]
    Parse { path: String, message: String },
    #[error("image declaration '{0}' has no layers")]
    Empty(String),
}

/// Reads a YAML (or `.json`) image declaration.
pub fn load_image_declaration(path: &Path) -> Result<ImageDeclaration, DeclarationError> {
    let raw = fs::read_to_string(path).map_err(|source| DeclarationError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let parse_error = |message: String| DeclarationError::Parse {
        path: path.display().to_string(),
        message,
    };
    let tree = match path.extension().and_then(|v| v.to_str()) {
        Some("json") => serde_json::from_str::<Value>(raw.as_str())
            .map_err(|error| parse_error(error.to_string()))?,
        _ => serde_yaml::from_str::<Value>(raw.as_str())
            .map_err(|error| parse_error(error.to_string()))?,
    };
    let declaration: ImageDeclaration =
        serde_json::from_value(tree).map_err(|error| parse_error(error.to_string()))?;
    if declaration.layers.is_empty() {
        return Err(DeclarationError::Empty(declaration.name));
    }
    Ok(declaration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_appends_layers_in_call_order() {
        let image = ContainerImage::new()
            .from_("base")
            .add(["a"], "dest")
            .run("echo", ["hi"]);

        assert_eq!(
            image.layers(),
            &[
                Layer::From {
                    base: String::from("base")
                },
                Layer::Add {
                    sources: vec![String::from("a")],
                    destination: String::from("dest"),
                },
                Layer::Run {
                    command: String::from("echo"),
                    args: vec![String::from("hi")],
                    kwargs: BTreeMap::new(),
                },
            ]
        );
    }

    #[test]
    fn empty_declaration_is_empty_until_a_layer_is_added() {
        assert!(ContainerImage::new().is_empty());
        assert!(!ContainerImage::new().from_("base").is_empty());
        assert!(!ContainerImage::new().workingdir("/app").is_empty());
    }

    #[test]
    fn to_image_separates_the_base_layer() {
        let declaration = ContainerImage::new()
            .env([("BB_BUILD_DIR", "/app")])
            .from_("debian")
            .workingdir("/app");
        let image = declaration.to_image("bb-test").expect("declaration has a base");
        assert_eq!(image.name, "bb-test");
        assert_eq!(image.base, "debian");
        assert_eq!(
            image.layers.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["ENV BB_BUILD_DIR=/app", "WORKDIR /app"]
        );
        assert!(ContainerImage::new().run("true", Vec::<String>::new()).to_image("x").is_none());
    }

    #[test]
    fn yaml_declaration_maps_to_layers() {
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let path = dir.path().join("image.yml");
        fs::write(
            path.as_path(),
            "name: bb-gzip\nlayers:\n  - from: debian:bookworm\n  - run:\n      command: apt-get\n      args: [install, -y, gzip]\n      kwargs: {network: host}\n  - env: {BB_BUILD_DIR: /app}\n  - entrypoint: [bash]\n",
        )
        .expect("declaration should be written");

        let (name, image) = load_image_declaration(path.as_path())
            .expect("declaration should parse")
            .into_container_image();
        assert_eq!(name, "bb-gzip");
        assert_eq!(
            image.layers().iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec![
                "FROM debian:bookworm",
                "RUN apt-get install -y gzip [network=host]",
                "ENV BB_BUILD_DIR=/app",
                "ENTRYPOINT bash",
            ]
        );
    }

    #[test]
    fn declaration_without_layers_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let path = dir.path().join("image.yml");
        fs::write(path.as_path(), "name: nothing\n").expect("declaration should be written");
        let err = load_image_declaration(path.as_path()).expect_err("empty should fail");
        assert!(matches!(err, DeclarationError::Empty(name) if name == "nothing"));
    }
}
