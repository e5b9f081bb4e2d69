use std::path::PathBuf;

use serde::Serialize;

use crate::environments::declarative::ContainerImage;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CreateImage {
    pub name: String,
    pub layers: ContainerImage,
}

/// Rebuilds the shared base image even when the tag already exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CreateBenchbuildBase {
    pub name: String,
    pub layers: ContainerImage,
}

/// Applies more layers on top of an existing tag and re-commits it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpdateImage {
    pub name: String,
    pub layers: ContainerImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunProjectContainer {
    pub image: String,
    pub name: String,
    pub build_dir: Option<PathBuf>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExportImage {
    pub image: String,
    pub out_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImportImage {
    pub image: String,
    pub in_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeleteImage {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    CreateImage(CreateImage),
    CreateBenchbuildBase(CreateBenchbuildBase),
    UpdateImage(UpdateImage),
    RunProjectContainer(RunProjectContainer),
    ExportImage(ExportImage),
    ImportImage(ImportImage),
    DeleteImage(DeleteImage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    CreateImage,
    CreateBenchbuildBase,
    UpdateImage,
    RunProjectContainer,
    ExportImage,
    ImportImage,
    DeleteImage,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::CreateImage(_) => CommandKind::CreateImage,
            Self::CreateBenchbuildBase(_) => CommandKind::CreateBenchbuildBase,
            Self::UpdateImage(_) => CommandKind::UpdateImage,
            Self::RunProjectContainer(_) => CommandKind::RunProjectContainer,
            Self::ExportImage(_) => CommandKind::ExportImage,
            Self::ImportImage(_) => CommandKind::ImportImage,
            Self::DeleteImage(_) => CommandKind::DeleteImage,
        }
    }
}

macro_rules! impl_into_command {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Command {
                fn from(command: $variant) -> Self {
                    Self::$variant(command)
                }
            }

            impl From<$variant> for super::Message {
                fn from(command: $variant) -> Self {
                    Self::Command(Command::$variant(command))
                }
            }
        )*
    };
}

impl_into_command!(
    CreateImage,
    CreateBenchbuildBase,
    UpdateImage,
    RunProjectContainer,
    ExportImage,
    ImportImage,
    DeleteImage,
);
