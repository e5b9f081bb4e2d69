use serde::Serialize;

/// Facts recorded while images and containers are realized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    LayerCreated {
        name: String,
        image_tag: String,
    },
    ImageCreated {
        name: String,
    },
    ContainerCreated {
        image_tag: String,
        name: String,
    },
    ContainerStartFailed {
        name: String,
        container_id: String,
        message: String,
    },
    LayerCreationFailed {
        name: String,
        image_tag: String,
        message: String,
    },
    ImageCreationFailed {
        name: String,
        message: String,
    },
    DebugImageKept {
        image_tag: String,
        failed_image_tag: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LayerCreated,
    ImageCreated,
    ContainerCreated,
    ContainerStartFailed,
    LayerCreationFailed,
    ImageCreationFailed,
    DebugImageKept,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        Self::LayerCreated,
        Self::ImageCreated,
        Self::ContainerCreated,
        Self::ContainerStartFailed,
        Self::LayerCreationFailed,
        Self::ImageCreationFailed,
        Self::DebugImageKept,
    ];

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::ContainerStartFailed | Self::LayerCreationFailed | Self::ImageCreationFailed
        )
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::LayerCreated { .. } => EventKind::LayerCreated,
            Self::ImageCreated { .. } => EventKind::ImageCreated,
            Self::ContainerCreated { .. } => EventKind::ContainerCreated,
            Self::ContainerStartFailed { .. } => EventKind::ContainerStartFailed,
            Self::LayerCreationFailed { .. } => EventKind::LayerCreationFailed,
            Self::ImageCreationFailed { .. } => EventKind::ImageCreationFailed,
            Self::DebugImageKept { .. } => EventKind::DebugImageKept,
        }
    }
}
