mod aspect;
mod registry;

pub use aspect::{AspectRatio, UnknownAspectRatio};
pub use registry::{ModelRegistry, ModelVariant};
