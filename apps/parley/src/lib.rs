pub mod config;
pub mod crypto;
pub mod media;
pub mod mesh;
pub mod relay;
pub mod telemetry;
pub mod transfer;
pub mod transport;

pub use config::MeshConfig;
pub use mesh::{ChatContent, MeshDeps, MeshError, MeshEvent, MeshSession};
