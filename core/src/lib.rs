//! `renderlite-core`: the deployment pipeline, container controller, job
//! queue, event bus, secret envelope, and reconciler that together make up
//! RenderLite's worker process. The REST/WS process, the ORM, and every
//! other outer-surface collaborator named in the egress contract live
//! outside this crate; it exposes the trait seams (`Dal`, `ContainerRuntime`,
//! `PubSub`) those collaborators plug into.

pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod persistence;
pub mod pipeline;
pub mod queue;
pub mod reconciler;
pub mod secrets;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
