pub mod envelope;
pub mod error;
pub mod models;

pub use envelope::Envelope;
pub use error::{Error, Result};
pub use models::{Deployment, DeploymentStatus, Domain, Service, ServiceStatus};

/// Id type shared by every entity the core tracks. Plain `Uuid` rather than
/// `ulid::Ulid`: nothing in this platform needs lexicographic id ordering,
/// and a job's id is required to equal its deployment id (see the queue
/// contract), so the simplest id type that satisfies that wins.
pub type Id = uuid::Uuid;
