//! Data access layer. The pipeline, queue wiring, and reconciler depend on
//! the [`Dal`] trait rather than on SQL directly — the ORM itself is out
//! of this specification's scope, but the seam it plugs into (CRUD on
//! `Service`/`Deployment` rows, a unique-subdomain constraint, a JSON
//! column for the encrypted env map) is, so the trait boundary is what
//! stays even though only one implementation of it ships here.

pub mod sqlite;

use async_trait::async_trait;
use renderlite_common::{Deployment, Domain, Service};
use uuid::Uuid;

use crate::error::Result;

pub use sqlite::SqliteDal;

#[async_trait]
pub trait Dal: Send + Sync {
    async fn create_service(&self, service: &Service) -> Result<()>;
    async fn get_service(&self, id: Uuid) -> Result<Option<Service>>;
    async fn update_service(&self, service: &Service) -> Result<()>;
    async fn subdomain_taken(&self, subdomain: &str) -> Result<bool>;
    async fn list_services(&self) -> Result<Vec<Service>>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;
    async fn get_deployment(&self, id: Uuid) -> Result<Option<Deployment>>;
    async fn update_deployment(&self, deployment: &Deployment) -> Result<()>;
    async fn append_deployment_log(&self, id: Uuid, line: &str) -> Result<()>;
    /// Deployments for a service, most recent first.
    async fn list_deployments_for_service(&self, service_id: Uuid) -> Result<Vec<Deployment>>;
    async fn delete_deployment(&self, id: Uuid) -> Result<()>;

    async fn list_verified_domains(&self, service_id: Uuid) -> Result<Vec<Domain>>;
}
