//! SQLite implementation of [`Dal`], grounded in the teacher's own
//! `Persistence` struct (`deployer/src/persistence.rs`): a `SqlitePool`
//! behind a cheaply-cloneable struct, inline `CREATE TABLE IF NOT EXISTS`
//! DDL run once at construction (rather than a separate migrations
//! directory — the teacher itself does this for its `deployments`/`logs`
//! tables), and `sqlx::query`/`query_as` with positional `?` binding
//! throughout. `Service.env` and the domain list are stored as JSON text
//! columns, matching the egress contract's "JSON column for encrypted env
//! map" requirement.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use renderlite_common::{Deployment, DeploymentStatus, Domain, Envelope, Service, ServiceStatus};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::persistence::Dal;

#[derive(Clone)]
pub struct SqliteDal {
    pool: SqlitePool,
}

impl SqliteDal {
    pub async fn new(database_path: &str) -> Result<Self> {
        if !Sqlite::database_exists(database_path).await.unwrap_or(false)
            && database_path != "sqlite::memory:"
            && !Path::new(database_path).exists()
        {
            Sqlite::create_database(database_path).await?;
        }
        let pool = SqlitePool::connect(database_path).await?;
        Self::from_pool(pool).await
    }

    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS services (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                repo_url TEXT NOT NULL,
                branch TEXT NOT NULL,
                runtime_hint TEXT,
                subdomain TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                container_id TEXT,
                env_json TEXT NOT NULL,
                health_check_path TEXT,
                health_check_interval_sec INTEGER,
                health_check_timeout_sec INTEGER,
                webhook_secret TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                service_id TEXT NOT NULL,
                status TEXT NOT NULL,
                commit_sha TEXT,
                image_tag TEXT,
                logs TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS domains (
                id TEXT PRIMARY KEY,
                service_id TEXT NOT NULL,
                hostname TEXT NOT NULL,
                verified INTEGER NOT NULL,
                verification_token TEXT NOT NULL
            );
            ",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn encode_env(env: &BTreeMap<String, Envelope>) -> Result<String> {
    let as_strings: BTreeMap<&str, &str> =
        env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    serde_json::to_string(&as_strings)
        .map_err(|e| Error::Common(renderlite_common::Error::Json(e)))
}

fn decode_env(json: &str) -> Result<BTreeMap<String, Envelope>> {
    let as_strings: BTreeMap<String, String> = serde_json::from_str(json)
        .map_err(|e| Error::Common(renderlite_common::Error::Json(e)))?;
    as_strings
        .into_iter()
        .map(|(k, v)| Ok((k, v.parse::<Envelope>().map_err(Error::Common)?)))
        .collect()
}

fn service_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Service> {
    let status_str: String = row.try_get("status")?;
    let env_json: String = row.try_get("env_json")?;
    let webhook_secret_str: String = row.try_get("webhook_secret")?;

    Ok(Service {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
            .map_err(|e| Error::Integrity(e.to_string()))?,
        project_id: Uuid::parse_str(&row.try_get::<String, _>("project_id")?)
            .map_err(|e| Error::Integrity(e.to_string()))?,
        name: row.try_get("name")?,
        repo_url: row.try_get("repo_url")?,
        branch: row.try_get("branch")?,
        runtime_hint: row.try_get("runtime_hint")?,
        subdomain: row.try_get("subdomain")?,
        status: ServiceStatus::from_str(&status_str)
            .map_err(|e| Error::Integrity(e.to_string()))?,
        container_id: row.try_get("container_id")?,
        env: decode_env(&env_json)?,
        health_check_path: row.try_get("health_check_path")?,
        health_check_interval_sec: row
            .try_get::<Option<i64>, _>("health_check_interval_sec")?
            .map(|v| v as u32),
        health_check_timeout_sec: row
            .try_get::<Option<i64>, _>("health_check_timeout_sec")?
            .map(|v| v as u32),
        webhook_secret: webhook_secret_str.parse().map_err(Error::Common)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn deployment_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Deployment> {
    let status_str: String = row.try_get("status")?;

    Ok(Deployment {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
            .map_err(|e| Error::Integrity(e.to_string()))?,
        service_id: Uuid::parse_str(&row.try_get::<String, _>("service_id")?)
            .map_err(|e| Error::Integrity(e.to_string()))?,
        status: DeploymentStatus::from_str(&status_str)
            .map_err(|e| Error::Integrity(e.to_string()))?,
        commit_sha: row.try_get("commit_sha")?,
        image_tag: row.try_get("image_tag")?,
        logs: row.try_get("logs")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
    })
}

fn domain_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Domain> {
    Ok(Domain {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
            .map_err(|e| Error::Integrity(e.to_string()))?,
        service_id: Uuid::parse_str(&row.try_get::<String, _>("service_id")?)
            .map_err(|e| Error::Integrity(e.to_string()))?,
        hostname: row.try_get("hostname")?,
        verified: row.try_get::<i64, _>("verified")? != 0,
        verification_token: row.try_get("verification_token")?,
    })
}

#[async_trait]
impl Dal for SqliteDal {
    async fn create_service(&self, service: &Service) -> Result<()> {
        sqlx::query(
            "INSERT INTO services (
                id, project_id, name, repo_url, branch, runtime_hint, subdomain, status,
                container_id, env_json, health_check_path, health_check_interval_sec,
                health_check_timeout_sec, webhook_secret, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(service.id.to_string())
        .bind(service.project_id.to_string())
        .bind(&service.name)
        .bind(&service.repo_url)
        .bind(&service.branch)
        .bind(&service.runtime_hint)
        .bind(&service.subdomain)
        .bind(service.status.to_string())
        .bind(&service.container_id)
        .bind(encode_env(&service.env)?)
        .bind(&service.health_check_path)
        .bind(service.health_check_interval_sec.map(|v| v as i64))
        .bind(service.health_check_timeout_sec.map(|v| v as i64))
        .bind(service.webhook_secret.as_str())
        .bind(service.created_at)
        .bind(service.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_service(&self, id: Uuid) -> Result<Option<Service>> {
        let row = sqlx::query("SELECT * FROM services WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| service_from_row(&r)).transpose()
    }

    async fn update_service(&self, service: &Service) -> Result<()> {
        sqlx::query(
            "UPDATE services SET
                name = ?, repo_url = ?, branch = ?, runtime_hint = ?, status = ?,
                container_id = ?, env_json = ?, health_check_path = ?,
                health_check_interval_sec = ?, health_check_timeout_sec = ?,
                webhook_secret = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&service.name)
        .bind(&service.repo_url)
        .bind(&service.branch)
        .bind(&service.runtime_hint)
        .bind(service.status.to_string())
        .bind(&service.container_id)
        .bind(encode_env(&service.env)?)
        .bind(&service.health_check_path)
        .bind(service.health_check_interval_sec.map(|v| v as i64))
        .bind(service.health_check_timeout_sec.map(|v| v as i64))
        .bind(service.webhook_secret.as_str())
        .bind(service.updated_at)
        .bind(service.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn subdomain_taken(&self, subdomain: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM services WHERE subdomain = ?")
            .bind(subdomain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let rows = sqlx::query("SELECT * FROM services").fetch_all(&self.pool).await?;
        rows.iter().map(service_from_row).collect()
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        sqlx::query(
            "INSERT INTO deployments (
                id, service_id, status, commit_sha, image_tag, logs, created_at, started_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(deployment.id.to_string())
        .bind(deployment.service_id.to_string())
        .bind(deployment.status.to_string())
        .bind(&deployment.commit_sha)
        .bind(&deployment.image_tag)
        .bind(&deployment.logs)
        .bind(deployment.created_at)
        .bind(deployment.started_at)
        .bind(deployment.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Option<Deployment>> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| deployment_from_row(&r)).transpose()
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
        sqlx::query(
            "UPDATE deployments SET
                status = ?, commit_sha = ?, image_tag = ?, logs = ?, started_at = ?, finished_at = ?
             WHERE id = ?",
        )
        .bind(deployment.status.to_string())
        .bind(&deployment.commit_sha)
        .bind(&deployment.image_tag)
        .bind(&deployment.logs)
        .bind(deployment.started_at)
        .bind(deployment.finished_at)
        .bind(deployment.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_deployment_log(&self, id: Uuid, line: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET logs = logs || ? WHERE id = ?")
            .bind(format!("{line}\n"))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_deployments_for_service(&self, service_id: Uuid) -> Result<Vec<Deployment>> {
        let rows = sqlx::query(
            "SELECT * FROM deployments WHERE service_id = ? ORDER BY created_at DESC",
        )
        .bind(service_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deployment_from_row).collect()
    }

    async fn delete_deployment(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM deployments WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_verified_domains(&self, service_id: Uuid) -> Result<Vec<Domain>> {
        let rows = sqlx::query("SELECT * FROM domains WHERE service_id = ? AND verified = 1")
            .bind(service_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(domain_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderlite_common::Envelope;

    fn sample_service(subdomain: &str) -> Service {
        let now = Utc::now();
        Service {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "api-x".into(),
            repo_url: "https://github.com/example/api-x".into(),
            branch: "main".into(),
            runtime_hint: None,
            subdomain: subdomain.into(),
            status: ServiceStatus::Created,
            container_id: None,
            env: BTreeMap::from([("PORT".to_string(), Envelope::new("aa", "bb", "cc"))]),
            health_check_path: None,
            health_check_interval_sec: None,
            health_check_timeout_sec: None,
            webhook_secret: Envelope::new("dd", "ee", "ff"),
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_deployment(service_id: Uuid) -> Deployment {
        Deployment {
            id: Uuid::new_v4(),
            service_id,
            status: DeploymentStatus::Queued,
            commit_sha: None,
            image_tag: None,
            logs: String::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn service_round_trips_including_env_and_envelope() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        let service = sample_service("api-x-ab12cd");
        dal.create_service(&service).await.unwrap();

        let fetched = dal.get_service(service.id).await.unwrap().unwrap();
        assert_eq!(fetched.subdomain, "api-x-ab12cd");
        assert_eq!(fetched.env.get("PORT").unwrap().as_str(), "aa:bb:cc");
        assert_eq!(fetched.webhook_secret.as_str(), "dd:ee:ff");
    }

    #[tokio::test]
    async fn subdomain_uniqueness_is_observable_before_insert_races() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        let service = sample_service("api-x-ab12cd");
        dal.create_service(&service).await.unwrap();

        assert!(dal.subdomain_taken("api-x-ab12cd").await.unwrap());
        assert!(!dal.subdomain_taken("totally-different").await.unwrap());
    }

    #[tokio::test]
    async fn deployment_updates_and_log_append() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        let service = sample_service("api-x-ab12cd");
        dal.create_service(&service).await.unwrap();

        let mut deployment = sample_deployment(service.id);
        dal.create_deployment(&deployment).await.unwrap();

        dal.append_deployment_log(deployment.id, "cloning repo").await.unwrap();
        dal.append_deployment_log(deployment.id, "build succeeded").await.unwrap();

        deployment.status = DeploymentStatus::Success;
        deployment.image_tag = Some("renderlite-api-x-ab12cd:abc1234".into());
        dal.update_deployment(&deployment).await.unwrap();

        let fetched = dal.get_deployment(deployment.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, DeploymentStatus::Success);
        assert_eq!(fetched.image_tag.as_deref(), Some("renderlite-api-x-ab12cd:abc1234"));
        assert!(fetched.logs.contains("cloning repo"));
        assert!(fetched.logs.contains("build succeeded"));
    }

    #[tokio::test]
    async fn list_deployments_for_service_orders_most_recent_first() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        let service = sample_service("api-x-ab12cd");
        dal.create_service(&service).await.unwrap();

        let mut older = sample_deployment(service.id);
        older.created_at = Utc::now() - chrono::Duration::seconds(10);
        dal.create_deployment(&older).await.unwrap();

        let newer = sample_deployment(service.id);
        dal.create_deployment(&newer).await.unwrap();

        let deployments = dal.list_deployments_for_service(service.id).await.unwrap();
        assert_eq!(deployments.len(), 2);
        assert_eq!(deployments[0].id, newer.id);
        assert_eq!(deployments[1].id, older.id);
    }

    #[tokio::test]
    async fn deployment_deletion() {
        let dal = SqliteDal::new_in_memory().await.unwrap();
        let service = sample_service("api-x-ab12cd");
        dal.create_service(&service).await.unwrap();
        let deployment = sample_deployment(service.id);
        dal.create_deployment(&deployment).await.unwrap();

        dal.delete_deployment(deployment.id).await.unwrap();
        assert!(dal.get_deployment(deployment.id).await.unwrap().is_none());
    }
}
