// Database connection management
//
// DbConnector trait: the orchestrator and the HTTP layer only see this seam, so
// connection failure paths are testable without a real MySQL server.

use async_trait::async_trait;
use log::{debug, info, warn};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::Connection;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::database::provisioning::{create_db_stmt, db_exists_query, CreateDatabaseResult};
use crate::models::requests::DatabaseCredentials;
use crate::utils::logging::describe_db_target;

// =============================================================================
// Errors
// =============================================================================

/// Connection or statement failure, carrying the driver's message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("Connection timed out after {0}s. Check host, port and firewall.")]
    Timeout(u64),
    #[error("{0}")]
    Driver(String),
}

impl ConnectError {
    /// Driver error with any occurrence of `password` scrubbed from the message.
    pub fn driver(message: impl Into<String>, password: &str) -> Self {
        let message = message.into();
        if password.is_empty() {
            return Self::Driver(message);
        }
        Self::Driver(message.replace(password, "***"))
    }
}

// =============================================================================
// DbConnector Trait
// =============================================================================

/// Production code uses `MySqlConnector`; tests use stubs.
#[async_trait]
pub trait DbConnector: Send + Sync {
    /// Open a server-level connection (no database selected) and close it again.
    async fn ping(&self, creds: &DatabaseCredentials) -> Result<(), ConnectError>;

    /// Open an administrative connection and create `creds.name` if missing.
    async fn create_database(
        &self,
        creds: &DatabaseCredentials,
    ) -> Result<CreateDatabaseResult, ConnectError>;
}

/// MySQL / MariaDB connector backed by sqlx.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    connect_timeout: Duration,
}

impl MySqlConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn options(creds: &DatabaseCredentials) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&creds.host)
            .port(creds.port)
            .username(&creds.username)
            .password(&creds.password)
    }

    async fn open(&self, creds: &DatabaseCredentials) -> Result<MySqlConnection, ConnectError> {
        let opts = Self::options(creds);
        match timeout(self.connect_timeout, MySqlConnection::connect_with(&opts)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(ConnectError::driver(e.to_string(), &creds.password)),
            Err(_) => Err(ConnectError::Timeout(self.connect_timeout.as_secs().max(1))),
        }
    }
}

async fn close_quietly(conn: MySqlConnection) {
    if let Err(e) = conn.close().await {
        debug!(
            "[PHASE: database] [STEP: connect] Connection close reported an error: {}",
            e
        );
    }
}

#[async_trait]
impl DbConnector for MySqlConnector {
    async fn ping(&self, creds: &DatabaseCredentials) -> Result<(), ConnectError> {
        let conn = self.open(creds).await?;
        close_quietly(conn).await;
        Ok(())
    }

    async fn create_database(
        &self,
        creds: &DatabaseCredentials,
    ) -> Result<CreateDatabaseResult, ConnectError> {
        let mut conn = self.open(creds).await?;

        let result = async {
            let existing: i64 = sqlx::query_scalar(db_exists_query())
                .bind(&creds.name)
                .fetch_one(&mut conn)
                .await
                .map_err(|e| ConnectError::driver(e.to_string(), &creds.password))?;

            // Prepared like any other statement; MySQL allows CREATE DATABASE here.
            let stmt = create_db_stmt(&creds.name);
            sqlx::query(&stmt)
                .execute(&mut conn)
                .await
                .map_err(|e| ConnectError::driver(e.to_string(), &creds.password))?;

            Ok(CreateDatabaseResult {
                created: existing == 0,
                db_name: creds.name.clone(),
            })
        }
        .await;

        close_quietly(conn).await;
        result
    }
}

// =============================================================================
// Credential Validator
// =============================================================================

/// Check that `creds` can open a connection. Nothing is created or retained.
pub async fn validate_database(
    connector: &dyn DbConnector,
    creds: &DatabaseCredentials,
) -> Result<(), ConnectError> {
    let started = Instant::now();
    let target = describe_db_target(&creds.host, creds.port, &creds.username, None);
    info!(
        "[PHASE: database] [STEP: validate] validate_database entered (target={})",
        target
    );

    match connector.ping(creds).await {
        Ok(()) => {
            info!(
                "[PHASE: database] [STEP: validate] Connection ok (target={}, duration_ms={})",
                target,
                started.elapsed().as_millis()
            );
            Ok(())
        }
        Err(e) => {
            warn!(
                "[PHASE: database] [STEP: validate] Connection failed (target={}, duration_ms={}): {}",
                target,
                started.elapsed().as_millis(),
                e
            );
            Err(e)
        }
    }
}
