//! CLI command implementations

pub mod migrate;
pub mod repair;
pub mod request;

use crate::output::OutputFormat;
use anyhow::{Context as _, Result};
use diwan_core::{AppConfig, TracingPublisher};
use diwan_infra::{create_pool, PgApprovalStore, PgDirectory, PgPool};
use diwan_workflow::RequestStateMachine;
use std::sync::Arc;

/// Shared state for one command invocation
pub struct Context {
    pub pool: PgPool,
    pub config: AppConfig,
    pub format: OutputFormat,
}

impl Context {
    pub async fn connect(config: AppConfig, format: OutputFormat) -> Result<Self> {
        let pool = create_pool(&config.database)
            .await
            .context("Failed to connect to the database")?;
        Ok(Self {
            pool,
            config,
            format,
        })
    }

    /// State machine over the PostgreSQL store and role directory
    pub fn machine(&self) -> RequestStateMachine {
        let store = Arc::new(PgApprovalStore::new(self.pool.clone()));
        let directory = Arc::new(PgDirectory::new(
            self.pool.clone(),
            self.config.workflow.admin_role.as_str(),
        ));
        RequestStateMachine::new(store, directory, Arc::new(TracingPublisher))
            .with_config(&self.config.workflow)
    }
}
