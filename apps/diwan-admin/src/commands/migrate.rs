//! Migration command

use super::Context;
use crate::output;
use anyhow::{Context as _, Result};
use diwan_infra::{ping, run_migrations};

pub async fn run(ctx: &Context) -> Result<()> {
    ping(&ctx.pool).await.context("Database is not reachable")?;
    run_migrations(&ctx.pool)
        .await
        .context("Failed to apply migrations")?;

    output::success("Migrations applied");
    Ok(())
}
