use crate::Result;
use sqlx::PgPool;

/// Apply pending migrations from this crate's `migrations/` directory
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrator = sqlx::migrate!("./migrations");
    tracing::info!(available = migrator.iter().count(), "Running migrations");
    migrator.run(pool).await?;
    tracing::info!("Migrations applied");
    Ok(())
}
