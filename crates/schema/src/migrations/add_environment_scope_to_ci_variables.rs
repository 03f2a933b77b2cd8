use async_trait::async_trait;
use tidemark_migrate::{ColumnOptions, ColumnType, Migration, MigrationContext, MigrationResult};

pub struct AddEnvironmentScopeToCiVariables;

#[async_trait]
impl Migration for AddEnvironmentScopeToCiVariables {
    fn version(&self) -> i64 {
        20170622135451
    }

    fn name(&self) -> &str {
        "add_environment_scope_to_ci_variables"
    }

    async fn up(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        if ctx.column_exists("ci_variables", "environment_scope").await? {
            tracing::warn!("ci_variables.environment_scope already exists");
            return Ok(());
        }

        ctx.add_column(
            "ci_variables",
            "environment_scope",
            ColumnType::String(Some(255)),
            ColumnOptions::new().not_null().default_value("*"),
        )
        .await
    }

    async fn down(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        if ctx.column_exists("ci_variables", "environment_scope").await? {
            ctx.remove_column("ci_variables", "environment_scope").await?;
        }
        Ok(())
    }
}
