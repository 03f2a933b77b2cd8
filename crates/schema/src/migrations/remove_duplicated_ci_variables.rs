use async_trait::async_trait;
use tidemark_migrate::{Migration, MigrationContext, MigrationResult};

/// Keeps only the newest variable per `(project_id, key, environment_scope)`
/// so the unique index that follows can be built.
pub struct RemoveDuplicatedCiVariables;

#[async_trait]
impl Migration for RemoveDuplicatedCiVariables {
    fn version(&self) -> i64 {
        20170622135628
    }

    fn name(&self) -> &str {
        "remove_duplicated_ci_variables"
    }

    async fn up(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        ctx.remove_duplicates("ci_variables", &["project_id", "key", "environment_scope"])
            .await?;
        Ok(())
    }

    /// Deleted duplicates cannot be restored
    async fn down(&self, _ctx: &mut MigrationContext) -> MigrationResult<()> {
        Ok(())
    }
}
