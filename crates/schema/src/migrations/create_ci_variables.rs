use async_trait::async_trait;
use tidemark_migrate::{IndexOptions, Migration, MigrationContext, MigrationResult};

/// Creates `ci_variables`, scoped to a project
pub struct CreateCiVariables;

#[async_trait]
impl Migration for CreateCiVariables {
    fn version(&self) -> i64 {
        20170612150426
    }

    fn name(&self) -> &str {
        "create_ci_variables"
    }

    async fn up(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        ctx.create_table("ci_variables", |t| {
            t.id();
            t.string("key", Some(255)).not_null();
            t.text("value");
            t.text("encrypted_value");
            t.string("encrypted_value_salt", Some(255));
            t.string("encrypted_value_iv", Some(255));
            t.integer("project_id").not_null();
            t.boolean("protected").not_null().default_value(false);
            t.index(&["project_id"], IndexOptions::new());
        })
        .await
    }

    async fn down(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        ctx.drop_table("ci_variables").await
    }
}
