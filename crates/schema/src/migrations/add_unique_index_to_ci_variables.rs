use async_trait::async_trait;
use tidemark_migrate::{IndexOptions, Migration, MigrationContext, MigrationResult};

pub const CI_VARIABLES_UNIQUE_INDEX: &str = "index_ci_variables_on_project_id_and_key_and_environment_scope";

const COLUMNS: [&str; 3] = ["project_id", "key", "environment_scope"];

pub struct AddUniqueIndexToCiVariables;

#[async_trait]
impl Migration for AddUniqueIndexToCiVariables {
    fn version(&self) -> i64 {
        20170622135728
    }

    fn name(&self) -> &str {
        "add_unique_index_to_ci_variables"
    }

    fn ddl_transaction(&self) -> bool {
        false
    }

    async fn up(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        ctx.add_concurrent_index(
            "ci_variables",
            &COLUMNS,
            &IndexOptions::new().unique().name(CI_VARIABLES_UNIQUE_INDEX),
        )
        .await
    }

    async fn down(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        ctx.remove_concurrent_index_by_name("ci_variables", CI_VARIABLES_UNIQUE_INDEX)
            .await
    }
}
