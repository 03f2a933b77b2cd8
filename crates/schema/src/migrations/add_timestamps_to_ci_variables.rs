use async_trait::async_trait;
use tidemark_migrate::{Migration, MigrationContext, MigrationResult, TimestampOptions};

const TABLE: &str = "ci_variables";
const TIMESTAMP_COLUMNS: [&str; 2] = ["created_at", "updated_at"];

/// Adds nullable `created_at`/`updated_at`; existing rows have no value to backfill
pub struct AddTimestampsToCiVariables;

#[async_trait]
impl Migration for AddTimestampsToCiVariables {
    fn version(&self) -> i64 {
        20171010150000
    }

    fn name(&self) -> &str {
        "add_timestamps_to_ci_variables"
    }

    async fn up(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        let missing = columns_where(ctx, false).await?;
        if missing.is_empty() {
            return Ok(());
        }

        let options = TimestampOptions::default().columns(&missing).nullable();
        ctx.add_timestamps_with_timezone(TABLE, &options).await
    }

    async fn down(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        let present = columns_where(ctx, true).await?;
        ctx.remove_timestamps(TABLE, &TimestampOptions::default().columns(&present))
            .await
    }
}

/// Timestamp columns whose presence on `ci_variables` matches `exists`
async fn columns_where(ctx: &mut MigrationContext, exists: bool) -> MigrationResult<Vec<&'static str>> {
    let mut columns = Vec::new();
    for column in TIMESTAMP_COLUMNS {
        if ctx.column_exists(TABLE, column).await? == exists {
            columns.push(column);
        }
    }
    Ok(columns)
}
