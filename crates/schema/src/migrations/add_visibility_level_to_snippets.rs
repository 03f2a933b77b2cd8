use async_trait::async_trait;
use tidemark_migrate::{
    ColumnOptions, ColumnType, IndexOptions, Migration, MigrationContext, MigrationResult,
    UpdateInBatchesOptions,
};

use crate::visibility;

pub const VISIBILITY_LEVEL_INDEX: &str = "index_snippets_on_visibility_level";

/// Replaces `snippets.private` with an integer `visibility_level`.
///
/// Private snippets become `PRIVATE` and public ones `INTERNAL`. The
/// backfill runs in batches and the index is built concurrently, so the
/// DDL transaction is disabled; every step checks the catalog first and
/// the migration can be re-run after a partial failure.
pub struct AddVisibilityLevelToSnippets;

#[async_trait]
impl Migration for AddVisibilityLevelToSnippets {
    fn version(&self) -> i64 {
        20160226114608
    }

    fn name(&self) -> &str {
        "add_visibility_level_to_snippets"
    }

    fn ddl_transaction(&self) -> bool {
        false
    }

    async fn up(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        if !ctx.column_exists("snippets", "visibility_level").await? {
            ctx.add_column(
                "snippets",
                "visibility_level",
                ColumnType::Integer,
                ColumnOptions::new().not_null().default_value(visibility::PRIVATE),
            )
            .await?;
        }

        if ctx.column_exists("snippets", "private").await? {
            for private in [true, false] {
                let flag = if private { ctx.true_value() } else { ctx.false_value() };
                let options = UpdateInBatchesOptions::default().condition(format!("private = {}", flag));
                let level = visibility::from_private_flag(private).to_string();
                ctx.update_column_in_batches("snippets", "visibility_level", &level, &options)
                    .await?;
            }
        }

        ctx.add_concurrent_index(
            "snippets",
            &["visibility_level"],
            &IndexOptions::new().name(VISIBILITY_LEVEL_INDEX),
        )
        .await?;

        if ctx.column_exists("snippets", "private").await? {
            ctx.remove_column("snippets", "private").await?;
        }
        Ok(())
    }

    async fn down(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        if !ctx.column_exists("snippets", "private").await? {
            ctx.add_column(
                "snippets",
                "private",
                ColumnType::Boolean,
                ColumnOptions::new().not_null().default_value(true),
            )
            .await?;
        }

        if ctx.column_exists("snippets", "visibility_level").await? {
            let options = UpdateInBatchesOptions::default()
                .condition(format!("visibility_level <> {}", visibility::PRIVATE));
            let public = ctx.false_value().to_string();
            ctx.update_column_in_batches("snippets", "private", &public, &options)
                .await?;

            // The index has to go before its column can be dropped on SQLite
            ctx.remove_concurrent_index_by_name("snippets", VISIBILITY_LEVEL_INDEX)
                .await?;
            ctx.remove_column("snippets", "visibility_level").await?;
        }
        Ok(())
    }
}
