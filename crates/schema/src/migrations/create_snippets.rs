use async_trait::async_trait;
use tidemark_migrate::{IndexOptions, Migration, MigrationContext, MigrationResult};

/// Creates `snippets` with the legacy `private` flag
pub struct CreateSnippets;

#[async_trait]
impl Migration for CreateSnippets {
    fn version(&self) -> i64 {
        20160226100000
    }

    fn name(&self) -> &str {
        "create_snippets"
    }

    async fn up(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        ctx.create_table("snippets", |t| {
            t.id();
            t.string("title", Some(255));
            t.text("content");
            t.integer("author_id").not_null();
            t.integer("project_id");
            t.string("file_name", Some(255));
            t.boolean("private").not_null().default_value(true);
            t.timestamps_with_timezone();
            t.index(&["author_id"], IndexOptions::new());
            t.index(&["project_id"], IndexOptions::new());
        })
        .await
    }

    async fn down(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        ctx.drop_table("snippets").await
    }
}
