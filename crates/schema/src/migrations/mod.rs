//! Catalog migrations, one module per version

mod add_environment_scope_to_ci_variables;
mod add_timestamps_to_ci_variables;
mod add_unique_index_to_ci_variables;
mod add_visibility_level_to_snippets;
mod create_ci_variables;
mod create_snippets;
mod remove_duplicated_ci_variables;

pub use add_environment_scope_to_ci_variables::AddEnvironmentScopeToCiVariables;
pub use add_timestamps_to_ci_variables::AddTimestampsToCiVariables;
pub use add_unique_index_to_ci_variables::{AddUniqueIndexToCiVariables, CI_VARIABLES_UNIQUE_INDEX};
pub use add_visibility_level_to_snippets::{AddVisibilityLevelToSnippets, VISIBILITY_LEVEL_INDEX};
pub use create_ci_variables::CreateCiVariables;
pub use create_snippets::CreateSnippets;
pub use remove_duplicated_ci_variables::RemoveDuplicatedCiVariables;
