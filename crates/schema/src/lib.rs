//! # tidemark-schema
//!
//! The application's typed migrations, in version order, ready to hand to
//! a [`Migrator`](tidemark_migrate::Migrator).

pub mod migrations;
pub mod visibility;

use tidemark_migrate::Migration;

pub use migrations::*;

/// Every catalog migration, ascending by version
pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(CreateSnippets),
        Box::new(AddVisibilityLevelToSnippets),
        Box::new(CreateCiVariables),
        Box::new(AddEnvironmentScopeToCiVariables),
        Box::new(RemoveDuplicatedCiVariables),
        Box::new(AddUniqueIndexToCiVariables),
        Box::new(AddTimestampsToCiVariables),
    ]
}
