//! Layered YAML configuration for the daemon and its registered workspaces.

mod loader;
mod schema;

pub use loader::load;
pub use schema::*;
