// Meander common library - main library exports

pub mod messages;
pub mod types;

// Flattened re-exports
pub use self::types::*;
