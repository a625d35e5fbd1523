// Agora common library - main library exports

pub mod crypto;
pub mod hash;
pub mod messages;
pub mod slots;
pub mod types;

// Flattened re-exports
pub use self::hash::*;
pub use self::types::*;
