pub mod error;
pub mod loader;
pub mod model;
mod raw;

pub use loader::load_or_default;
pub use model::*;
