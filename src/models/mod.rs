pub mod backend;
pub mod instance;

pub use backend::*;
pub use instance::*;
