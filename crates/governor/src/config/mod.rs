pub mod cli;
pub mod daemon;
pub mod policy;

pub use cli::*;
pub use daemon::*;
