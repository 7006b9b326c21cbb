pub mod keyed_lock;
pub mod logging;
pub mod version;
