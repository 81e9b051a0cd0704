pub mod backend;
pub mod endpoint;
pub mod server;

pub use backend::{CacheBackend, CacheError};
pub use endpoint::Locator;
pub use server::{CacheServer, ServerConfig, ServerHandle};
