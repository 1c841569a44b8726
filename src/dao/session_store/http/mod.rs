mod config;
mod error;
mod store;

pub use config::HttpStoreConfig;
pub use error::{HttpDaoError, HttpResult};
pub use store::HttpSessionStore;
