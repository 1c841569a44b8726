pub mod health;
pub mod store;
