/// Row models and query primitives shared by every store.
pub mod models;
/// Typed access to the session tables on top of a [`session_store::SessionStore`].
pub mod repository;
/// Session store abstraction and its implementations.
pub mod session_store;
/// Storage abstraction layer errors.
pub mod storage;
