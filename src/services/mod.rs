/// Host-side turn coordination.
pub mod coordinator;
/// Restartable question countdown.
pub mod countdown;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Speed-weighted answer scoring.
pub mod scoring;
/// Store-server handlers for the session tables.
pub mod store_service;
/// Session synchronization between participants.
pub mod sync;
