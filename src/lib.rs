//! Library crate for quiz-arena: the trivia session engine, its synchronization
//! backends and the session store server, exposed for binaries and integration tests.

pub mod config;
pub mod dao;
mod dto;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
