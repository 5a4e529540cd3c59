//! PredEx core: binary prediction-market exchange — continuous matching,
//! escrowed settlement, and event fan-out, with the transport (HTTP/WS),
//! auth, rate limiting, and admin UX layered on top by a caller (see
//! `src/bin/server.rs`).

pub mod book;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod escrow;
pub mod eventbus;
pub mod gateway;
pub mod ids;
pub mod market_actor;
pub mod models;
pub mod recovery;
pub mod settlement;
