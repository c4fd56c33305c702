// Consumer side of a Redis-backed job queue: client handles, reservers and
// the worker process supervisor

pub mod backend;
pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod models;
pub mod reserver;
pub mod telemetry;
pub mod worker;
