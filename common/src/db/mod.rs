// Connection management for the queue store

pub mod redis;

pub use self::redis::RedisPool;
