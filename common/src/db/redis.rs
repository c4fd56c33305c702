// Redis connection pool and health check

use crate::config::RedisConfig;
use crate::errors::QueueError;
use redis::aio::{ConnectionManager, PubSub};
use redis::Client;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument};

/// Redis connection pool wrapper
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    manager: Arc<RwLock<ConnectionManager>>,
}

impl RedisPool {
    /// Create a new Redis connection pool
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub async fn new(config: &RedisConfig) -> Result<Self, QueueError> {
        info!("Initializing Redis connection pool");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            QueueError::Transport(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = Self::connect(&client).await?;

        info!("Redis connection pool initialized successfully");

        Ok(Self {
            client,
            manager: Arc::new(RwLock::new(manager)),
        })
    }

    async fn connect(client: &Client) -> Result<ConnectionManager, QueueError> {
        ConnectionManager::new(client.clone()).await.map_err(|e| {
            QueueError::Transport(format!("Failed to create connection manager: {}", e))
        })
    }

    /// Get a connection from the pool
    pub async fn get_connection(&self) -> ConnectionManager {
        self.manager.read().await.clone()
    }

    /// Replace the command connection with a fresh one
    #[instrument(skip(self))]
    pub async fn reconnect(&self) -> Result<(), QueueError> {
        let fresh = Self::connect(&self.client).await?;
        *self.manager.write().await = fresh;
        Ok(())
    }

    /// Open a dedicated pub/sub connection
    pub async fn pubsub(&self) -> Result<PubSub, QueueError> {
        self.client
            .get_async_pubsub()
            .await
            .map_err(|e| QueueError::Transport(format!("Failed to open pub/sub connection: {}", e)))
    }

    /// Health check - verify Redis connection is working
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.get_connection().await;

        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Transport(format!("Health check failed: {}", e)))?;

        if response != "PONG" {
            return Err(QueueError::Transport(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}
