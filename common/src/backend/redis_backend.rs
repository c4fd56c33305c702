// Redis backend invoking the qless-core Lua command script

use super::{Backend, CompleteRequest, MessageStream, PutRequest, TagOp};
use crate::config::RedisConfig;
use crate::db::RedisPool;
use crate::errors::QueueError;
use crate::models::{JobData, JobRecord, QueueCounts, RecurField, RecurringRecord};
use async_trait::async_trait;
use futures::StreamExt;
use redis::{FromRedisValue, Script, Value};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument};

/// Backend speaking the `EVALSHA <sha> 0 <command> <now> <args...>` convention
pub struct RedisBackend {
    pool: RedisPool,
    script: Script,
}

impl RedisBackend {
    /// Connect and load the command script from `config.script_path`
    #[instrument(skip(config), fields(script = %config.script_path.display()))]
    pub async fn connect(config: &RedisConfig) -> Result<Self, QueueError> {
        let source = tokio::fs::read_to_string(&config.script_path)
            .await
            .map_err(|e| {
                QueueError::Validation(format!(
                    "Failed to read command script {}: {}",
                    config.script_path.display(),
                    e
                ))
            })?;

        let backend = Self::with_script(config, &source).await?;
        info!("Redis backend ready");
        Ok(backend)
    }

    /// Connect using an already loaded script source
    pub async fn with_script(config: &RedisConfig, source: &str) -> Result<Self, QueueError> {
        let pool = RedisPool::new(config).await?;
        Ok(Self {
            pool,
            script: Script::new(source),
        })
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    async fn call<T: FromRedisValue>(
        &self,
        command: &str,
        args: Vec<String>,
    ) -> Result<T, QueueError> {
        let mut conn = self.pool.get_connection().await;
        let mut invocation = self.script.prepare_invoke();
        invocation.arg(command).arg(super::now());
        for arg in &args {
            invocation.arg(arg);
        }

        debug!(command = command, args = args.len(), "Invoking backend command");
        let result = invocation.invoke_async(&mut conn).await?;
        Ok(result)
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        command: &str,
        args: Vec<String>,
    ) -> Result<Option<T>, QueueError> {
        let raw: Option<String> = self.call(command, args).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn call_list<T: DeserializeOwned>(
        &self,
        command: &str,
        args: Vec<String>,
    ) -> Result<Vec<T>, QueueError> {
        let raw: Option<String> = self.call(command, args).await?;
        match raw {
            Some(raw) => decode_list(&raw),
            None => Ok(Vec::new()),
        }
    }
}

/// Decode a JSON list where the Lua encoder may have written `{}` for `[]`
fn decode_list<T: DeserializeOwned>(raw: &str) -> Result<Vec<T>, QueueError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    match value {
        serde_json::Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        serde_json::Value::Null => Ok(Vec::new()),
        other => Ok(serde_json::from_value(other)?),
    }
}

// Config values may come back as integers or bulk strings
fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::Nil => None,
        Value::Int(n) => Some(n.to_string()),
        Value::Data(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Status(s) => Some(s),
        Value::Okay => Some("OK".to_string()),
        Value::Bulk(_) => None,
    }
}

fn json_list(items: &[String]) -> String {
    serde_json::Value::from(items.to_vec()).to_string()
}

fn put_args(request: &PutRequest) -> Vec<String> {
    let mut args = vec![
        request.worker.clone(),
        request.queue.clone(),
        request.jid.clone(),
        request.klass.clone(),
        request.data.to_json_string(),
        request.delay.to_string(),
        "priority".to_string(),
        request.priority.to_string(),
        "tags".to_string(),
        json_list(&request.tags),
        "retries".to_string(),
        request.retries.to_string(),
        "depends".to_string(),
        json_list(&request.depends),
    ];
    if let Some(backoff) = &request.backoff {
        args.push("backoff".to_string());
        args.push(backoff.to_json_string());
    }
    args
}

fn complete_args(request: &CompleteRequest) -> Vec<String> {
    let mut args = vec![
        request.jid.clone(),
        request.worker.clone(),
        request.queue.clone(),
        request.data.to_json_string(),
    ];
    // delay and depends are only meaningful when advancing to another queue
    if let Some(next) = &request.next {
        args.push("next".to_string());
        args.push(next.clone());
        if request.delay > 0 {
            args.push("delay".to_string());
            args.push(request.delay.to_string());
        }
        if !request.depends.is_empty() {
            args.push("depends".to_string());
            args.push(json_list(&request.depends));
        }
    }
    args
}

fn with_list(mut head: Vec<String>, tail: &[String]) -> Vec<String> {
    head.extend(tail.iter().cloned());
    head
}

#[async_trait]
impl Backend for RedisBackend {
    #[instrument(skip(self))]
    async fn pop(
        &self,
        queue: &str,
        worker: &str,
        count: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        self.call_list(
            "pop",
            vec![queue.to_string(), worker.to_string(), count.to_string()],
        )
        .await
    }

    async fn get(&self, jid: &str) -> Result<Option<JobRecord>, QueueError> {
        self.call_json("get", vec![jid.to_string()]).await
    }

    async fn get_recurring(&self, jid: &str) -> Result<Option<RecurringRecord>, QueueError> {
        self.call_json("recur.get", vec![jid.to_string()]).await
    }

    async fn put(&self, request: PutRequest) -> Result<String, QueueError> {
        self.call("put", put_args(&request)).await
    }

    async fn heartbeat(&self, jid: &str, worker: &str, data: &JobData) -> Result<f64, QueueError> {
        self.call(
            "heartbeat",
            vec![jid.to_string(), worker.to_string(), data.to_json_string()],
        )
        .await
        .map_err(|e| e.for_job(jid, "heartbeat"))
    }

    async fn complete(&self, request: CompleteRequest) -> Result<String, QueueError> {
        let state: Option<String> = self
            .call("complete", complete_args(&request))
            .await
            .map_err(|e| e.for_job(&request.jid, "complete"))?;
        state.ok_or_else(|| QueueError::Backend {
            area: "Complete".to_string(),
            message: format!("no state returned for {}", request.jid),
        })
    }

    async fn fail(
        &self,
        jid: &str,
        worker: &str,
        group: &str,
        message: &str,
        data: Option<JobData>,
    ) -> Result<Option<String>, QueueError> {
        let mut args = vec![
            jid.to_string(),
            worker.to_string(),
            group.to_string(),
            message.to_string(),
        ];
        if let Some(data) = data {
            args.push(data.to_json_string());
        }
        self.call("fail", args)
            .await
            .map_err(|e| e.for_job(jid, "fail"))
    }

    async fn retry(
        &self,
        jid: &str,
        queue: &str,
        worker: &str,
        delay: u64,
        group: &str,
        message: &str,
    ) -> Result<i64, QueueError> {
        self.call(
            "retry",
            vec![
                jid.to_string(),
                queue.to_string(),
                worker.to_string(),
                delay.to_string(),
                group.to_string(),
                message.to_string(),
            ],
        )
        .await
        .map_err(|e| e.for_job(jid, "retry"))
    }

    async fn cancel(&self, jids: &[String]) -> Result<Vec<String>, QueueError> {
        let canceled: Option<Vec<String>> = self.call("cancel", jids.to_vec()).await?;
        Ok(canceled.unwrap_or_default())
    }

    async fn requeue(&self, request: PutRequest) -> Result<String, QueueError> {
        self.call("requeue", put_args(&request))
            .await
            .map_err(|e| e.for_job(&request.jid, "requeue"))
    }

    async fn timeout(&self, jid: &str) -> Result<(), QueueError> {
        let _: Value = self
            .call("timeout", vec![jid.to_string()])
            .await
            .map_err(|e| e.for_job(jid, "timeout"))?;
        Ok(())
    }

    async fn tag(&self, op: TagOp, jid: &str, tags: &[String]) -> Result<Vec<String>, QueueError> {
        let args = with_list(vec![op.as_str().to_string(), jid.to_string()], tags);
        self.call_list("tag", args)
            .await
            .map_err(|e| e.for_job(jid, "tag"))
    }

    async fn recur_tag(
        &self,
        op: TagOp,
        jid: &str,
        tags: &[String],
    ) -> Result<Vec<String>, QueueError> {
        let command = match op {
            TagOp::Add => "recur.tag",
            TagOp::Remove => "recur.untag",
        };
        self.call_list(command, with_list(vec![jid.to_string()], tags))
            .await
            .map_err(|e| e.for_job(jid, command))
    }

    async fn recur_update(
        &self,
        jid: &str,
        field: RecurField,
        value: &str,
    ) -> Result<bool, QueueError> {
        let updated: Option<bool> = self
            .call(
                "recur.update",
                vec![jid.to_string(), field.as_str().to_string(), value.to_string()],
            )
            .await
            .map_err(|e| e.for_job(jid, "recur.update"))?;
        Ok(updated.unwrap_or(false))
    }

    async fn unrecur(&self, jid: &str) -> Result<u64, QueueError> {
        let removed: Option<u64> = self.call("unrecur", vec![jid.to_string()]).await?;
        Ok(removed.unwrap_or(0))
    }

    async fn config_get(&self, name: &str) -> Result<Option<String>, QueueError> {
        let value: Value = self.call("config.get", vec![name.to_string()]).await?;
        Ok(value_to_string(value))
    }

    async fn config_set(&self, name: &str, value: &str) -> Result<(), QueueError> {
        let _: Value = self
            .call("config.set", vec![name.to_string(), value.to_string()])
            .await?;
        Ok(())
    }

    async fn config_unset(&self, name: &str) -> Result<(), QueueError> {
        let _: Value = self.call("config.unset", vec![name.to_string()]).await?;
        Ok(())
    }

    async fn stats(&self, queue: &str, date: i64) -> Result<serde_json::Value, QueueError> {
        let stats: Option<serde_json::Value> = self
            .call_json("stats", vec![queue.to_string(), date.to_string()])
            .await?;
        Ok(stats.unwrap_or(serde_json::Value::Null))
    }

    async fn queues(&self) -> Result<Vec<QueueCounts>, QueueError> {
        self.call_list("queues", Vec::new()).await
    }

    async fn length(&self, queue: &str) -> Result<u64, QueueError> {
        self.call("length", vec![queue.to_string()]).await
    }

    #[instrument(skip(self))]
    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, QueueError> {
        let mut pubsub = self.pool.pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel.as_str()).await?;
        }
        info!(channels = ?channels, "Subscribed to backend channels");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }

    async fn reconnect(&self) -> Result<(), QueueError> {
        self.pool.reconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackoffStrategy;
    use serde_json::json;

    fn sample_put() -> PutRequest {
        PutRequest {
            worker: "w-1".to_string(),
            queue: "default".to_string(),
            jid: "jid-1".to_string(),
            klass: "Sample".to_string(),
            data: JobData::from_json_str(r#"{"a":1}"#).unwrap(),
            delay: 0,
            priority: 7,
            tags: vec!["x".to_string()],
            retries: 3,
            depends: Vec::new(),
            backoff: None,
        }
    }

    #[test]
    fn test_put_args_follow_keyword_layout() {
        let args = put_args(&sample_put());
        assert_eq!(
            args,
            vec![
                "w-1", "default", "jid-1", "Sample", r#"{"a":1}"#, "0", "priority", "7", "tags",
                r#"["x"]"#, "retries", "3", "depends", "[]",
            ]
        );
    }

    #[test]
    fn test_put_args_append_backoff_when_set() {
        let mut request = sample_put();
        request.backoff = Some(BackoffStrategy::new(30, 2));
        let args = put_args(&request);
        assert_eq!(
            &args[args.len() - 2..],
            &["backoff".to_string(), r#"{"factor":2,"initial_delay":30}"#.to_string()]
        );
    }

    #[test]
    fn test_complete_args_without_next_omit_keywords() {
        let request = CompleteRequest {
            jid: "jid-1".to_string(),
            worker: "w-1".to_string(),
            queue: "default".to_string(),
            data: JobData::new(),
            next: None,
            delay: 30,
            depends: vec!["jid-0".to_string()],
        };
        assert_eq!(complete_args(&request), vec!["jid-1", "w-1", "default", "{}"]);
    }

    #[test]
    fn test_complete_args_with_next() {
        let request = CompleteRequest {
            jid: "jid-1".to_string(),
            worker: "w-1".to_string(),
            queue: "default".to_string(),
            data: JobData::new(),
            next: Some("later".to_string()),
            delay: 30,
            depends: vec!["jid-0".to_string()],
        };
        assert_eq!(
            complete_args(&request),
            vec![
                "jid-1", "w-1", "default", "{}", "next", "later", "delay", "30", "depends",
                r#"["jid-0"]"#,
            ]
        );
    }

    #[test]
    fn test_decode_list_accepts_lua_empty_table() {
        let tags: Vec<String> = decode_list("{}").unwrap();
        assert!(tags.is_empty());

        let tags: Vec<String> = decode_list(r#"["a","b"]"#).unwrap();
        assert_eq!(tags, vec!["a", "b"]);

        assert!(decode_list::<String>("{\"a\":1}").is_err());
    }

    #[test]
    fn test_decode_list_of_jobs() {
        let raw = json!([{"jid": "j1", "klass": "K", "queue": "q", "data": "{}"}]).to_string();
        let jobs: Vec<JobRecord> = decode_list(&raw).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].jid, "j1");
    }

    #[test]
    fn test_config_values_decode_from_any_scalar() {
        assert_eq!(value_to_string(Value::Int(60)), Some("60".to_string()));
        assert_eq!(
            value_to_string(Value::Data(b"abc".to_vec())),
            Some("abc".to_string())
        );
        assert_eq!(value_to_string(Value::Nil), None);
    }

    #[tokio::test]
    async fn test_connect_with_missing_script_fails() {
        let config = RedisConfig {
            script_path: "does/not/exist.lua".into(),
            ..RedisConfig::default()
        };
        let result = RedisBackend::connect(&config).await;
        assert!(matches!(result, Err(QueueError::Validation(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Redis and qless-core/qless.lua
    async fn test_put_pop_complete_against_redis() {
        let backend = RedisBackend::connect(&RedisConfig::default()).await.unwrap();
        let mut request = sample_put();
        request.jid = uuid::Uuid::new_v4().simple().to_string();
        let jid = backend.put(request).await.unwrap();

        let popped = backend.pop("default", "w-1", 1).await.unwrap();
        assert_eq!(popped[0].jid, jid);

        let state = backend
            .complete(CompleteRequest {
                jid: jid.clone(),
                worker: "w-1".to_string(),
                queue: "default".to_string(),
                data: JobData::new(),
                next: None,
                delay: 0,
                depends: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(state, "complete");
    }
}
