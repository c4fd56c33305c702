// Watchdog: follows the event stream for the job in flight

use super::child::WatchdogVerdict;
use crate::backend::Backend;
use crate::errors::QueueError;
use crate::events::{Event, EventKind};
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

/// Decide whether `event` ends the watch for `jid` leased by `worker`.
///
/// Interrupting events must name both the job and this worker. Completion
/// and failure events may omit the worker.
pub fn judge(event: &Event, jid: &str, worker: &str) -> Option<WatchdogVerdict> {
    if !event.is_for_job(jid) {
        return None;
    }
    let worker_matches = event.is_for_worker(worker);
    let worker_compatible = event.worker.is_none() || worker_matches;

    match event.kind {
        EventKind::LockLost if worker_matches => Some(WatchdogVerdict::LockLost),
        EventKind::Canceled if worker_matches => Some(WatchdogVerdict::Canceled),
        EventKind::Completed | EventKind::Failed if worker_compatible => {
            Some(WatchdogVerdict::Resolved)
        }
        _ => None,
    }
}

/// Subscribe to `channel` and block until an event settles the job
#[instrument(skip(backend))]
pub async fn watch(
    backend: &dyn Backend,
    channel: &str,
    jid: &str,
    worker: &str,
) -> Result<WatchdogVerdict, QueueError> {
    let mut messages = backend.subscribe(&[channel.to_string()]).await?;
    info!("Watchdog listening");

    while let Some(payload) = messages.next().await {
        let Some(event) = Event::from_data(Some(&payload)) else {
            continue;
        };
        match judge(&event, jid, worker) {
            Some(verdict) => {
                if verdict.interrupts() {
                    warn!(event = %event.kind, "Job interrupted by backend event");
                } else {
                    info!(event = %event.kind, "Job resolved");
                }
                return Ok(verdict);
            }
            None => debug!(event = %event.kind, other_jid = ?event.jid, "Ignoring event"),
        }
    }

    Err(QueueError::Transport(format!(
        "Event subscription to {} closed",
        channel
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::sync::Arc;
    use std::time::Duration;

    fn event(raw: &str) -> Event {
        Event::from_data(Some(raw)).unwrap()
    }

    #[test]
    fn test_judge_requires_matching_worker_for_interrupts() {
        let ours = event(r#"{"event":"lock_lost","jid":"j","worker":"w"}"#);
        let theirs = event(r#"{"event":"lock_lost","jid":"j","worker":"other"}"#);
        let anonymous = event(r#"{"event":"canceled","jid":"j"}"#);

        assert_eq!(judge(&ours, "j", "w"), Some(WatchdogVerdict::LockLost));
        assert_eq!(judge(&theirs, "j", "w"), None);
        assert_eq!(judge(&anonymous, "j", "w"), None);
    }

    #[test]
    fn test_judge_resolves_on_completion() {
        let completed = event(r#"{"event":"completed","jid":"j","queue":"q"}"#);
        let failed = event(r#"{"event":"failed","jid":"j","worker":"w","group":"g"}"#);
        let foreign = event(r#"{"event":"failed","jid":"j","worker":"other"}"#);
        let unrelated = event(r#"{"event":"completed","jid":"k"}"#);
        let popped = event(r#"{"event":"popped","jid":"j","worker":"w"}"#);

        assert_eq!(judge(&completed, "j", "w"), Some(WatchdogVerdict::Resolved));
        assert_eq!(judge(&failed, "j", "w"), Some(WatchdogVerdict::Resolved));
        assert_eq!(judge(&foreign, "j", "w"), None);
        assert_eq!(judge(&unrelated, "j", "w"), None);
        assert_eq!(judge(&popped, "j", "w"), None);
    }

    #[tokio::test]
    async fn test_watch_skips_noise_until_cancel() {
        let backend = Arc::new(MemoryBackend::new());
        let watcher = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { watch(backend.as_ref(), "ql:log", "j", "w").await })
        };

        while backend.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        backend.publish("not json");
        backend.publish(r#"{"event":"completed","jid":"other"}"#);
        backend.publish(r#"{"event":"canceled","jid":"j","worker":"w"}"#);

        let verdict = watcher.await.unwrap().unwrap();
        assert_eq!(verdict, WatchdogVerdict::Canceled);
    }
}
