//! Persistent subscription on the election key.
//!
//! One task owns the service subscription and hands each event to the
//! handler in delivery order. If the service side closes the stream the
//! task re-subscribes from the last delivered revision, pausing between
//! rounds. When that revision has been compacted away the handler rebuilds
//! its state from a fresh read and the watch is re-armed just past it.

use crate::{
    config::RetryPolicy,
    elector::ChangeHandler,
    error::{Error, Result},
    service::{CoordinationService, Subscription},
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MIN_RECONNECT_PAUSE: Duration = Duration::from_millis(10);

pub struct ChangeWatcher {
    key: String,
    running: Mutex<Option<Running>>,
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("key", &self.key)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ChangeWatcher {
    /// Subscribes to `key` and starts dispatching events to `handler`.
    ///
    /// `start_revision` should be one past the revision the caller's state
    /// already reflects, so nothing between that state and the subscription
    /// is missed.
    pub async fn watch(
        service: Arc<dyn CoordinationService>,
        key: &str,
        start_revision: Option<i64>,
        handler: Arc<dyn ChangeHandler>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let (subscription, last_revision) = match service.watch(key, start_revision).await {
            Ok(subscription) => (subscription, start_revision.map_or(0, |rev| rev - 1)),
            Err(Error::Compacted { compact_revision }) => {
                warn!(key, compact_revision, "start revision compacted, re-reading state");
                let revision = handler.resync().await?;
                (service.watch(key, Some(revision + 1)).await?, revision)
            }
            Err(e) => return Err(e),
        };
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(dispatch(
            service,
            subscription,
            last_revision,
            handler,
            retry,
            stopped,
        ));
        info!(key, ?start_revision, "watching for leader changes");

        Ok(Self {
            key: key.to_string(),
            running: Mutex::new(Some(Running { stop, task })),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Stops delivery. Waits for an in-flight callback to complete; no
    /// callback runs after this returns.
    pub async fn cancel(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        let _ = running.stop.send(());
        if let Err(e) = running.task.await {
            if !e.is_cancelled() {
                error!(key = %self.key, "watch task failed: {}", e);
            }
        }
        debug!(key = %self.key, "watcher cancelled");
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.task.abort();
        }
    }
}

async fn dispatch(
    service: Arc<dyn CoordinationService>,
    mut subscription: Subscription,
    mut last_revision: i64,
    handler: Arc<dyn ChangeHandler>,
    retry: RetryPolicy,
    mut stopped: oneshot::Receiver<()>,
) {
    let key = subscription.key().to_string();
    loop {
        let item = tokio::select! {
            biased;
            _ = &mut stopped => break,
            item = subscription.next() => item,
        };

        let needs_resync = match item {
            Some(Ok(event)) => {
                if event.revision > last_revision {
                    last_revision = event.revision;
                }
                if let Err(e) = handler.on_change(event).await {
                    error!(key = %key, "change handler failed: {}", e);
                }
                continue;
            }
            Some(Err(Error::Compacted { compact_revision })) => {
                warn!(key = %key, last_revision, compact_revision, "watch history compacted");
                true
            }
            Some(Err(e)) => {
                warn!(key = %key, last_revision, "watch stream failed: {}", e);
                false
            }
            None => {
                warn!(key = %key, last_revision, "watch stream closed, re-subscribing");
                false
            }
        };

        subscription.cancel();
        let reconnect = Reconnect {
            service: service.as_ref(),
            handler: handler.as_ref(),
            key: &key,
            retry: &retry,
        };
        match reconnect.run(&mut last_revision, needs_resync, &mut stopped).await {
            Some(next) => subscription = next,
            None => return,
        }
    }
    subscription.cancel();
}

struct Reconnect<'a> {
    service: &'a dyn CoordinationService,
    handler: &'a dyn ChangeHandler,
    key: &'a str,
    retry: &'a RetryPolicy,
}

impl Reconnect<'_> {
    /// Keeps trying until a new subscription is open or the watcher is
    /// stopped. Pauses follow the retry policy, never shorter than
    /// `MIN_RECONNECT_PAUSE`, then stay at `max_backoff_ms`.
    async fn run(
        &self,
        last_revision: &mut i64,
        mut needs_resync: bool,
        stopped: &mut oneshot::Receiver<()>,
    ) -> Option<Subscription> {
        let mut delays = self.retry.delays();
        let ceiling = Duration::from_millis(self.retry.max_backoff_ms).max(MIN_RECONNECT_PAUSE);
        let mut attempt = 0u32;
        loop {
            let pause = delays.next().unwrap_or(ceiling).max(MIN_RECONNECT_PAUSE);
            tokio::select! {
                biased;
                _ = &mut *stopped => return None,
                () = tokio::time::sleep(pause) => {}
            }
            attempt += 1;

            if needs_resync {
                match self.handler.resync().await {
                    Ok(revision) => {
                        info!(key = self.key, revision, "state rebuilt from a fresh read");
                        *last_revision = revision;
                        needs_resync = false;
                    }
                    Err(e) => {
                        warn!(key = self.key, attempt, "re-reading state failed: {}", e);
                        continue;
                    }
                }
            }

            match self.service.watch(self.key, Some(*last_revision + 1)).await {
                Ok(subscription) => {
                    debug!(key = self.key, attempt, from = *last_revision + 1, "re-subscribed");
                    return Some(subscription);
                }
                Err(Error::Compacted { compact_revision }) => {
                    warn!(key = self.key, compact_revision, "resume revision compacted");
                    needs_resync = true;
                }
                Err(e) => warn!(key = self.key, attempt, "watch failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryService;
    use crate::service::{EventAction, LeaseId, WatchEvent};
    use async_trait::async_trait;
    use std::time::Duration;

    const KEY: &str = "MyApp/leader";

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<WatchEvent>>,
        service: Option<InMemoryService>,
        resyncs: Mutex<u32>,
    }

    #[async_trait]
    impl ChangeHandler for Recorder {
        async fn on_change(&self, event: WatchEvent) -> Result<()> {
            self.events.lock().push(event);
            Ok(())
        }

        async fn resync(&self) -> Result<i64> {
            *self.resyncs.lock() += 1;
            Ok(self.service.as_ref().map_or(0, InMemoryService::revision))
        }
    }

    impl Recorder {
        fn actions(&self) -> Vec<EventAction> {
            self.events.lock().iter().map(|e| e.action.clone()).collect()
        }
    }

    async fn claim(service: &InMemoryService, name: &str) -> LeaseId {
        let client = service.connect(name);
        let lease = client.create_lease(Duration::from_secs(10)).await.unwrap();
        client.create_if_absent(KEY, name, lease).await.unwrap();
        lease
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let service = InMemoryService::new();
        let recorder = Arc::new(Recorder::default());
        let watcher = ChangeWatcher::watch(
            Arc::new(service.connect("w")),
            KEY,
            None,
            recorder.clone(),
            RetryPolicy::default(),
        )
        .await
        .unwrap();

        let lease = claim(&service, "A").await;
        service.expire_lease(lease);
        claim(&service, "B").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            recorder.actions(),
            vec![EventAction::Created, EventAction::Deleted, EventAction::Created]
        );
        let revisions: Vec<i64> = recorder.events.lock().iter().map(|e| e.revision).collect();
        assert!(revisions.windows(2).all(|w| w[0] < w[1]));
        watcher.cancel().await;
    }

    #[tokio::test]
    async fn test_no_callbacks_after_cancel() {
        let service = InMemoryService::new();
        let recorder = Arc::new(Recorder::default());
        let watcher = ChangeWatcher::watch(
            Arc::new(service.connect("w")),
            KEY,
            None,
            recorder.clone(),
            RetryPolicy::default(),
        )
        .await
        .unwrap();

        watcher.cancel().await;
        watcher.cancel().await;
        assert!(!watcher.is_running());

        let lease = claim(&service, "A").await;
        service.expire_lease(lease);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(recorder.actions().is_empty());
        assert_eq!(service.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_start_revision_skips_earlier_events() {
        let service = InMemoryService::new();
        let lease = claim(&service, "A").await;
        let start = service.revision() + 1;

        let recorder = Arc::new(Recorder::default());
        let watcher = ChangeWatcher::watch(
            Arc::new(service.connect("w")),
            KEY,
            Some(start),
            recorder.clone(),
            RetryPolicy::default(),
        )
        .await
        .unwrap();

        service.expire_lease(lease);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(recorder.actions(), vec![EventAction::Deleted]);
        watcher.cancel().await;
    }

    #[tokio::test]
    async fn test_resubscribes_after_partition_heals() {
        let service = InMemoryService::new();
        let recorder = Arc::new(Recorder::default());
        let watcher = ChangeWatcher::watch(
            Arc::new(service.connect("w")),
            KEY,
            None,
            recorder.clone(),
            RetryPolicy::default(),
        )
        .await
        .unwrap();

        service.partition("w");
        let lease = claim(&service, "A").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.actions().is_empty());
        assert!(watcher.is_running());

        service.heal("w");
        service.expire_lease(lease);
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(recorder.actions(), vec![EventAction::Created, EventAction::Deleted]);
        assert_eq!(*recorder.resyncs.lock(), 0);
        watcher.cancel().await;
    }

    #[tokio::test]
    async fn test_compacted_history_triggers_resync() {
        let service = InMemoryService::new();
        let recorder = Arc::new(Recorder {
            service: Some(service.clone()),
            ..Recorder::default()
        });
        let watcher = ChangeWatcher::watch(
            Arc::new(service.connect("w")),
            KEY,
            None,
            recorder.clone(),
            RetryPolicy::default(),
        )
        .await
        .unwrap();

        service.partition("w");
        let first = claim(&service, "A").await;
        service.expire_lease(first);
        service.compact();
        service.heal("w");
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(*recorder.resyncs.lock(), 1);
        assert!(recorder.actions().is_empty());

        claim(&service, "B").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.actions(), vec![EventAction::Created]);
        watcher.cancel().await;
    }

    #[tokio::test]
    async fn test_compacted_start_revision_resyncs_before_watching() {
        let service = InMemoryService::new();
        claim(&service, "A").await;
        service.compact();

        let recorder = Arc::new(Recorder {
            service: Some(service.clone()),
            ..Recorder::default()
        });
        let watcher = ChangeWatcher::watch(
            Arc::new(service.connect("w")),
            KEY,
            Some(1),
            recorder.clone(),
            RetryPolicy::default(),
        )
        .await
        .unwrap();

        assert_eq!(*recorder.resyncs.lock(), 1);
        assert!(watcher.is_running());
        watcher.cancel().await;
    }
}
