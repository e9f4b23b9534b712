//! Build status state machine.
//!
//! `NOBUILD -> QUEUED -> BUILDING -> BUILT | ERROR`. Every transition is one
//! guarded statement or transaction in the store, so concurrent callers (web
//! handlers, builders in other processes) agree on a single winner.

use std::sync::Arc;

use crate::errors::{ReproError, Result};
use crate::model::{BuildParameters, BuildStatus, ContentHash, Experiment, LogChunk};
use crate::queue::BuildPublisher;
use crate::storage::{CasOutcome, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// This call moved the experiment to QUEUED and published it.
    Enqueued,
    /// Someone already asked; nothing was published.
    AlreadyRequested(BuildStatus),
}

/// What a status page shows: state, new log bytes, build parameters.
#[derive(Debug, Clone)]
pub struct Poll {
    pub experiment: Experiment,
    pub log: LogChunk,
    pub triggered: bool,
}

#[derive(Clone)]
pub struct BuildService {
    store: Store,
    publisher: Arc<dyn BuildPublisher>,
}

impl BuildService {
    pub fn new(store: Store, publisher: Arc<dyn BuildPublisher>) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// NOBUILD -> QUEUED plus one publish, at most once per experiment.
    ///
    /// If the queue refuses the message the status goes back to NOBUILD, so a
    /// later request can try again.
    pub async fn request_build(&self, hash: &ContentHash) -> Result<Trigger> {
        let outcome = {
            let hash = hash.clone();
            self.store
                .blocking(move |s| {
                    s.compare_and_set_status(&hash, BuildStatus::NoBuild, BuildStatus::Queued)
                })
                .await?
        };
        match outcome {
            CasOutcome::Applied(()) => {}
            CasOutcome::Rejected(current) => {
                tracing::debug!(event = "build.already_requested", hash = %hash, status = %current);
                return Ok(Trigger::AlreadyRequested(current));
            }
            CasOutcome::Missing => return Err(ReproError::not_found(format!("experiment {hash}"))),
        }

        match self.publisher.publish(hash).await {
            Ok(()) => {
                tracing::info!(event = "build.queued", hash = %hash);
                Ok(Trigger::Enqueued)
            }
            Err(e) => {
                let reverted = {
                    let hash = hash.clone();
                    self.store
                        .blocking(move |s| {
                            s.compare_and_set_status(&hash, BuildStatus::Queued, BuildStatus::NoBuild)
                        })
                        .await
                };
                tracing::warn!(
                    event = "build.queue_refused",
                    hash = %hash,
                    error = %e,
                    reverted = matches!(reverted, Ok(CasOutcome::Applied(()))),
                );
                Err(e.into())
            }
        }
    }

    /// Current state; refreshes last access.
    pub fn status(&self, hash: &ContentHash) -> Result<Experiment> {
        self.store
            .touch_experiment(hash)?
            .ok_or_else(|| ReproError::not_found(format!("experiment {hash}")))
    }

    /// Log bytes appended since `from`.
    pub fn get_log(&self, hash: &ContentHash, from: u64) -> Result<LogChunk> {
        self.store
            .read_log(hash, from)?
            .ok_or_else(|| ReproError::not_found(format!("experiment {hash}")))
    }

    /// Status and log in one call. The first view of a NOBUILD experiment
    /// requests its build.
    pub async fn poll(&self, hash: &ContentHash, from: u64) -> Result<Poll> {
        let mut experiment = self.status_blocking(hash).await?;
        let mut triggered = false;
        if experiment.status == BuildStatus::NoBuild {
            triggered = self.request_build(hash).await? == Trigger::Enqueued;
            experiment = self.status_blocking(hash).await?;
        }
        let log = {
            let svc = self.clone();
            let hash = hash.clone();
            self.store
                .blocking(move |_| svc.get_log(&hash, from))
                .await?
        };
        Ok(Poll {
            experiment,
            log,
            triggered,
        })
    }

    async fn status_blocking(&self, hash: &ContentHash) -> Result<Experiment> {
        let svc = self.clone();
        let hash = hash.clone();
        self.store.blocking(move |_| svc.status(&hash)).await
    }

    /// Publishes every experiment still QUEUED whose request is not already
    /// waiting in the broker, e.g. after a crash between the status change
    /// and the broker accepting the message.
    pub async fn requeue_pending(&self) -> Result<usize> {
        let queued = self
            .store
            .blocking(|s| s.hashes_with_status(BuildStatus::Queued))
            .await?;
        if queued.is_empty() {
            return Ok(0);
        }
        let in_broker = self.publisher.queued().await?;
        let mut published = 0;
        for hash in queued.iter().filter(|h| !in_broker.contains(*h)) {
            self.publisher.publish(hash).await?;
            published += 1;
        }
        tracing::info!(
            event = "build.requeued",
            count = published,
            already_queued = queued.len() - published,
        );
        Ok(published)
    }

    // Builder write path.

    /// QUEUED -> BUILDING for a first delivery. Clears the log and
    /// parameters of any earlier attempt. Returns the previous status.
    ///
    /// An experiment already BUILDING is rejected: a fresh message for it is a
    /// duplicate, and taking it would restart a build that is still running.
    pub fn start_build(&self, hash: &ContentHash) -> Result<BuildStatus> {
        self.begin(hash, false)
    }

    /// Like [`start_build`](Self::start_build), but also takes over a
    /// BUILDING experiment. For redelivered messages, whose earlier builder
    /// let its lease lapse or released it.
    pub fn restart_build(&self, hash: &ContentHash) -> Result<BuildStatus> {
        self.begin(hash, true)
    }

    fn begin(&self, hash: &ContentHash, restart: bool) -> Result<BuildStatus> {
        match self.store.begin_building(hash, restart)? {
            CasOutcome::Applied(previous) => {
                if previous != BuildStatus::Queued {
                    tracing::warn!(event = "build.restarted", hash = %hash, previous = %previous);
                } else {
                    tracing::info!(event = "build.started", hash = %hash);
                }
                Ok(previous)
            }
            CasOutcome::Rejected(from) => Err(self.invalid(hash, from, BuildStatus::Building)),
            CasOutcome::Missing => Err(ReproError::not_found(format!("experiment {hash}"))),
        }
    }

    /// Appends build output. Only while BUILDING. Returns the log length.
    pub fn append_log(&self, hash: &ContentHash, data: &[u8]) -> Result<u64> {
        match self.store.append_log(hash, data)? {
            CasOutcome::Applied(len) => Ok(len),
            CasOutcome::Rejected(from) => Err(self.invalid(hash, from, BuildStatus::Building)),
            CasOutcome::Missing => Err(ReproError::not_found(format!("experiment {hash}"))),
        }
    }

    pub fn finish_built(&self, hash: &ContentHash, parameters: &BuildParameters) -> Result<()> {
        match self.store.mark_built(hash, parameters)? {
            CasOutcome::Applied(()) => {
                tracing::info!(event = "build.built", hash = %hash, parameters = parameters.len());
                Ok(())
            }
            CasOutcome::Rejected(from) => Err(self.invalid(hash, from, BuildStatus::Built)),
            CasOutcome::Missing => Err(ReproError::not_found(format!("experiment {hash}"))),
        }
    }

    /// QUEUED or BUILDING -> ERROR; the diagnostic becomes the last log line.
    pub fn finish_error(&self, hash: &ContentHash, diagnostic: &str) -> Result<()> {
        let mut line = diagnostic.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        match self.store.mark_error(hash, line.as_bytes())? {
            CasOutcome::Applied(_) => {
                tracing::info!(event = "build.error", hash = %hash, diagnostic = %diagnostic.trim_end());
                Ok(())
            }
            CasOutcome::Rejected(from) => Err(self.invalid(hash, from, BuildStatus::Error)),
            CasOutcome::Missing => Err(ReproError::not_found(format!("experiment {hash}"))),
        }
    }

    fn invalid(&self, hash: &ContentHash, from: BuildStatus, to: BuildStatus) -> ReproError {
        tracing::warn!(event = "build.invalid_transition", hash = %hash, from = %from, to = %to);
        ReproError::InvalidTransition {
            hash: hash.to_string(),
            from,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        published: Mutex<Vec<ContentHash>>,
        in_broker: HashSet<ContentHash>,
        refuse: bool,
    }

    #[async_trait]
    impl BuildPublisher for Recording {
        async fn publish(&self, hash: &ContentHash) -> std::result::Result<(), QueueError> {
            if self.refuse {
                return Err(QueueError::Unavailable("pending buffer is full".into()));
            }
            self.published.lock().unwrap().push(hash.clone());
            Ok(())
        }

        async fn queued(&self) -> std::result::Result<HashSet<ContentHash>, QueueError> {
            Ok(self.in_broker.clone())
        }
    }

    fn setup(refuse: bool) -> (BuildService, Arc<Recording>, ContentHash) {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        let hash = ContentHash::parse(&"5".repeat(64)).unwrap();
        store.ensure_experiment(&hash).unwrap();
        let rec = Arc::new(Recording {
            refuse,
            ..Default::default()
        });
        (BuildService::new(store, rec.clone()), rec, hash)
    }

    #[tokio::test]
    async fn test_request_build_publishes_once() {
        let (svc, rec, hash) = setup(false);
        assert_eq!(svc.request_build(&hash).await.unwrap(), Trigger::Enqueued);
        assert_eq!(
            svc.request_build(&hash).await.unwrap(),
            Trigger::AlreadyRequested(BuildStatus::Queued)
        );
        assert_eq!(rec.published.lock().unwrap().len(), 1);
        assert_eq!(svc.status(&hash).unwrap().status, BuildStatus::Queued);
    }

    #[tokio::test]
    async fn test_refused_publish_reverts_status() {
        let (svc, _rec, hash) = setup(true);
        let err = svc.request_build(&hash).await.unwrap_err();
        assert_eq!(err.http_status(), 503);
        assert_eq!(svc.status(&hash).unwrap().status, BuildStatus::NoBuild);
    }

    #[tokio::test]
    async fn test_unknown_experiment_is_not_found() {
        let (svc, rec, _) = setup(false);
        let other = ContentHash::parse(&"6".repeat(64)).unwrap();
        assert_eq!(svc.request_build(&other).await.unwrap_err().http_status(), 404);
        assert_eq!(svc.status(&other).unwrap_err().http_status(), 404);
        assert!(rec.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poll_triggers_on_first_view() {
        let (svc, rec, hash) = setup(false);
        let first = svc.poll(&hash, 0).await.unwrap();
        assert!(first.triggered);
        assert_eq!(first.experiment.status, BuildStatus::Queued);
        let second = svc.poll(&hash, 0).await.unwrap();
        assert!(!second.triggered);
        assert_eq!(rec.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_builder_path() {
        let (svc, _rec, hash) = setup(false);
        assert!(matches!(
            svc.start_build(&hash),
            Err(ReproError::InvalidTransition {
                from: BuildStatus::NoBuild,
                ..
            })
        ));
        svc.request_build(&hash).await.unwrap();
        assert_eq!(svc.start_build(&hash).unwrap(), BuildStatus::Queued);
        assert_eq!(svc.append_log(&hash, b"Step 1/3\n").unwrap(), 9);
        assert!(matches!(
            svc.start_build(&hash),
            Err(ReproError::InvalidTransition {
                from: BuildStatus::Building,
                ..
            })
        ));
        assert_eq!(svc.get_log(&hash, 0).unwrap().next_offset, 9);
        svc.finish_error(&hash, "docker build failed").unwrap();

        let log = svc.get_log(&hash, 0).unwrap();
        assert_eq!(log.data, b"Step 1/3\ndocker build failed\n");
        assert_eq!(svc.status(&hash).unwrap().status, BuildStatus::Error);
        assert!(svc.finish_built(&hash, &BuildParameters::new()).is_err());
        assert!(svc.finish_error(&hash, "again").is_err());
    }

    #[tokio::test]
    async fn test_requeue_pending() {
        let (svc, rec, hash) = setup(false);
        svc.store()
            .compare_and_set_status(&hash, BuildStatus::NoBuild, BuildStatus::Queued)
            .unwrap();
        assert_eq!(svc.requeue_pending().await.unwrap(), 1);
        assert_eq!(rec.published.lock().unwrap().as_slice(), &[hash]);
    }

    #[tokio::test]
    async fn test_requeue_skips_hashes_already_in_broker() {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        let waiting = ContentHash::parse(&"7".repeat(64)).unwrap();
        let lost = ContentHash::parse(&"8".repeat(64)).unwrap();
        for h in [&waiting, &lost] {
            store.ensure_experiment(h).unwrap();
            store
                .compare_and_set_status(h, BuildStatus::NoBuild, BuildStatus::Queued)
                .unwrap();
        }
        let rec = Arc::new(Recording {
            in_broker: HashSet::from([waiting.clone()]),
            ..Default::default()
        });
        let svc = BuildService::new(store, rec.clone());

        assert_eq!(svc.requeue_pending().await.unwrap(), 1);
        assert_eq!(rec.published.lock().unwrap().as_slice(), &[lost]);
    }
}
