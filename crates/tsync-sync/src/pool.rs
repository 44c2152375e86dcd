use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use tsync_adapters::SourceFetcher;
use tsync_core::{FetchWindow, Record};

/// One work item: an entity and the window to ask the source for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub entity: String,
    pub window: FetchWindow,
}

/// Result of one entity fetch. Failures are values, not errors: the
/// coordinator omits the entity and its watermark stays put for the next run.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Rows(Vec<Record>),
    Empty,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub entity: String,
    pub window: FetchWindow,
    pub outcome: FetchOutcome,
}

/// Fixed-size pool of workers draining a shared queue of fetch tasks.
pub struct FetchPool {
    fetcher: Arc<dyn SourceFetcher>,
    workers: usize,
    politeness_delay: Duration,
    fetch_timeout: Duration,
}

impl FetchPool {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        workers: usize,
        politeness_delay: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            workers: workers.max(1),
            politeness_delay,
            fetch_timeout,
        }
    }

    /// Run every task and return one result per completed task, in no particular order.
    pub async fn run(&self, tasks: Vec<FetchTask>) -> Vec<FetchResult> {
        if tasks.is_empty() {
            return Vec::new();
        }
        let worker_count = self.workers.min(tasks.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let politeness_delay = self.politeness_delay;
            let fetch_timeout = self.fetch_timeout;
            workers.spawn(async move {
                loop {
                    let Some(task) = queue.lock().await.pop_front() else {
                        break;
                    };
                    let outcome = fetch_one(fetcher.as_ref(), &task, fetch_timeout).await;
                    if let FetchOutcome::Failed(reason) = &outcome {
                        warn!(worker_id, entity = %task.entity, window = %task.window, %reason, "fetch failed; entity skipped this run");
                    } else {
                        debug!(worker_id, entity = %task.entity, window = %task.window, "fetch finished");
                    }
                    if tx
                        .send(FetchResult {
                            entity: task.entity,
                            window: task.window,
                            outcome,
                        })
                        .is_err()
                    {
                        break;
                    }
                    if !politeness_delay.is_zero() {
                        tokio::time::sleep(politeness_delay).await;
                    }
                }
            });
        }
        drop(tx);

        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "fetch worker terminated abnormally");
            }
        }
        results
    }
}

async fn fetch_one(fetcher: &dyn SourceFetcher, task: &FetchTask, timeout: Duration) -> FetchOutcome {
    match tokio::time::timeout(timeout, fetcher.fetch(&task.entity, &task.window)).await {
        Err(_) => FetchOutcome::Failed(format!("timed out after {}s", timeout.as_secs_f64())),
        Ok(Err(err)) => FetchOutcome::Failed(err.to_string()),
        Ok(Ok(records)) if records.is_empty() => FetchOutcome::Empty,
        Ok(Ok(mut records)) => {
            for record in &mut records {
                if record.entity != task.entity {
                    record.entity = task.entity.clone();
                }
            }
            FetchOutcome::Rows(records)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use tsync_adapters::AdapterError;
    use tsync_core::FieldValue;

    struct Scripted {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SourceFetcher for Scripted {
        async fn fetch(&self, entity: &str, _window: &FetchWindow) -> Result<Vec<Record>, AdapterError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match entity {
                "FAIL" => Err(AdapterError::Message("source said no".to_string())),
                "SLOW" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Vec::new())
                }
                "NONE" => Ok(Vec::new()),
                _ => Ok(vec![Record::new("someone-else").with_field("close", FieldValue::Int(1))]),
            }
        }
    }

    fn task(entity: &str) -> FetchTask {
        let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        FetchTask {
            entity: entity.to_string(),
            window: FetchWindow { from: day, to: day },
        }
    }

    #[tokio::test]
    async fn every_task_gets_a_tagged_outcome() {
        let fetcher = Arc::new(Scripted {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = FetchPool::new(fetcher, 3, Duration::ZERO, Duration::from_millis(200));
        let results = pool
            .run(vec![task("AAA"), task("FAIL"), task("SLOW"), task("NONE")])
            .await;

        let by_entity: BTreeMap<_, _> = results.into_iter().map(|r| (r.entity.clone(), r)).collect();
        assert_eq!(by_entity.len(), 4);
        match &by_entity["AAA"].outcome {
            FetchOutcome::Rows(records) => assert_eq!(records[0].entity, "AAA"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(by_entity["FAIL"].outcome, FetchOutcome::Failed(_)));
        assert!(matches!(&by_entity["SLOW"].outcome, FetchOutcome::Failed(reason) if reason.contains("timed out")));
        assert_eq!(by_entity["NONE"].outcome, FetchOutcome::Empty);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_worker_count() {
        let fetcher = Arc::new(Scripted {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = FetchPool::new(fetcher.clone(), 2, Duration::ZERO, Duration::from_secs(1));
        let tasks = (0..10).map(|i| task(&format!("E{i}"))).collect();
        let results = pool.run(tasks).await;
        assert_eq!(results.len(), 10);
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
    }
}
