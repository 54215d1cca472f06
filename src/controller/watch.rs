//! Watch adapter
//!
//! Bridges typed watcher streams onto the change notification queue. The
//! adapter is the only place that sees raw watch events; the reconcilers only
//! ever receive keys and re-read the latest object themselves.
//!
//! Spec-change predicate: an applied object is enqueued only when its
//! `metadata.generation` differs from the last one observed for that key.
//! Status-only updates do not bump the generation, which both implements the
//! "only spec changes re-trigger" rule and breaks the status-write feedback
//! loop. Objects carrying a deletion timestamp are always enqueued so the
//! teardown path runs.

use dashmap::DashMap;
use futures::TryStreamExt;
use kube::runtime::watcher;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::WorkQueue;
use super::ObjectKey;

/// Decide whether an applied object warrants a new reconciliation pass
fn should_enqueue(last_generation: Option<i64>, generation: i64, deleting: bool) -> bool {
    deleting || last_generation != Some(generation)
}

fn on_applied<K>(
    obj: &K,
    queue: &Arc<WorkQueue<ObjectKey>>,
    observed: &DashMap<ObjectKey, i64>,
) where
    K: Resource,
{
    let key = ObjectKey::from_resource(obj);
    let generation = obj.meta().generation.unwrap_or(0);
    let deleting = obj.meta().deletion_timestamp.is_some();

    let last = observed.get(&key).map(|entry| *entry.value());
    if !should_enqueue(last, generation, deleting) {
        debug!(key = %key, generation, "generation unchanged, skipping");
        return;
    }

    observed.insert(key.clone(), generation);
    debug!(key = %key, generation, deleting, "enqueueing");
    queue.enqueue(key);
}

/// Run one typed watcher until cancelled, feeding the queue.
///
/// Relists (`Restarted`) enqueue every current object: level-triggered
/// reconciliation is cheap for unchanged specs because the status writer
/// detects equality and skips the write.
pub async fn watch_resource<K>(
    api: Api<K>,
    queue: Arc<WorkQueue<ObjectKey>>,
    observed: Arc<DashMap<ObjectKey, i64>>,
    token: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let kind = std::any::type_name::<K>().rsplit("::").next().unwrap_or("resource");
    info!(kind, "starting watch");

    let mut stream = Box::pin(watcher(api, watcher::Config::default()));
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!(kind, "watch cancelled");
                return;
            }
            event = stream.try_next() => match event {
                Ok(Some(watcher::Event::Applied(obj))) => {
                    on_applied(&obj, &queue, &observed);
                }
                Ok(Some(watcher::Event::Deleted(obj))) => {
                    let key = ObjectKey::from_resource(&obj);
                    observed.remove(&key);
                    debug!(key = %key, "object deleted, enqueueing");
                    queue.enqueue(key);
                }
                Ok(Some(watcher::Event::Restarted(objs))) => {
                    debug!(kind, count = objs.len(), "watch relisted");
                    for obj in &objs {
                        on_applied(obj, &queue, &observed);
                    }
                }
                Ok(None) => {
                    warn!(kind, "watch stream ended");
                    return;
                }
                Err(err) => {
                    // the watcher re-establishes itself; just avoid a hot loop
                    warn!(kind, error = %err, "watch error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_enqueues() {
        assert!(should_enqueue(None, 1, false));
    }

    #[test]
    fn test_unchanged_generation_skips() {
        assert!(!should_enqueue(Some(3), 3, false));
    }

    #[test]
    fn test_spec_change_enqueues() {
        assert!(should_enqueue(Some(3), 4, false));
    }

    #[test]
    fn test_deletion_marker_always_enqueues() {
        // deletion does not bump the generation; the teardown path must
        // still run
        assert!(should_enqueue(Some(3), 3, true));
    }
}
