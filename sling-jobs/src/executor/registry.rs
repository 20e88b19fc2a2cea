//! Topic based executor lookup.
//!
//! Executors are registered for one or more topics. A topic is either exact
//! (`org/apache/sling/jobs/foo`) or a category (`org/apache/sling/jobs/*`) matching every direct
//! child topic. Resolving a job's topic prefers an exact registration over a category one, then
//! the highest ranking, then the oldest registration.
use std::{
    fmt::Display,
    sync::{Arc, RwLock},
};

use fxhash::FxHashMap;

use super::JobExecutor;
use crate::JobsError;

type Result<T> = std::result::Result<T, JobsError>;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct RegistrationId(u64);

impl Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegistrationId({})", self.0)
    }
}

#[derive(Clone)]
struct Registered {
    id: RegistrationId,
    ranking: i32,
    executor: Arc<dyn JobExecutor>,
}

#[derive(Default)]
struct Registrations {
    next_id: u64,
    by_topic: FxHashMap<String, Vec<Registered>>,
}

#[derive(Default)]
pub struct ConsumerRegistry {
    inner: RwLock<Registrations>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `executor` for `topics`, blank topics are ignored.
    pub fn register<T>(
        &self,
        topics: impl IntoIterator<Item = T>,
        ranking: i32,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<RegistrationId>
    where
        T: AsRef<str>,
    {
        let mut inner = self.inner.write().map_err(|_| JobsError::BadState)?;
        let id = RegistrationId(inner.next_id);
        inner.next_id += 1;

        for topic in topics {
            let topic = topic.as_ref().trim();
            if topic.is_empty() {
                continue;
            }
            let entries = inner.by_topic.entry(topic.to_owned()).or_default();
            entries.push(Registered {
                id,
                ranking,
                executor: executor.clone(),
            });
            entries.sort_by(|a, b| b.ranking.cmp(&a.ranking).then(a.id.cmp(&b.id)));
        }
        tracing::debug!(%id, ranking, "Registered executor {id}");
        Ok(id)
    }

    /// Returns whether anything was registered under `id`.
    pub fn unregister(&self, id: RegistrationId) -> Result<bool> {
        let mut inner = self.inner.write().map_err(|_| JobsError::BadState)?;
        let mut removed = false;
        inner.by_topic.retain(|_, entries| {
            let len = entries.len();
            entries.retain(|entry| entry.id != id);
            removed |= len != entries.len();
            !entries.is_empty()
        });
        Ok(removed)
    }

    /// The executor responsible for jobs of `topic`.
    pub fn executor_for(&self, topic: &str) -> Result<Option<Arc<dyn JobExecutor>>> {
        let inner = self.inner.read().map_err(|_| JobsError::BadState)?;
        let first = |key: &str| {
            inner
                .by_topic
                .get(key)
                .and_then(|entries| entries.first())
                .map(|entry| entry.executor.clone())
        };
        if let Some(executor) = first(topic) {
            return Ok(Some(executor));
        }
        Ok(match topic.rfind('/') {
            Some(pos) if pos > 0 => first(&format!("{}*", &topic[..=pos])),
            _ => None,
        })
    }

    /// All registered topics, sorted and comma separated.
    pub fn topics(&self) -> Result<String> {
        let inner = self.inner.read().map_err(|_| JobsError::BadState)?;
        let mut topics: Vec<_> = inner.by_topic.keys().map(String::as_str).collect();
        topics.sort_unstable();
        Ok(topics.join(","))
    }
}

#[cfg(test)]
impl ConsumerRegistry {
    /// Leaves the registrations lock poisoned.
    pub(crate) fn poison(&self) {
        let _ = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = self.inner.write();
                    panic!("registry poisoned");
                })
                .join()
        });
    }
}
