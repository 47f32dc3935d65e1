//! Single source of truth for the application endpoint shown to the UI.
//!
//! Every mutation goes through [`EndpointPublisher::commit`]. Commits are
//! serialized by a dedicated lock held through notification, so subscribers
//! observe commits in order and never run concurrently with each other. The
//! state lock is released before subscribers run, so they may read
//! [`EndpointPublisher::current`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::launcher_log;
use crate::pattern::PatternMatcher;
use crate::runtime_state::{atomic_write, read_text, remove_if_exists};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointSource {
    Tunnel,
    Local,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PublishedEndpoint {
    pub url: String,
    pub is_public: bool,
    pub source: EndpointSource,
}

impl PublishedEndpoint {
    pub fn tunnel(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            is_public: true,
            source: EndpointSource::Tunnel,
        }
    }

    pub fn local(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            is_public: false,
            source: EndpointSource::Local,
        }
    }
}

/// Token returned by [`EndpointPublisher::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(PublishedEndpoint) + Send + Sync>;

struct PublisherState {
    current: PublishedEndpoint,
    committed: bool,
    next_id: u64,
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
}

pub struct EndpointPublisher {
    recovery_path: PathBuf,
    matcher: PatternMatcher,
    commit_lock: Mutex<()>,
    state: Mutex<PublisherState>,
}

impl EndpointPublisher {
    /// `local_default` is what [`current`](Self::current) reports before the
    /// first commit.
    pub fn new(
        recovery_path: impl Into<PathBuf>,
        matcher: PatternMatcher,
        local_default: PublishedEndpoint,
    ) -> Self {
        Self {
            recovery_path: recovery_path.into(),
            matcher,
            commit_lock: Mutex::new(()),
            state: Mutex::new(PublisherState {
                current: local_default,
                committed: false,
                next_id: 0,
                subscribers: BTreeMap::new(),
            }),
        }
    }

    pub fn recovery_path(&self) -> &Path {
        &self.recovery_path
    }

    pub fn current(&self) -> PublishedEndpoint {
        self.lock().current.clone()
    }

    pub fn has_committed(&self) -> bool {
        self.lock().committed
    }

    /// Replaces the published value, mirrors it to disk and notifies every
    /// subscriber. A subscriber may read the publisher but must not commit.
    pub fn commit(&self, endpoint: PublishedEndpoint) {
        let _serial = self
            .commit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let subscribers: Vec<Subscriber> = {
            let mut state = self.lock();
            state.current = endpoint.clone();
            state.committed = true;
            state.subscribers.values().cloned().collect()
        };
        self.write_recovery(&endpoint);
        launcher_log::info(
            module_path!(),
            format!(
                "published endpoint {} (source={:?})",
                endpoint.url, endpoint.source
            ),
        );
        for subscriber in subscribers {
            subscriber(endpoint.clone());
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(PublishedEndpoint) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.subscribers.insert(id, Arc::new(callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }

    /// Reads the recovery record; `None` when absent, unreadable or not a
    /// recognizable public URL.
    pub fn read_recovery(&self) -> Option<String> {
        match read_text(&self.recovery_path) {
            Ok(Some(contents)) => self.matcher.parse_recovery(&contents),
            Ok(None) => None,
            Err(err) => {
                launcher_log::warn(
                    module_path!(),
                    format!(
                        "could not read recovery record {}: {err}",
                        self.recovery_path.display()
                    ),
                );
                None
            }
        }
    }

    /// Deletes the recovery record. Failures are logged, never raised.
    pub fn clear_recovery(&self) -> bool {
        match remove_if_exists(&self.recovery_path) {
            Ok(removed) => {
                if removed {
                    launcher_log::info(
                        module_path!(),
                        format!("removed recovery record {}", self.recovery_path.display()),
                    );
                }
                true
            }
            Err(err) => {
                launcher_log::warn(
                    module_path!(),
                    format!(
                        "could not remove recovery record {}: {err}",
                        self.recovery_path.display()
                    ),
                );
                false
            }
        }
    }

    // The record only ever holds a public URL; a local commit clears it.
    fn write_recovery(&self, endpoint: &PublishedEndpoint) {
        if endpoint.source == EndpointSource::Local {
            self.clear_recovery();
            return;
        }
        if let Err(err) = atomic_write(&self.recovery_path, endpoint.url.as_bytes()) {
            launcher_log::warn(
                module_path!(),
                format!(
                    "could not write recovery record {}: {err}",
                    self.recovery_path.display()
                ),
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, PublisherState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
