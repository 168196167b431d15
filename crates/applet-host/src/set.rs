//! Applet set - supervises a group of applets keyed by id.
//!
//! Lock-free concurrent access via DashMap. The set does not restart
//! anything: a crashed applet stays crashed until the caller removes it and
//! registers a fresh one.

use std::sync::Arc;

use dashmap::DashMap;

use crate::applet::{Applet, AppletError};
use crate::bridge::protocol::AppletId;
use crate::config::{AppletConfig, Invocation};
use crate::dispatcher::Dispatcher;
use crate::process::SetupError;
use crate::state::AppletState;

#[derive(Default)]
pub struct AppletSet {
    applets: DashMap<AppletId, Arc<Applet>>,
    config: AppletConfig,
}

impl AppletSet {
    pub fn new(config: AppletConfig) -> Self {
        Self {
            applets: DashMap::new(),
            config,
        }
    }

    /// Register an applet with the set's config and the given dispatcher.
    pub fn register(
        &self,
        invocation: Invocation,
        dispatcher: impl Dispatcher,
    ) -> Result<Arc<Applet>, SetupError> {
        let applet = Applet::register_with(invocation, self.config.clone())?;
        // Freshly registered, so the dispatcher is still replaceable.
        if let Err(e) = applet.set_dispatcher(dispatcher) {
            tracing::error!(applet_id = %applet.id(), error = %e, "Failed to set dispatcher");
        }
        let applet = Arc::new(applet);
        self.applets.insert(applet.id(), Arc::clone(&applet));
        Ok(applet)
    }

    pub fn get(&self, id: &AppletId) -> Option<Arc<Applet>> {
        self.applets.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &AppletId) -> bool {
        self.applets.contains_key(id)
    }

    pub fn remove(&self, id: &AppletId) -> Option<Arc<Applet>> {
        self.applets.remove(id).map(|(_, applet)| applet)
    }

    pub fn len(&self) -> usize {
        self.applets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applets.is_empty()
    }

    pub fn ids(&self) -> Vec<AppletId> {
        self.applets.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot of every applet's state.
    pub fn states(&self) -> Vec<(AppletId, AppletState)> {
        self.applets
            .iter()
            .map(|entry| (*entry.key(), entry.value().state()))
            .collect()
    }

    /// Start every registered applet. Returns the failures; the rest are started.
    pub fn start_all(&self) -> Vec<AppletError> {
        self.snapshot()
            .into_iter()
            .filter(|applet| applet.state() == AppletState::Registered)
            .filter_map(|applet| applet.start().err())
            .collect()
    }

    /// Request a stop on every applet. Never waits.
    pub fn stop_all(&self) {
        for applet in self.snapshot() {
            applet.stop();
        }
    }

    /// Wait until every applet is terminal.
    pub async fn wait_all(&self) -> Vec<(AppletId, AppletState)> {
        let applets = self.snapshot();
        let waits = applets.iter().map(|applet| async move {
            let state = applet.wait().await;
            (applet.id(), state)
        });
        futures::future::join_all(waits).await
    }

    /// Stop every applet and wait for all of them.
    pub async fn shutdown(&self) -> Vec<(AppletId, AppletState)> {
        self.stop_all();
        self.wait_all().await
    }

    // Clone out of the map so no shard lock is held across awaits.
    fn snapshot(&self) -> Vec<Arc<Applet>> {
        self.applets
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatcher::CoreDispatcher;

    fn sh(script: &str) -> Invocation {
        Invocation::new("/bin/sh").args(["-c", script])
    }

    #[tokio::test]
    async fn register_get_remove() {
        let set = AppletSet::default();
        assert!(set.is_empty());

        let applet = set.register(sh("exec cat"), CoreDispatcher).unwrap();
        let id = applet.id();

        assert!(set.contains(&id));
        assert_eq!(set.len(), 1);
        assert_eq!(set.ids(), vec![id]);
        assert_eq!(set.get(&id).unwrap().state(), AppletState::Registered);

        let removed = set.remove(&id).unwrap();
        assert_eq!(removed.id(), id);
        assert!(!set.contains(&id));
        assert!(set.get(&id).is_none());
    }

    #[tokio::test]
    async fn start_all_then_shutdown() {
        let set = AppletSet::new(AppletConfig::new().with_stop_timeout(Duration::from_secs(5)));
        set.register(sh("exec cat"), CoreDispatcher).unwrap();
        set.register(sh("exec cat"), CoreDispatcher).unwrap();

        assert!(set.start_all().is_empty());
        assert!(
            set.states()
                .iter()
                .all(|(_, state)| *state == AppletState::Started)
        );

        // Already started applets are skipped, not reported as failures.
        assert!(set.start_all().is_empty());

        let finished = tokio::time::timeout(Duration::from_secs(10), set.shutdown())
            .await
            .unwrap();
        assert_eq!(finished.len(), 2);
        assert!(
            finished
                .iter()
                .all(|(_, state)| *state == AppletState::Stopped)
        );
    }

    #[tokio::test]
    async fn wait_all_reports_crashes() {
        let set = AppletSet::default();
        let crashing = set.register(sh("exit 1"), CoreDispatcher).unwrap();
        set.start_all();

        let finished = tokio::time::timeout(Duration::from_secs(10), set.wait_all())
            .await
            .unwrap();
        assert_eq!(finished, vec![(crashing.id(), AppletState::Crashed)]);
    }
}
