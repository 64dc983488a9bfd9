use worldspace_common::Arena;
use worldspace_kernel::{Level, LevelHandle, WorldServices};

/// Deferred-free queue for unloaded levels.
///
/// Levels stay allocated until the next collection safe point. Before they are
/// freed, every other subsystem is told to let go of them.
#[derive(Debug, Default)]
pub struct GcCoordinator {
    pending: Vec<(LevelHandle, String)>,
}

impl GcCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a level for teardown. Queuing the same level twice is a no-op.
    pub fn enqueue_for_teardown(&mut self, level: LevelHandle, package: &str) {
        if self.is_pending(level) {
            return;
        }
        tracing::debug!(package = %package, "level queued for teardown");
        self.pending.push((level, package.to_string()));
    }

    /// Take a level back off the queue. Returns whether it was queued.
    pub fn cancel_teardown(&mut self, level: LevelHandle) -> bool {
        let before = self.pending.len();
        self.pending.retain(|(h, _)| *h != level);
        before != self.pending.len()
    }

    pub fn is_pending(&self, level: LevelHandle) -> bool {
        self.pending.iter().any(|(h, _)| *h == level)
    }

    pub fn num_pending_purge(&self) -> usize {
        self.pending.len()
    }

    /// Pre-collection hook: detach every queued level and free it.
    ///
    /// Returns the freed levels in queue order.
    pub fn prepare_collection(
        &mut self,
        levels: &mut Arena<Level>,
        services: &mut WorldServices,
    ) -> Vec<(LevelHandle, String)> {
        let _span = tracing::info_span!("gc_prepare", pending = self.pending.len()).entered();
        let mut collected = Vec::with_capacity(self.pending.len());
        for (handle, package) in std::mem::take(&mut self.pending) {
            if let Some(network) = services.network.as_mut() {
                network.notify_streaming_level_unload(&package);
            }
            services.render.release_level(handle, &package);
            if levels.remove(handle).is_none() {
                tracing::warn!(package = %package, "queued level was already gone");
                continue;
            }
            collected.push((handle, package));
        }
        collected
    }

    /// Post-collection check: nothing may still reach a freed level.
    ///
    /// `reachable` answers whether anything still references a handle. Leaks
    /// are logged and counted; they never stop the world.
    pub fn verify_collection(
        &self,
        collected: &[(LevelHandle, String)],
        reachable: impl Fn(LevelHandle) -> bool,
    ) -> usize {
        let mut leaks = 0;
        for (handle, package) in collected {
            if reachable(*handle) {
                tracing::error!(package = %package, "level still referenced after collection");
                leaks += 1;
            }
        }
        leaks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldspace_kernel::PackageContents;
    use worldspace_kernel::recording::{SceneCall, recording_services};

    fn level(name: &str) -> Level {
        Level::from_package(name, PackageContents::default())
    }

    #[test]
    fn enqueue_is_idempotent() {
        let mut levels = Arena::new();
        let a = levels.insert(level("/Game/A"));
        let mut gc = GcCoordinator::new();
        gc.enqueue_for_teardown(a, "/Game/A");
        gc.enqueue_for_teardown(a, "/Game/A");
        assert_eq!(gc.num_pending_purge(), 1);

        let (mut services, log) = recording_services(true);
        let collected = gc.prepare_collection(&mut levels, &mut services);
        assert_eq!(collected.len(), 1);
        assert!(levels.is_empty());
        assert_eq!(
            log.count(|c| matches!(c, SceneCall::StreamingLevelUnload(_))),
            1
        );
    }

    #[test]
    fn cancel_keeps_level_alive() {
        let mut levels = Arena::new();
        let a = levels.insert(level("/Game/A"));
        let b = levels.insert(level("/Game/B"));
        let mut gc = GcCoordinator::new();
        gc.enqueue_for_teardown(a, "/Game/A");
        gc.enqueue_for_teardown(b, "/Game/B");
        assert!(gc.cancel_teardown(a));
        assert!(!gc.cancel_teardown(a));

        let mut services = WorldServices::headless();
        let collected = gc.prepare_collection(&mut levels, &mut services);
        assert_eq!(collected, vec![(b, "/Game/B".to_string())]);
        assert!(levels.contains(a));
        assert!(!levels.contains(b));
    }

    #[test]
    fn verify_reports_leaks() {
        let mut levels = Arena::new();
        let a = levels.insert(level("/Game/A"));
        let mut gc = GcCoordinator::new();
        gc.enqueue_for_teardown(a, "/Game/A");
        let collected = gc.prepare_collection(&mut levels, &mut WorldServices::headless());
        assert_eq!(gc.verify_collection(&collected, |h| levels.contains(h)), 0);
        assert_eq!(gc.verify_collection(&collected, |h| h == a), 1);
    }
}
