//! Pre-warmed, per-language sandbox pools.
//!
//! The [`PoolManager`] is the process-wide owner of every sandbox. It
//! keeps one pool per configured language; each pool maintains a minimum
//! idle set, enforces a hard total cap, and hands out exclusive handles
//! through an acquire/release discipline:
//!
//! ```text
//!   acquire(lang) ──► idle set (FIFO) ──► active set
//!                       │  empty, total < max          │
//!                       └──► provision new ────────────┤
//!                       │  empty, total = max          │
//!                       └──► block until release/timeout
//!
//!   release(handle) ──► reset ok ──► back of idle set
//!                       reset err ─► destroy, slot freed
//! ```
//!
//! A background sweeper runs every 10 seconds and, per pool:
//!
//! - forcibly destroys active sandboxes whose running TTL expired (the
//!   owning execution observes the broken handle on its next command),
//! - expires idle sandboxes beyond `min_idle` whose idle TTL elapsed,
//! - provisions new idle sandboxes until `min_idle` is restored.
//!
//! Sweeper errors are logged, never surfaced. Release is infallible: a
//! sandbox that cannot be reset is destroyed instead of returned.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Language, PoolSettings};
use crate::sandbox::{SandboxHandle, SandboxProvisioner, SandboxResult, SandboxState};

/// Sweep cadence for TTL enforcement and replenishment.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Errors surfaced by [`PoolManager::acquire`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool is saturated and no sandbox became available within the
    /// configured wait, or provisioning failed.
    #[error("no {language} sandbox available: {reason}")]
    NoSandboxAvailable { language: Language, reason: String },

    /// No pool is configured for the requested language.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(Language),
}

/// Point-in-time occupancy of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub idle: usize,
    pub active: usize,
    pub total: usize,
}

struct PoolState {
    /// Idle handles ordered by release time; the front is reused first.
    idle: VecDeque<SandboxHandle>,
    active: HashMap<String, SandboxHandle>,
    total: usize,
}

struct LanguagePool {
    language: Language,
    settings: PoolSettings,
    provisioner: Arc<dyn SandboxProvisioner>,
    state: Mutex<PoolState>,
    /// Signalled whenever a slot frees up (release or destroy).
    released: Notify,
}

impl LanguagePool {
    fn new(
        language: Language,
        settings: PoolSettings,
        provisioner: Arc<dyn SandboxProvisioner>,
    ) -> Self {
        Self {
            language,
            settings,
            provisioner,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: HashMap::new(),
                total: 0,
            }),
            released: Notify::new(),
        }
    }

    async fn provision_handle(&self) -> SandboxResult<SandboxHandle> {
        let sandbox = self.provisioner.provision(self.language).await?;
        Ok(SandboxHandle::new(
            sandbox,
            self.language,
            self.settings.running_ttl(),
        ))
    }

    async fn acquire(&self) -> Result<SandboxHandle, PoolError> {
        let deadline = Instant::now() + self.settings.acquire_wait();

        loop {
            enum Step {
                Reuse(SandboxHandle),
                Provision,
                Wait,
            }

            let step = {
                let mut state = self.state.lock().await;
                if let Some(handle) = state.idle.pop_front() {
                    handle.set_state(SandboxState::Active);
                    state.active.insert(handle.id().to_string(), handle.clone());
                    Step::Reuse(handle)
                } else if state.total < self.settings.max_total {
                    // Reserve the slot before provisioning outside the lock.
                    state.total += 1;
                    Step::Provision
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Reuse(handle) => {
                    debug!(sandbox = handle.id(), language = %self.language, "reusing idle sandbox");
                    return Ok(handle);
                }
                Step::Provision => match self.provision_handle().await {
                    Ok(handle) => {
                        handle.set_state(SandboxState::Active);
                        let mut state = self.state.lock().await;
                        state.active.insert(handle.id().to_string(), handle.clone());
                        drop(state);
                        debug!(sandbox = handle.id(), language = %self.language, "provisioned sandbox on demand");
                        return Ok(handle);
                    }
                    Err(e) => {
                        self.state.lock().await.total -= 1;
                        self.released.notify_one();
                        return Err(PoolError::NoSandboxAvailable {
                            language: self.language,
                            reason: e.to_string(),
                        });
                    }
                },
                Step::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::NoSandboxAvailable {
                            language: self.language,
                            reason: format!(
                                "pool saturated ({} active) and none released within {}s",
                                self.settings.max_total, self.settings.acquire_wait_secs
                            ),
                        });
                    }
                    let _ = tokio::time::timeout_at(deadline, self.released.notified()).await;
                }
            }
        }
    }

    /// Returns a handle to the pool. Never fails: a handle that cannot be
    /// reset is destroyed, freeing its slot.
    async fn release(&self, handle: SandboxHandle) {
        if handle.state() == SandboxState::Destroyed {
            // The sweeper already killed and untracked it.
            return;
        }

        match handle.cleanup().await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                if state.active.remove(handle.id()).is_some() {
                    handle.set_state(SandboxState::Idle);
                    state.idle.push_back(handle);
                    drop(state);
                    self.released.notify_one();
                }
            }
            Err(e) => {
                warn!(
                    sandbox = handle.id(),
                    language = %self.language,
                    "sandbox reset failed, destroying: {e}"
                );
                self.destroy(handle).await;
            }
        }
    }

    /// Removes a handle from the books and terminates its environment.
    async fn destroy(&self, handle: SandboxHandle) {
        let was_tracked = {
            let mut state = self.state.lock().await;
            let removed = state.active.remove(handle.id()).is_some();
            if removed {
                state.total -= 1;
            }
            removed
        };
        if was_tracked {
            self.released.notify_one();
        }
        if let Err(e) = handle.destroy().await {
            warn!(sandbox = handle.id(), "failed to terminate sandbox: {e}");
        }
    }

    /// One sweep pass: running-TTL kills, idle-TTL expiry, replenishment.
    async fn sweep(&self) {
        let now = Instant::now();

        // Kill active sandboxes whose running TTL elapsed.
        let over_ttl: Vec<SandboxHandle> = {
            let mut state = self.state.lock().await;
            let expired: Vec<String> = state
                .active
                .values()
                .filter(|h| {
                    now.saturating_duration_since(h.last_activity()) > self.settings.running_ttl()
                })
                .map(|h| h.id().to_string())
                .collect();
            let mut killed = Vec::with_capacity(expired.len());
            for id in &expired {
                if let Some(handle) = state.active.remove(id) {
                    state.total -= 1;
                    killed.push(handle);
                }
            }
            killed
        };
        for handle in over_ttl {
            warn!(
                sandbox = handle.id(),
                language = %self.language,
                "running TTL expired, force-destroying active sandbox"
            );
            if let Err(e) = handle.destroy().await {
                warn!(sandbox = handle.id(), "failed to destroy over-TTL sandbox: {e}");
            }
            self.released.notify_one();
        }

        // Expire idle sandboxes beyond the warm minimum.
        let stale: Vec<SandboxHandle> = {
            let mut state = self.state.lock().await;
            let mut dropped = Vec::new();
            while state.idle.len() > self.settings.min_idle {
                let front_expired = state.idle.front().is_some_and(|h| {
                    now.saturating_duration_since(h.last_activity()) > self.settings.idle_ttl()
                });
                if !front_expired {
                    break;
                }
                if let Some(handle) = state.idle.pop_front() {
                    state.total -= 1;
                    dropped.push(handle);
                }
            }
            dropped
        };
        for handle in stale {
            debug!(sandbox = handle.id(), language = %self.language, "idle TTL expired");
            if let Err(e) = handle.destroy().await {
                warn!(sandbox = handle.id(), "failed to destroy idle sandbox: {e}");
            }
        }

        self.replenish().await;
    }

    /// Provisions idle sandboxes until `min_idle` is restored (bounded by
    /// `max_total`). Provisioning errors are logged and retried on the
    /// next sweep.
    async fn replenish(&self) {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.idle.len() >= self.settings.min_idle
                    || state.total >= self.settings.max_total
                {
                    break;
                }
                // Reserve the slot before provisioning outside the lock.
                state.total += 1;
            }

            match self.provision_handle().await {
                Ok(handle) => {
                    let mut state = self.state.lock().await;
                    state.idle.push_back(handle);
                    drop(state);
                    self.released.notify_one();
                }
                Err(e) => {
                    self.state.lock().await.total -= 1;
                    warn!(language = %self.language, "failed to replenish pool: {e}");
                    break;
                }
            }
        }
    }

    async fn counts(&self) -> PoolCounts {
        let state = self.state.lock().await;
        PoolCounts {
            idle: state.idle.len(),
            active: state.active.len(),
            total: state.total,
        }
    }

    /// Destroys every sandbox in the pool.
    async fn drain(&self) {
        let handles: Vec<SandboxHandle> = {
            let mut state = self.state.lock().await;
            let mut all: Vec<SandboxHandle> = state.idle.drain(..).collect();
            all.extend(state.active.drain().map(|(_, h)| h));
            state.total = 0;
            all
        };
        for handle in handles {
            if let Err(e) = handle.destroy().await {
                warn!(sandbox = handle.id(), "failed to destroy sandbox on shutdown: {e}");
            }
        }
    }
}

/// Process-wide manager owning one sandbox pool per supported language.
///
/// Pass the manager into pipelines as an `Arc<PoolManager>`; it is
/// internally synchronized and safe to share across any number of
/// concurrent executions.
pub struct PoolManager {
    pools: BTreeMap<Language, Arc<LanguagePool>>,
    shutdown_token: CancellationToken,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// Brings the fleet online: cleans up orphaned environments from a
    /// prior ungraceful shutdown, pre-warms every pool to its minimum
    /// idle set, and starts the background sweeper.
    pub async fn initialize(
        provisioner: Arc<dyn SandboxProvisioner>,
        pool_settings: BTreeMap<Language, PoolSettings>,
    ) -> SandboxResult<Arc<Self>> {
        let removed = provisioner.cleanup_orphans().await?;
        if removed > 0 {
            info!("removed {removed} orphaned sandbox container(s)");
        }

        let pools: BTreeMap<Language, Arc<LanguagePool>> = pool_settings
            .into_iter()
            .map(|(language, settings)| {
                let pool = Arc::new(LanguagePool::new(language, settings, provisioner.clone()));
                (language, pool)
            })
            .collect();

        for pool in pools.values() {
            pool.replenish().await;
            let counts = pool.counts().await;
            info!(
                language = %pool.language,
                idle = counts.idle,
                "sandbox pool online"
            );
        }

        let shutdown_token = CancellationToken::new();
        let sweeper = {
            let pools: Vec<Arc<LanguagePool>> = pools.values().cloned().collect();
            let token = shutdown_token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            for pool in &pools {
                                pool.sweep().await;
                            }
                        }
                    }
                }
            })
        };

        Ok(Arc::new(Self {
            pools,
            shutdown_token,
            sweeper: std::sync::Mutex::new(Some(sweeper)),
        }))
    }

    /// Acquires an exclusive sandbox handle for the given language.
    ///
    /// Blocks while the pool is saturated, up to the configured wait.
    ///
    /// # Errors
    ///
    /// - [`PoolError::UnsupportedLanguage`] when no pool exists for the tag
    /// - [`PoolError::NoSandboxAvailable`] on saturation timeout or
    ///   provisioning failure
    pub async fn acquire(&self, language: Language) -> Result<SandboxHandle, PoolError> {
        let pool = self
            .pools
            .get(&language)
            .ok_or(PoolError::UnsupportedLanguage(language))?;
        pool.acquire().await
    }

    /// Returns a handle to its pool. Infallible; a handle that cannot be
    /// reset is destroyed instead of reused.
    pub async fn release(&self, handle: SandboxHandle) {
        if let Some(pool) = self.pools.get(&handle.language()) {
            pool.release(handle).await;
        }
    }

    /// Destroys a handle instead of returning it, freeing its slot.
    ///
    /// Used after an interrupted execution, where the sandbox state is
    /// suspect.
    pub async fn discard(&self, handle: SandboxHandle) {
        if let Some(pool) = self.pools.get(&handle.language()) {
            pool.destroy(handle).await;
        }
    }

    /// Whether a pool is configured for the given language.
    pub fn supports(&self, language: Language) -> bool {
        self.pools.contains_key(&language)
    }

    /// Current occupancy of one pool, for observability and tests.
    pub async fn counts(&self, language: Language) -> Option<PoolCounts> {
        match self.pools.get(&language) {
            Some(pool) => Some(pool.counts().await),
            None => None,
        }
    }

    /// Stops the sweeper and destroys every sandbox in every pool.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let sweeper = self.sweeper.lock().expect("sweeper handle poisoned").take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        for pool in self.pools.values() {
            pool.drain().await;
        }
        info!("sandbox fleet shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::FakeProvisioner;
    use std::sync::atomic::Ordering;

    fn settings(min_idle: usize, max_total: usize) -> PoolSettings {
        PoolSettings {
            image: "autograder/test:latest".to_string(),
            min_idle,
            max_total,
            idle_ttl_secs: 600,
            running_ttl_secs: 120,
            acquire_wait_secs: 5,
        }
    }

    async fn build_manager(
        provisioner: Arc<FakeProvisioner>,
        pool: PoolSettings,
    ) -> Arc<PoolManager> {
        let mut pools = BTreeMap::new();
        pools.insert(Language::Python, pool);
        PoolManager::initialize(provisioner, pools).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_prewarms_min_idle() {
        let provisioner = FakeProvisioner::new();
        let manager = build_manager(provisioner.clone(), settings(2, 4)).await;

        let counts = manager.counts(Language::Python).await.unwrap();
        assert_eq!(counts, PoolCounts { idle: 2, active: 0, total: 2 });
        assert_eq!(provisioner.provisioned_count(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reuses_idle_fifo() {
        let provisioner = FakeProvisioner::new();
        let manager = build_manager(provisioner.clone(), settings(2, 4)).await;

        let first = manager.acquire(Language::Python).await.unwrap();
        assert_eq!(first.state(), SandboxState::Active);
        // Pre-warmed sandboxes are handed out before new ones are made.
        assert_eq!(provisioner.provisioned_count(), 2);

        let first_id = first.id().to_string();
        manager.release(first).await;

        let counts = manager.counts(Language::Python).await.unwrap();
        assert_eq!(counts, PoolCounts { idle: 2, active: 0, total: 2 });

        // FIFO: the other pre-warmed sandbox comes out first, then the
        // one we just released.
        let a = manager.acquire(Language::Python).await.unwrap();
        let b = manager.acquire(Language::Python).await.unwrap();
        assert_ne!(a.id(), first_id);
        assert_eq!(b.id(), first_id);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_provisions_up_to_max() {
        let provisioner = FakeProvisioner::new();
        let manager = build_manager(provisioner.clone(), settings(1, 3)).await;

        let h1 = manager.acquire(Language::Python).await.unwrap();
        let h2 = manager.acquire(Language::Python).await.unwrap();
        let h3 = manager.acquire(Language::Python).await.unwrap();

        let counts = manager.counts(Language::Python).await.unwrap();
        assert_eq!(counts, PoolCounts { idle: 0, active: 3, total: 3 });
        assert_eq!(provisioner.provisioned_count(), 3);

        drop((h1, h2, h3));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_blocks_until_release() {
        let provisioner = FakeProvisioner::new();
        let manager = build_manager(provisioner.clone(), settings(0, 1)).await;

        let held = manager.acquire(Language::Python).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(Language::Python).await })
        };

        // Let the waiter block on the saturated pool, then release.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        manager.release(held).await;
        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.state(), SandboxState::Active);

        // Conservation: one sandbox total, now active again.
        let counts = manager.counts(Language::Python).await.unwrap();
        assert_eq!(counts, PoolCounts { idle: 0, active: 1, total: 1 });
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_saturated() {
        let provisioner = FakeProvisioner::new();
        let manager = build_manager(provisioner.clone(), settings(0, 1)).await;

        let _held = manager.acquire(Language::Python).await.unwrap();
        let err = manager.acquire(Language::Python).await.unwrap_err();
        assert!(matches!(err, PoolError::NoSandboxAvailable { .. }));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_language() {
        let provisioner = FakeProvisioner::new();
        let manager = build_manager(provisioner.clone(), settings(0, 1)).await;

        let err = manager.acquire(Language::Java).await.unwrap_err();
        assert!(matches!(err, PoolError::UnsupportedLanguage(Language::Java)));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_resets_sandbox() {
        let provisioner = FakeProvisioner::new();
        let manager = build_manager(provisioner.clone(), settings(0, 1)).await;

        let handle = manager.acquire(Language::Python).await.unwrap();
        manager.release(handle).await;

        let sandbox = provisioner.nth(0);
        assert_eq!(sandbox.cleanup_calls.load(Ordering::SeqCst), 1);
        assert!(!sandbox.is_terminated());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_destroys_on_failed_reset() {
        let provisioner = FakeProvisioner::new();
        let manager = build_manager(provisioner.clone(), settings(0, 2)).await;

        let handle = manager.acquire(Language::Python).await.unwrap();
        provisioner.nth(0).fail_cleanup.store(true, Ordering::SeqCst);
        manager.release(handle).await;

        assert!(provisioner.nth(0).is_terminated());
        let counts = manager.counts(Language::Python).await.unwrap();
        assert_eq!(counts, PoolCounts { idle: 0, active: 0, total: 0 });
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_replenishes_min_idle() {
        let provisioner = FakeProvisioner::new();
        let manager = build_manager(provisioner.clone(), settings(2, 4)).await;

        // Take both warm sandboxes and destroy one via failed reset.
        let h1 = manager.acquire(Language::Python).await.unwrap();
        let _h2 = manager.acquire(Language::Python).await.unwrap();
        provisioner.nth(0).fail_cleanup.store(true, Ordering::SeqCst);
        manager.release(h1).await;

        // Within one sweep cycle the idle set is restored.
        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        let counts = manager.counts(Language::Python).await.unwrap();
        assert_eq!(counts.idle, 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_idle_beyond_min() {
        let provisioner = FakeProvisioner::new();
        let mut pool = settings(1, 4);
        pool.idle_ttl_secs = 60;
        let manager = build_manager(provisioner.clone(), pool).await;

        // Grow the pool to 3, then release everything back.
        let h1 = manager.acquire(Language::Python).await.unwrap();
        let h2 = manager.acquire(Language::Python).await.unwrap();
        let h3 = manager.acquire(Language::Python).await.unwrap();
        manager.release(h1).await;
        manager.release(h2).await;
        manager.release(h3).await;

        assert_eq!(manager.counts(Language::Python).await.unwrap().idle, 3);

        // After the idle TTL, only the warm minimum survives.
        tokio::time::sleep(Duration::from_secs(90)).await;
        let counts = manager.counts(Language::Python).await.unwrap();
        assert_eq!(counts.idle, 1);
        assert_eq!(counts.total, 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_kills_over_ttl_active_sandbox() {
        let provisioner = FakeProvisioner::new();
        let mut pool = settings(0, 2);
        pool.running_ttl_secs = 30;
        let manager = build_manager(provisioner.clone(), pool).await;

        let handle = manager.acquire(Language::Python).await.unwrap();

        // No activity for longer than the running TTL.
        tokio::time::sleep(Duration::from_secs(45)).await;

        assert_eq!(handle.state(), SandboxState::Destroyed);
        assert!(provisioner.nth(0).is_terminated());
        let counts = manager.counts(Language::Python).await.unwrap();
        assert_eq!(counts, PoolCounts { idle: 0, active: 0, total: 0 });

        // The owner observes the broken handle on its next command.
        let err = handle.run_command("echo hi", None).await.unwrap_err();
        assert!(matches!(err, crate::sandbox::SandboxError::Destroyed(_)));

        // Releasing the dead handle is a no-op.
        manager.release(handle).await;
        let counts = manager.counts(Language::Python).await.unwrap();
        assert_eq!(counts.total, 0);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_failure_surfaces_to_acquire() {
        let provisioner = FakeProvisioner::new();
        let manager = build_manager(provisioner.clone(), settings(0, 2)).await;

        provisioner.fail.store(true, Ordering::SeqCst);
        let err = manager.acquire(Language::Python).await.unwrap_err();
        assert!(matches!(err, PoolError::NoSandboxAvailable { .. }));

        // The reserved slot was returned.
        let counts = manager.counts(Language::Python).await.unwrap();
        assert_eq!(counts.total, 0);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_destroys_everything() {
        let provisioner = FakeProvisioner::new();
        let manager = build_manager(provisioner.clone(), settings(2, 4)).await;

        let _active = manager.acquire(Language::Python).await.unwrap();
        manager.shutdown().await;

        for i in 0..provisioner.provisioned_count() {
            assert!(provisioner.nth(i).is_terminated());
        }
        let counts = manager.counts(Language::Python).await.unwrap();
        assert_eq!(counts, PoolCounts { idle: 0, active: 0, total: 0 });
    }
}
