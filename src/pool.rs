use std::{
    future::Future,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result, bail, ensure};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::browser::BrowserInstance;

/// A fixed set of browser instances handed out one caller at a time
///
/// Every idle instance is backed by one semaphore permit, so waiting callers
/// are served in FIFO order and never observe an empty idle list.
pub struct InstancePool<B> {
    idle: Mutex<Vec<B>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl<B: BrowserInstance> InstancePool<B> {
    /// Builds all `size` instances up front
    ///
    /// # Errors
    /// Errors as soon as one instance fails to launch. Instances launched
    /// before the failure are shut down again.
    #[instrument(skip(launch))]
    pub async fn launch<F, Fut>(size: usize, mut launch: F) -> Result<Arc<Self>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<B>>,
    {
        ensure!(size > 0, "Instance pool needs at least one instance");

        let mut instances = Vec::with_capacity(size);
        for index in 0..size {
            match launch(index)
                .await
                .with_context(|| format!("Launching browser instance {index}"))
            {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    for mut instance in instances {
                        instance.shutdown().await.ok();
                    }
                    return Err(e);
                }
            }
        }

        info!("Started {size} browser instance(s)");
        Ok(Arc::new(Self {
            idle: Mutex::new(instances),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }))
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Number of instances not currently on loan
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for an idle instance and lends it out until the guard is dropped
    ///
    /// # Errors
    /// Errors when the pool has been shut down
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledInstance<B>> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .context("Instance pool is shut down")?;

        let Some(instance) = self.lock_idle().pop() else {
            bail!("Instance pool granted a permit without an idle instance");
        };

        Ok(PooledInstance {
            instance: Some(instance),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Returns an instance to the pool. Same as dropping the guard.
    pub fn release(instance: PooledInstance<B>) {
        drop(instance);
    }

    /// Terminates every idle instance and refuses further acquisitions
    ///
    /// Instances still on loan are terminated in the background once returned.
    /// Returns how many instances were terminated here.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> usize {
        self.permits.close();
        let idle = std::mem::take(&mut *self.lock_idle());
        let on_loan = self.size.saturating_sub(idle.len());
        if on_loan > 0 {
            warn!("Shutting down with {on_loan} instance(s) still on loan");
        }

        let count = idle.len();
        for mut instance in idle {
            if let Err(e) = instance.shutdown().await {
                warn!("Failed to shut down browser instance: {e:#}");
            }
        }
        info!("Shut down {count} browser instance(s)");
        count
    }

    fn give_back(&self, mut instance: B) {
        if !self.permits.is_closed() {
            self.lock_idle().push(instance);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Pool already shut down, terminating returned instance");
                handle.spawn(async move {
                    if let Err(e) = instance.shutdown().await {
                        warn!("Failed to shut down browser instance: {e:#}");
                    }
                });
            }
            Err(_) => warn!("Abandoning browser instance returned after shutdown"),
        }
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<B>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive loan of one instance. Dropping it hands the instance back.
pub struct PooledInstance<B: BrowserInstance> {
    instance: Option<B>,
    pool: Arc<InstancePool<B>>,
    // Dropped after `Drop::drop` has put the instance back
    _permit: OwnedSemaphorePermit,
}

impl<B: BrowserInstance> Deref for PooledInstance<B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.instance.as_ref().expect("instance is present until drop")
    }
}

impl<B: BrowserInstance> DerefMut for PooledInstance<B> {
    fn deref_mut(&mut self) -> &mut B {
        self.instance.as_mut().expect("instance is present until drop")
    }
}

impl<B: BrowserInstance> Drop for PooledInstance<B> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.give_back(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::task::JoinSet;

    use super::*;
    use crate::browser::fake::FakeBrowser;

    async fn fake_pool(size: usize) -> Arc<InstancePool<FakeBrowser>> {
        InstancePool::launch(size, |i| async move { Ok(FakeBrowser::new(i)) })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn launch_is_eager() {
        let launched = AtomicUsize::new(0);
        let pool = InstancePool::launch(3, |i| {
            launched.fetch_add(1, Ordering::SeqCst);
            async move { Ok(FakeBrowser::new(i)) }
        })
        .await
        .unwrap();

        assert_eq!(launched.load(Ordering::SeqCst), 3);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn launch_failure_is_fatal_and_cleans_up() {
        let stats = Arc::new(crate::browser::fake::FakeStats::default());
        let result = InstancePool::launch(3, |i| {
            let stats = Arc::clone(&stats);
            async move {
                if i == 2 {
                    bail!("no chromium here");
                }
                let mut browser = FakeBrowser::new(i);
                browser.stats = stats;
                Ok(browser)
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(stats.shutdowns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_sized_pool_is_rejected() {
        let result = InstancePool::<FakeBrowser>::launch(0, |i| async move { Ok(FakeBrowser::new(i)) }).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn two_instances_five_callers() {
        let pool = fake_pool(2).await;
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(pool.available(), 0);

        let acquired = Arc::new(AtomicUsize::new(0));
        let mut waiters = JoinSet::new();
        for _ in 0..3 {
            let pool = Arc::clone(&pool);
            let acquired = Arc::clone(&acquired);
            waiters.spawn(async move {
                let guard = pool.acquire().await.unwrap();
                acquired.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                drop(guard);
            });
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(acquired.load(Ordering::SeqCst), 0);

        InstancePool::release(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(acquired.load(Ordering::SeqCst), 1);

        drop(second);
        waiters.join_all().await;
        assert_eq!(acquired.load(Ordering::SeqCst), 3);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_lends_more_than_size_or_the_same_instance_twice() {
        let pool = fake_pool(3).await;
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for n in 0..20_u64 {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                let guard = pool.acquire().await.unwrap();
                assert!(!guard.stats.on_loan.swap(true, Ordering::SeqCst), "double handout");

                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 + n % 7)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);

                guard.stats.on_loan.store(false, Ordering::SeqCst);
            });
        }
        tasks.join_all().await;

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn shutdown_terminates_idle_and_closes() {
        let pool = fake_pool(2).await;
        let guard = pool.acquire().await.unwrap();
        let loaned_stats = Arc::clone(&guard.stats);

        assert_eq!(pool.shutdown().await, 1);
        assert!(pool.acquire().await.is_err());

        drop(guard);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(loaned_stats.shutdowns.load(Ordering::SeqCst), 1);
    }
}
