/// CPU Slot Scheduler - Admission Control for Sandbox Runs
///
/// One slot per usable host CPU. A run holds exactly one slot while its
/// container executes and is pinned to that slot's CPU. Slots come back
/// through a drop guard, so errors, panics and task cancellation cannot leak
/// capacity. Waiting is a semaphore acquire: no polling, best-effort
/// fairness.

use crate::context::RunContext;
use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

struct Pool {
    permits: Arc<Semaphore>,
    free: Mutex<Vec<usize>>,
    capacity: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    pool: Arc<Pool>,
}

/// A held CPU slot; returned to the pool on drop
pub struct CpuSlot {
    cpu: usize,
    pool: Arc<Pool>,
    // Released after the CPU is back on the free list (fields drop after `drop`)
    _permit: OwnedSemaphorePermit,
}

impl CpuSlot {
    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

impl Drop for CpuSlot {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.cpu);
    }
}

impl Scheduler {
    /// Pool with CPUs `0..cpu_count`
    pub fn new(cpu_count: usize) -> Self {
        Self {
            pool: Arc::new(Pool {
                permits: Arc::new(Semaphore::new(cpu_count)),
                free: Mutex::new((0..cpu_count).rev().collect()),
                capacity: cpu_count,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity
    }

    /// Slots not currently held by any run
    pub fn available(&self) -> usize {
        self.pool.permits.available_permits()
    }

    /// Wait for a free CPU
    pub async fn acquire(&self) -> Result<CpuSlot> {
        let permit = self
            .pool
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::internal("scheduler is closed"))?;

        let cpu = self
            .pool
            .free
            .lock()
            .pop()
            .ok_or_else(|| EngineError::internal("cpu permit granted with no free cpu"))?;

        Ok(CpuSlot {
            cpu,
            pool: self.pool.clone(),
            _permit: permit,
        })
    }

    /// Run `work` with a CPU assigned to `ctx`, holding the slot until it finishes
    pub async fn schedule<'a, F, Fut, T>(&self, ctx: &'a mut RunContext, work: F) -> Result<T>
    where
        F: FnOnce(&'a RunContext) -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        let slot = self.acquire().await?;
        ctx.cpu = Some(slot.cpu());

        debug!(
            submission_id = %ctx.submission_id(),
            cpu = slot.cpu(),
            available = self.available(),
            "CPU slot acquired"
        );

        let ctx: &'a RunContext = ctx;
        let result = work(ctx).await;
        drop(slot);
        result
    }
}
