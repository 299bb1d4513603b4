//! ConcurrencyLimiter - 同時実行数の上限
//!
//! 投入（submit）は無制限、実行開始だけをここで絞る。
//! `tokio::sync::Semaphore` は FIFO なので、待っているタスクは到着順に起動する。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("max_concurrent must be at least 1")]
    ZeroCapacity,

    #[error("concurrency limiter is closed")]
    Closed,
}

/// Counting semaphore bounding simultaneously running work functions.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    in_use: Arc<AtomicUsize>,
    max_concurrent: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Result<Self, LimiterError> {
        if max_concurrent == 0 {
            return Err(LimiterError::ZeroCapacity);
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            in_use: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
        })
    }

    /// Wait for a free slot.
    ///
    /// Fails only after [`close`](Self::close).
    pub async fn acquire(&self) -> Result<Permit, LimiterError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;
        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(Permit {
            _permit: permit,
            in_use: Arc::clone(&self.in_use),
        })
    }

    /// Wake every waiter with [`LimiterError::Closed`]. Held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

/// One execution slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    in_use: Arc<AtomicUsize>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}
