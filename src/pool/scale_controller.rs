//! Adaptive sizing of a connection pool
//!
//! Every `poll_interval` the controller freezes its pool, asks [`decide`]
//! for at most one action, and applies it:
//!
//! ```text
//!   size > min && some member idle >= idle_timeout   ──► ScaleDown (-1)
//!   size < min                                       ──► ScaleUp   (+1)
//!   size < max && pending sends > threshold          ──► ScaleUp   (+1)
//!   otherwise                                        ──► NoChange
//! ```
//!
//! One step per cycle keeps the pool from oscillating; a pool far from its
//! target converges over several cycles.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionPool, PoolError};

/// Scale controller thresholds
#[derive(Debug, Clone)]
pub struct ScaleControllerConfig {
    /// A member idle this long makes the pool a shrink candidate
    pub idle_timeout: Duration,
    /// Pending sends above this grow the pool
    pub backpressure_threshold: usize,
    /// Time between evaluations
    pub poll_interval: Duration,
}

impl Default for ScaleControllerConfig {
    fn default() -> Self {
        ScaleControllerConfig {
            idle_timeout: Duration::from_secs(60),
            backpressure_threshold: 8,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingDecision {
    /// Pool is sized right
    NoChange,
    /// Add one connection
    ScaleUp { reason: String },
    /// Drain and remove one connection
    ScaleDown { reason: String, idle: Duration },
}

impl ScalingDecision {
    pub fn delta(&self) -> i32 {
        match self {
            ScalingDecision::NoChange => 0,
            ScalingDecision::ScaleUp { .. } => 1,
            ScalingDecision::ScaleDown { .. } => -1,
        }
    }
}

/// Decide the single action to take for `pool` right now
pub fn decide(pool: &dyn ConnectionPool, config: &ScaleControllerConfig) -> ScalingDecision {
    let size = pool.size();
    let min = pool.min_size();
    let max = pool.max_size();

    if size > min {
        let idle = pool
            .connections()
            .iter()
            .map(|c| c.idle_time())
            .max()
            .unwrap_or_default();
        if idle >= config.idle_timeout {
            return ScalingDecision::ScaleDown {
                reason: format!("connection idle for {:?}", idle),
                idle,
            };
        }
    }

    if size < min {
        return ScalingDecision::ScaleUp {
            reason: format!("size {} below minimum {}", size, min),
        };
    }

    let pending = pool.pending_sends();
    if size < max && pending > config.backpressure_threshold {
        return ScalingDecision::ScaleUp {
            reason: format!(
                "{} pending sends over threshold {}",
                pending, config.backpressure_threshold
            ),
        };
    }

    ScalingDecision::NoChange
}

/// Background loop resizing one pool
pub struct ScaleController {
    pool: Arc<dyn ConnectionPool>,
    config: ScaleControllerConfig,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ScaleController {
    /// `cancel` is usually a child of the cluster's token
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        config: ScaleControllerConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(ScaleController {
            pool,
            config,
            cancel,
            task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ScaleControllerConfig {
        &self.config
    }

    /// Start the monitor loop; a second call is a no-op
    pub fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(PoolError::Disposed);
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        let controller = Arc::clone(self);
        *task = Some(tokio::spawn(async move { controller.monitor().await }));
        Ok(())
    }

    async fn monitor(&self) {
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            match self.run_scaling_logic().await {
                Ok(_) => {}
                Err(PoolError::Disposed) => break,
                Err(e) => warn!(endpoint = %self.pool.endpoint(), error = %e, "scaling cycle failed"),
            }
        }
        debug!(endpoint = %self.pool.endpoint(), "scale controller stopped");
    }

    /// Run one evaluation under the pool freeze and apply its decision
    pub async fn run_scaling_logic(&self) -> Result<ScalingDecision, PoolError> {
        let freeze = self.pool.freeze().await?;
        let decision = decide(self.pool.as_ref(), &self.config);

        if decision != ScalingDecision::NoChange {
            info!(
                endpoint = %self.pool.endpoint(),
                size = self.pool.size(),
                decision = ?decision,
                "scaling pool"
            );
            self.pool.scale(decision.delta(), &freeze).await?;
        }
        Ok(decision)
    }

    /// Stop the loop and wait for it to exit
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for ScaleController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
