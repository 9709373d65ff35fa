//! Execution time and the verification poll loop.
//!
//! `exec_time` lives on the [`ExecutionContext`] and only advances here. Every poll cycle drains
//! telemetry and runs continuous verifications through [`PollHooks`].

use std::time::Duration;

use tracing::{debug, error};

use crate::context::ExecutionContext;
use crate::error::ConditionError;

/// Work done around every instruction and every poll cycle.
#[allow(async_fn_in_trait)]
pub trait PollHooks {
    /// Receive pending telemetry and evaluate continuous verifications.
    async fn pre_command(&mut self, ctx: &mut ExecutionContext) -> Result<(), ConditionError>;

    async fn post_command(&mut self, _ctx: &mut ExecutionContext) -> Result<(), ConditionError> {
        Ok(())
    }
}

/// Hooks that do nothing, for running without targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl PollHooks for NoHooks {
    async fn pre_command(&mut self, _ctx: &mut ExecutionContext) -> Result<(), ConditionError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeManager {
    poll_period: f64,
}

impl Default for TimeManager {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl TimeManager {
    pub fn new(poll_period: f64) -> Self {
        let poll_period = if poll_period > 0.0 { poll_period } else { 0.1 };
        debug!("Time manager initialized. Verification poll period = {}", poll_period);
        Self { poll_period }
    }

    pub fn poll_period(&self) -> f64 {
        self.poll_period
    }

    /// Poll for `seconds` of execution time, sleeping one poll period per cycle.
    pub async fn wait<H: PollHooks>(
        &self,
        seconds: f64,
        ctx: &mut ExecutionContext,
        hooks: &mut H,
    ) -> Result<(), ConditionError> {
        let end = ctx.exec_time + seconds;
        // Tolerate accumulated float error so 1.0 / 0.1 is ten cycles.
        while ctx.exec_time + self.poll_period * 1e-3 < end {
            if let Err(e) = self.pre_command(ctx, hooks).await {
                error!("Pre-command failed while waiting: {}", e);
                return Err(e);
            }
            if let Err(e) = self.post_command(ctx, hooks).await {
                error!("Post-command failed while waiting: {}", e);
                return Err(e);
            }
            tokio::time::sleep(Duration::from_secs_f64(self.poll_period)).await;
            ctx.exec_time += self.poll_period;
        }
        Ok(())
    }

    pub async fn pre_command<H: PollHooks>(
        &self,
        ctx: &mut ExecutionContext,
        hooks: &mut H,
    ) -> Result<(), ConditionError> {
        hooks.pre_command(ctx).await
    }

    pub async fn post_command<H: PollHooks>(
        &self,
        ctx: &mut ExecutionContext,
        hooks: &mut H,
    ) -> Result<(), ConditionError> {
        hooks.post_command(ctx).await
    }
}
