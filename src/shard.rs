//! Splitting one invocation into shards.
//!
//! Two modes exist. With both a shard count and index the invocation IS a
//! shard: it trims its own test list and runs inline. With only a count
//! the invocation is the parent: it partitions its tests into child
//! configurations and hands them to a [`Rescheduler`], then stops before
//! the test phase.

use std::sync::Mutex;

use tracing::{debug, info};

use crate::config::Configuration;
use crate::context::{keys, TestInformation};
use crate::error::{InvocationError, InvocationResult};

/// Accepts child configurations produced by sharding. The scheduler
/// behind it decides where and when they run.
pub trait Rescheduler: Send + Sync {
    /// Returns false when the shard could not be queued.
    fn schedule(&self, config: Configuration) -> bool;
}

/// Rescheduler that queues configurations for the caller to run itself.
pub struct CollectingRescheduler {
    configs: Mutex<Vec<Configuration>>,
}

impl CollectingRescheduler {
    pub fn new() -> Self {
        Self {
            configs: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<Configuration> {
        std::mem::take(&mut self.configs.lock().unwrap())
    }
}

impl Default for CollectingRescheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Rescheduler for CollectingRescheduler {
    fn schedule(&self, config: Configuration) -> bool {
        self.configs.lock().unwrap().push(config);
        true
    }
}

/// Apply the sharding strategy to `config`.
///
/// Returns true when the tests were handed off to the rescheduler and the
/// caller must not run the test phase itself. Returns false when the
/// invocation runs inline, either unsharded or as a single trimmed shard.
pub fn shard_config(
    config: &mut Configuration,
    info: &TestInformation,
    rescheduler: &dyn Rescheduler,
) -> InvocationResult<bool> {
    let count = match config.options.shard_count {
        Some(count) if count > 1 && config.shardable => count,
        Some(_) => {
            debug!("shard count ignored, running unsharded");
            return Ok(false);
        }
        None => return Ok(false),
    };

    if let Some(index) = config.options.shard_index {
        if index >= count {
            return Err(InvocationError::Infra(format!(
                "shard index {index} out of range for {count} shards"
            )));
        }
        let context = info.context();
        context.add_attribute(keys::SHARD_COUNT, count.to_string())?;
        context.add_attribute(keys::SHARD_INDEX, index.to_string())?;

        if config.sharded {
            // A parent split already placed exactly this shard's tests in
            // the list; trimming again would drop some of them.
            debug!(shard = index, of = count, "running pre-sliced shard");
            return Ok(false);
        }

        let total = config.tests.len();
        let tests = std::mem::take(&mut config.tests);
        config.tests = tests
            .into_iter()
            .enumerate()
            .filter(|(position, test)| {
                // Shard-aware tests see the shard attributes and trim
                // themselves, so every shard keeps them.
                test.is_shard_aware() || position % count == index
            })
            .map(|(_, test)| test)
            .collect();
        info!(
            shard = index,
            of = count,
            kept = config.tests.len(),
            total,
            "running as local shard"
        );
        return Ok(false);
    }

    // Parent invocation. Round-robin spreads the remainder so shard
    // sizes differ by at most one.
    let mut buckets: Vec<Vec<_>> = (0..count).map(|_| Vec::new()).collect();
    let tests = std::mem::take(&mut config.tests);
    for (position, test) in tests.into_iter().enumerate() {
        buckets[position % count].push(test);
    }

    let mut scheduled = 0usize;
    for (index, bucket) in buckets.into_iter().enumerate() {
        if bucket.is_empty() {
            continue;
        }
        let mut shard = config.clone_without_tests();
        shard.options.shard_count = Some(count);
        shard.options.shard_index = Some(index);
        shard.sharded = true;
        shard.tests = bucket;
        if !rescheduler.schedule(shard) {
            return Err(InvocationError::Infra(format!(
                "failed to reschedule shard {index}"
            )));
        }
        scheduled += 1;
    }

    info!(shards = scheduled, "invocation sharded");
    Ok(true)
}
