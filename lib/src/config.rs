//! Defines the tuning knobs consumed by the pool, the update buffer and the writer.
//! Values can be built in code with [`WriterConfig::builder`] or loaded from a JSON file.

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Write};
use std::path::Path;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Builder)]
#[builder(default)]
#[serde(default)]
pub struct WriterConfig {
    /// Sessions opened when the read pool is created.
    pub pool_initial_size: usize,
    /// Sessions the pool may add beyond its initial size; `None` means unbounded.
    pub pool_max_growth: Option<usize>,
    /// Idle sessions the maintenance loop keeps ready.
    pub pool_spare_sessions: usize,
    /// Once the buffer holds this many updates, the next append flushes first.
    pub buffer_safe_capacity: usize,
    /// Largest set handed to a single backend add/delete call.
    pub flush_batch_size: usize,
    /// Buffer size at which the auto-flush loop flushes without waiting.
    pub auto_flush_size: usize,
    /// Idle seconds after which the auto-flush loop flushes a non-empty buffer.
    pub auto_flush_dormant_secs: u64,
    /// How often background loops wake up to re-check their conditions.
    pub poll_interval_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            pool_initial_size: 1,
            pool_max_growth: Some(4),
            pool_spare_sessions: 1,
            buffer_safe_capacity: 100_000,
            flush_batch_size: 1_000,
            auto_flush_size: 10_000,
            auto_flush_dormant_secs: 2,
            poll_interval_ms: 250,
        }
    }
}

impl WriterConfig {
    pub fn builder() -> WriterConfigBuilder {
        WriterConfigBuilder::default()
    }

    /// Maximum number of sessions the read pool may hold, if bounded.
    pub fn pool_max_size(&self) -> Option<usize> {
        self.pool_max_growth
            .map(|growth| self.pool_initial_size.saturating_add(growth))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dormant_period(&self) -> Duration {
        Duration::from_secs(self.auto_flush_dormant_secs)
    }

    /// Rejects combinations the writer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.flush_batch_size == 0 {
            return Err(anyhow!("flush_batch_size must be at least 1"));
        }
        if self.auto_flush_size == 0 {
            return Err(anyhow!("auto_flush_size must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be at least 1"));
        }
        if let Some(max) = self.pool_max_size() {
            if max == 0 {
                return Err(anyhow!("the read pool must be allowed at least one session"));
            }
        }
        Ok(())
    }

    pub fn save_to_file(&self, file: &Path) -> Result<()> {
        let config_str = serde_json::to_string_pretty(&self)?;
        let mut file = std::fs::File::create(file)?;
        file.write_all(config_str.as_bytes())?;
        Ok(())
    }

    pub fn from_file(file: &Path) -> Result<Self> {
        let file = std::fs::File::open(file)?;
        let reader = BufReader::new(file);
        let config: WriterConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Prints out the current WriterConfig in a readable way for command line output.
    pub fn print(&self) {
        println!("Writer configuration:");
        println!("  Pool initial size: {}", self.pool_initial_size);
        match self.pool_max_growth {
            Some(growth) => println!("  Pool max growth: {}", growth),
            None => println!("  Pool max growth: unbounded"),
        }
        println!("  Pool spare sessions: {}", self.pool_spare_sessions);
        println!("  Buffer safe capacity: {}", self.buffer_safe_capacity);
        println!("  Flush batch size: {}", self.flush_batch_size);
        println!("  Auto-flush size: {}", self.auto_flush_size);
        println!("  Auto-flush dormant seconds: {}", self.auto_flush_dormant_secs);
        println!("  Poll interval (ms): {}", self.poll_interval_ms);
    }
}
