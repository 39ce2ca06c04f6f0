//! Rate limiting module
//!
//! In-memory, per-plugin limits on the invoke path:
//!
//! - **Calls per minute** and **calls per hour**, as sliding windows
//! - **Concurrent calls**, released when the returned permit drops
//! - **Storage quota**, a running byte total per plugin
//!
//! Nothing here touches the database; violations are reported to the caller
//! which decides what to audit.

use crate::config::RateLimitConfig;
use sdk::errors::EngineError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Default)]
struct PluginUsage {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
    in_flight: Arc<AtomicU32>,
    storage_bytes: u64,
}

impl PluginUsage {
    fn expire(&mut self, now: Instant) {
        while self
            .minute
            .front()
            .is_some_and(|t| now.duration_since(*t) >= MINUTE)
        {
            self.minute.pop_front();
        }
        while self
            .hour
            .front()
            .is_some_and(|t| now.duration_since(*t) >= HOUR)
        {
            self.hour.pop_front();
        }
    }
}

/// Holds one concurrency slot for the duration of a plugin call
#[derive(Debug)]
pub struct CallPermit {
    in_flight: Arc<AtomicU32>,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Snapshot of one plugin's usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimitUsage {
    pub calls_last_minute: usize,
    pub calls_last_hour: usize,
    pub in_flight: u32,
    pub storage_bytes: u64,
}

/// Per-plugin call and storage limits
pub struct RateLimiter {
    config: RateLimitConfig,
    usage: Mutex<HashMap<String, PluginUsage>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            usage: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PluginUsage>> {
        match self.usage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admit one API call for `plugin_id`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::RateLimitExceeded` naming the limit that was hit.
    pub fn check_api_call(&self, plugin_id: &str) -> Result<CallPermit, EngineError> {
        self.check_api_call_at(plugin_id, Instant::now())
    }

    pub(crate) fn check_api_call_at(
        &self,
        plugin_id: &str,
        now: Instant,
    ) -> Result<CallPermit, EngineError> {
        let mut usage = self.lock();
        let entry = usage.entry(plugin_id.to_string()).or_default();
        entry.expire(now);

        let exceeded = |reason: String, retry_after: Option<Duration>| {
            debug!("Rate limit hit for {}: {}", plugin_id, reason);
            EngineError::RateLimitExceeded {
                plugin_id: plugin_id.to_string(),
                reason,
                retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            }
        };

        if entry.in_flight.load(Ordering::Acquire) >= self.config.max_concurrent_calls {
            return Err(exceeded(
                format!(
                    "{} concurrent calls already in flight",
                    self.config.max_concurrent_calls
                ),
                None,
            ));
        }

        if entry.minute.len() >= self.config.max_calls_per_minute as usize {
            let retry = entry
                .minute
                .front()
                .map(|t| MINUTE.saturating_sub(now.duration_since(*t)));
            return Err(exceeded(
                format!("{} calls per minute", self.config.max_calls_per_minute),
                retry,
            ));
        }

        if entry.hour.len() >= self.config.max_calls_per_hour as usize {
            let retry = entry
                .hour
                .front()
                .map(|t| HOUR.saturating_sub(now.duration_since(*t)));
            return Err(exceeded(
                format!("{} calls per hour", self.config.max_calls_per_hour),
                retry,
            ));
        }

        entry.minute.push_back(now);
        entry.hour.push_back(now);
        entry.in_flight.fetch_add(1, Ordering::AcqRel);

        Ok(CallPermit {
            in_flight: entry.in_flight.clone(),
        })
    }

    /// Reserve `additional_bytes` of storage for `plugin_id`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::StorageQuotaExceeded` and reserves nothing if the
    /// new total would exceed the quota.
    pub fn check_storage(&self, plugin_id: &str, additional_bytes: u64) -> Result<(), EngineError> {
        let mut usage = self.lock();
        let entry = usage.entry(plugin_id.to_string()).or_default();

        let total = entry.storage_bytes.saturating_add(additional_bytes);
        if total > self.config.max_storage_bytes {
            return Err(EngineError::StorageQuotaExceeded {
                plugin_id: plugin_id.to_string(),
                used: entry.storage_bytes,
                requested: additional_bytes,
                limit: self.config.max_storage_bytes,
            });
        }

        entry.storage_bytes = total;
        Ok(())
    }

    /// Return previously reserved storage
    pub fn release_storage(&self, plugin_id: &str, bytes: u64) {
        if let Some(entry) = self.lock().get_mut(plugin_id) {
            entry.storage_bytes = entry.storage_bytes.saturating_sub(bytes);
        }
    }

    pub fn max_storage_bytes(&self) -> u64 {
        self.config.max_storage_bytes
    }

    pub fn usage(&self, plugin_id: &str) -> RateLimitUsage {
        let mut usage = self.lock();
        match usage.get_mut(plugin_id) {
            Some(entry) => {
                entry.expire(Instant::now());
                RateLimitUsage {
                    calls_last_minute: entry.minute.len(),
                    calls_last_hour: entry.hour.len(),
                    in_flight: entry.in_flight.load(Ordering::Acquire),
                    storage_bytes: entry.storage_bytes,
                }
            }
            None => RateLimitUsage::default(),
        }
    }

    /// Forget all usage for a plugin (on unload)
    pub fn reset(&self, plugin_id: &str) {
        self.lock().remove(plugin_id);
    }
}
