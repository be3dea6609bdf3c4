//! Redis-backed protection store.
//!
//! Every compound operation is a server-side Lua script, so concurrent
//! instances sharing one Redis see the same linearizable outcome. Scripts take
//! the caller's clock reading as an argument; instances are expected to run
//! with reasonably synchronized clocks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::{scripts, strip_pattern, ProtectionRecord, ProtectionStore, RecordUpdate, Updated};
use crate::clock::{millis_of, Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::key::ProtectionKey;
use crate::ratelimit::{Algorithm, RateLimitDecision, WindowRequest};

const SCAN_BATCH: usize = 100;

/// Connection and timing settings for [`DistributedStore`].
#[derive(Debug, Clone)]
pub struct DistributedStoreConfig {
    /// Redis connection URL
    pub url: String,
    /// Extra physical retention beyond a record's logical expiry
    pub ttl_buffer: Duration,
    /// Upper bound on a single store call
    pub command_timeout: Duration,
    /// Upper bound on establishing the connection
    pub connect_timeout: Duration,
}

impl Default for DistributedStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            ttl_buffer: Duration::from_secs(5),
            command_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Protection store shared across instances through Redis.
#[derive(Clone)]
pub struct DistributedStore {
    connection: ConnectionManager,
    config: DistributedStoreConfig,
    clock: Arc<dyn Clock>,
    get_or_create: Arc<Script>,
    compare_and_update: Arc<Script>,
    exists_live: Arc<Script>,
    get_live: Arc<Script>,
    windows: Arc<HashMap<Algorithm, Script>>,
}

impl fmt::Debug for DistributedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DistributedStore {
    /// Connect with default settings.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        Self::connect_with_config(DistributedStoreConfig {
            url: url.to_string(),
            ..Default::default()
        })
        .await
    }

    /// Connect with explicit settings on the system clock.
    pub async fn connect_with_config(config: DistributedStoreConfig) -> StoreResult<Self> {
        Self::connect_with_clock(config, Arc::new(SystemClock::new())).await
    }

    /// Connect with explicit settings and clock.
    pub async fn connect_with_clock(
        config: DistributedStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(config.connect_timeout.as_millis() as u64))??;

        let windows = Algorithm::all()
            .into_iter()
            .map(|algorithm| (algorithm, Script::new(algorithm.strategy().script())))
            .collect();

        info!(url = %config.url, "Connected to distributed store");

        Ok(Self {
            connection,
            clock,
            get_or_create: Arc::new(Script::new(scripts::GET_OR_CREATE)),
            compare_and_update: Arc::new(Script::new(scripts::COMPARE_AND_UPDATE)),
            exists_live: Arc::new(Script::new(scripts::EXISTS_LIVE)),
            get_live: Arc::new(Script::new(scripts::GET_LIVE)),
            windows: Arc::new(windows),
            config,
        })
    }

    pub fn config(&self) -> &DistributedStoreConfig {
        &self.config
    }

    /// Bound a store call by the command timeout.
    async fn bounded<T, F>(&self, call: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, call).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(
                self.config.command_timeout.as_millis() as u64,
            )),
        }
    }

    fn physical_ttl_ms(&self, logical_ms: u64) -> u64 {
        logical_ms
            .saturating_add(millis_of(self.config.ttl_buffer))
            .min(i64::MAX as u64)
    }
}

#[async_trait]
impl ProtectionStore for DistributedStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get_or_create(
        &self,
        key: &ProtectionKey,
        candidate: ProtectionRecord,
        ttl: Duration,
    ) -> StoreResult<(ProtectionRecord, bool)> {
        let encoded = serde_json::to_string(&candidate)?;
        let mut invocation = self.get_or_create.prepare_invoke();
        invocation
            .key(key.as_str())
            .arg(encoded)
            .arg(self.physical_ttl_ms(millis_of(ttl)))
            .arg(self.clock.now_millis());

        let mut conn = self.connection.clone();
        let (created, json): (i64, String) =
            self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok((serde_json::from_str(&json)?, created == 1))
    }

    async fn compare_and_update(
        &self,
        key: &ProtectionKey,
        update: &RecordUpdate,
    ) -> StoreResult<Option<Updated>> {
        let encoded = serde_json::to_string(update)?;
        let mut invocation = self.compare_and_update.prepare_invoke();
        invocation
            .key(key.as_str())
            .arg(encoded)
            .arg(self.clock.now_millis())
            .arg(millis_of(self.config.ttl_buffer));

        let mut conn = self.connection.clone();
        let reply: Option<(i64, String)> = self.bounded(invocation.invoke_async(&mut conn)).await?;
        match reply {
            Some((applied, json)) => Ok(Some(Updated {
                record: serde_json::from_str(&json)?,
                applied: applied == 1,
            })),
            None => Ok(None),
        }
    }

    async fn get(&self, key: &ProtectionKey) -> StoreResult<Option<ProtectionRecord>> {
        let mut invocation = self.get_live.prepare_invoke();
        invocation.key(key.as_str()).arg(self.clock.now_millis());

        let mut conn = self.connection.clone();
        let reply: Option<String> = self.bounded(invocation.invoke_async(&mut conn)).await?;
        match reply {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &ProtectionKey) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = self
            .bounded(redis::cmd("DEL").arg(key.as_str()).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &ProtectionKey) -> StoreResult<bool> {
        let mut invocation = self.exists_live.prepare_invoke();
        invocation.key(key.as_str()).arg(self.clock.now_millis());

        let mut conn = self.connection.clone();
        let present: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(present == 1)
    }

    async fn count_by_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let pattern = format!("{}*", strip_pattern(prefix));
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut total = 0;

        // Physically present keys; records past logical expiry but within
        // the retention buffer are included.
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            total += keys.len();
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, count = total, "Counted keys");
        Ok(total)
    }

    async fn evaluate_window(
        &self,
        key: &ProtectionKey,
        request: &WindowRequest,
    ) -> StoreResult<RateLimitDecision> {
        let strategy = request.algorithm.strategy();
        let script = self.windows.get(&request.algorithm).ok_or_else(|| {
            StoreError::Unavailable(format!("no script loaded for {}", request.algorithm))
        })?;

        let mut invocation = script.prepare_invoke();
        invocation
            .key(strategy.state_key(key, request))
            .arg(request.now_ms)
            .arg(request.window_ms)
            .arg(request.permits)
            .arg(request.capacity)
            .arg(request.rate)
            .arg(request.member.as_str())
            .arg(self.physical_ttl_ms(strategy.state_ttl_ms(request)));

        let mut conn = self.connection.clone();
        let (allowed, remaining, reset_at_ms, retry_after_ms): (i64, i64, i64, i64) =
            self.bounded(invocation.invoke_async(&mut conn)).await?;

        Ok(RateLimitDecision {
            allowed: allowed == 1,
            limit: request.permits,
            remaining: remaining.max(0) as u64,
            reset_at_ms,
            retry_after_ms: retry_after_ms.max(0) as u64,
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: String = self.bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }
}
