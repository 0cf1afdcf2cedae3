//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from `QUOTE_GATEWAY_*`
//! environment variables. Unset or unparseable values fall back to
//! defaults; values that parse but make no sense are rejected.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::application::ports::ClientCredentials;
use crate::application::services::{BatchProcessorConfig, PoolConfig, SubscriptionLimits};
use crate::domain::batching::{AdaptiveBatchingConfig, FallbackPolicy};
use crate::domain::resilience::{BackoffConfig, CircuitBreakerConfig};
use crate::domain::streaming::{CapabilityType, FeedKey, ProviderName};

const PREFIX: &str = "QUOTE_GATEWAY_";

// =============================================================================
// Credentials
// =============================================================================

/// Upstream provider credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// One client API key accepted at the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyEntry {
    /// Key/token pair.
    pub credentials: ClientCredentials,
    /// Allowed capabilities; `None` means all.
    pub capabilities: Option<HashSet<CapabilityType>>,
}

// =============================================================================
// Sections
// =============================================================================

/// Listener and per-connection settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Client WebSocket port.
    pub ws_port: u16,
    /// Health, readiness and metrics port.
    pub health_port: u16,
    /// Outbound frames buffered per client.
    pub client_queue_capacity: usize,
    /// WebSocket ping interval towards clients.
    pub client_ping_interval: Duration,
    /// Grace period for tasks on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 8090,
            health_port: 8082,
            client_queue_capacity: 1024,
            client_ping_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Upstream WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering connection dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(20),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0,
        }
    }
}

impl WebSocketSettings {
    /// Reconnect schedule for upstream sessions.
    #[must_use]
    pub fn reconnect_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.reconnect_delay_initial,
            max_delay: self.reconnect_delay_max,
            multiplier: self.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

/// Upstream provider endpoints.
#[derive(Debug, Clone, Default)]
pub struct UpstreamSettings {
    /// `provider` or `provider.capability` to WebSocket URL.
    pub endpoints: BTreeMap<String, String>,
    /// Per-provider credentials sent after connecting.
    pub credentials: BTreeMap<ProviderName, Credentials>,
    /// Connection behaviour.
    pub websocket: WebSocketSettings,
}

impl UpstreamSettings {
    /// URL for a feed: a `provider.capability` entry wins over `provider`.
    #[must_use]
    pub fn endpoint_for(&self, feed: &FeedKey) -> Option<&str> {
        self.endpoints
            .get(&feed.rule_selector())
            .or_else(|| self.endpoints.get(&feed.provider))
            .map(String::as_str)
    }
}

/// Idle-client eviction.
#[derive(Debug, Clone, Copy)]
pub struct IdleSettings {
    /// Inactivity after which a client is evicted.
    pub timeout: Duration,
    /// How often the sweep runs.
    pub sweep_interval: Duration,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Replay window and request limits.
#[derive(Debug, Clone, Copy)]
pub struct RecoverySettings {
    /// Oldest request accepted.
    pub window: Duration,
    /// How long frames stay replayable.
    pub replay_retention: Duration,
    /// Frames held for replay.
    pub replay_max_frames: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(24 * 60 * 60),
            replay_retention: Duration::from_secs(600),
            replay_max_frames: 50_000,
        }
    }
}

// =============================================================================
// Gateway Config
// =============================================================================

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listeners.
    pub server: ServerSettings,
    /// Accepted client keys.
    pub api_keys: Vec<ApiKeyEntry>,
    /// Subscription limits and default provider.
    pub subscriptions: SubscriptionLimits,
    /// Upstream endpoints.
    pub upstream: UpstreamSettings,
    /// Pool timing.
    pub pool: PoolConfig,
    /// Batch pipeline.
    pub batch: BatchProcessorConfig,
    /// Idle eviction.
    pub idle: IdleSettings,
    /// Recovery.
    pub recovery: RecoverySettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if API keys are missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if API keys are missing or a value is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let raw_keys = env
            .raw("API_KEYS")
            .ok_or_else(|| ConfigError::MissingEnvVar(format!("{PREFIX}API_KEYS")))?;
        if raw_keys.trim().is_empty() {
            return Err(ConfigError::EmptyValue(format!("{PREFIX}API_KEYS")));
        }
        let api_keys = parse_api_keys(&raw_keys)?;

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            ws_port: env.parse("WS_PORT", server_defaults.ws_port),
            health_port: env.parse("HEALTH_PORT", server_defaults.health_port),
            client_queue_capacity: env
                .parse("CLIENT_QUEUE_CAPACITY", server_defaults.client_queue_capacity)
                .max(1),
            client_ping_interval: positive(
                "CLIENT_PING_INTERVAL_SECS",
                env.secs("CLIENT_PING_INTERVAL_SECS", server_defaults.client_ping_interval),
            )?,
            shutdown_timeout: env.secs("SHUTDOWN_TIMEOUT_SECS", server_defaults.shutdown_timeout),
        };

        let subscriptions = SubscriptionLimits {
            max_symbols_per_client: env.parse(
                "MAX_SYMBOLS_PER_CLIENT",
                SubscriptionLimits::default().max_symbols_per_client,
            ),
            default_provider: env
                .raw("DEFAULT_PROVIDER")
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| SubscriptionLimits::default().default_provider),
        };

        let ws_defaults = WebSocketSettings::default();
        let upstream = UpstreamSettings {
            endpoints: env
                .raw("UPSTREAMS")
                .map(|raw| parse_endpoints(&raw))
                .transpose()?
                .unwrap_or_default(),
            credentials: env
                .raw("UPSTREAM_CREDENTIALS")
                .map(|raw| parse_upstream_credentials(&raw))
                .transpose()?
                .unwrap_or_default(),
            websocket: WebSocketSettings {
                heartbeat_interval: positive(
                    "HEARTBEAT_INTERVAL_SECS",
                    env.secs("HEARTBEAT_INTERVAL_SECS", ws_defaults.heartbeat_interval),
                )?,
                heartbeat_timeout: env.secs("HEARTBEAT_TIMEOUT_SECS", ws_defaults.heartbeat_timeout),
                reconnect_delay_initial: env.millis(
                    "RECONNECT_DELAY_INITIAL_MS",
                    ws_defaults.reconnect_delay_initial,
                ),
                reconnect_delay_max: env
                    .secs("RECONNECT_DELAY_MAX_SECS", ws_defaults.reconnect_delay_max),
                reconnect_delay_multiplier: env.parse(
                    "RECONNECT_DELAY_MULTIPLIER",
                    ws_defaults.reconnect_delay_multiplier,
                ),
                max_reconnect_attempts: env
                    .parse("MAX_RECONNECT_ATTEMPTS", ws_defaults.max_reconnect_attempts),
            },
        };

        let pool_defaults = PoolConfig::default();
        let pool = PoolConfig {
            acquire_timeout: env.millis("POOL_ACQUIRE_TIMEOUT_MS", pool_defaults.acquire_timeout),
            poll_interval: env.millis("POOL_POLL_INTERVAL_MS", pool_defaults.poll_interval),
            probe_timeout: env.millis("HEALTH_PROBE_TIMEOUT_MS", pool_defaults.probe_timeout),
        };

        let batch = batch_config(&env)?;

        let idle_defaults = IdleSettings::default();
        let idle = IdleSettings {
            timeout: env.secs("CLIENT_IDLE_TIMEOUT_SECS", idle_defaults.timeout),
            sweep_interval: positive(
                "IDLE_SWEEP_INTERVAL_SECS",
                env.secs("IDLE_SWEEP_INTERVAL_SECS", idle_defaults.sweep_interval),
            )?,
        };

        let recovery_defaults = RecoverySettings::default();
        let recovery = RecoverySettings {
            window: env.millis("RECOVERY_WINDOW_MS", recovery_defaults.window),
            replay_retention: env
                .secs("REPLAY_RETENTION_SECS", recovery_defaults.replay_retention),
            replay_max_frames: env.parse("REPLAY_MAX_FRAMES", recovery_defaults.replay_max_frames),
        };

        Ok(Self {
            server,
            api_keys,
            subscriptions,
            upstream,
            pool,
            batch,
            idle,
            recovery,
        })
    }
}

fn batch_config<F>(env: &Env<F>) -> Result<BatchProcessorConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = BatchProcessorConfig::default();
    let adaptive_defaults = AdaptiveBatchingConfig::default();

    let adaptive = AdaptiveBatchingConfig {
        enabled: env.flag("DYNAMIC_BATCHING", adaptive_defaults.enabled),
        initial_interval: env.millis("BATCH_INTERVAL_MS", adaptive_defaults.initial_interval),
        min_interval: positive(
            "MIN_INTERVAL_MS",
            env.millis("MIN_INTERVAL_MS", adaptive_defaults.min_interval),
        )?,
        max_interval: env.millis("MAX_INTERVAL_MS", adaptive_defaults.max_interval),
        high_load_threshold: env.parse("HIGH_LOAD_THRESHOLD", adaptive_defaults.high_load_threshold),
        low_load_threshold: env.parse("LOW_LOAD_THRESHOLD", adaptive_defaults.low_load_threshold),
        step: env.millis("ADJUSTMENT_STEP_MS", adaptive_defaults.step),
        adjustment_period: env.secs("ADJUSTMENT_PERIOD_SECS", adaptive_defaults.adjustment_period),
        sample_window: env
            .parse("LOAD_SAMPLE_WINDOW", adaptive_defaults.sample_window)
            .max(1),
    };
    if adaptive.min_interval > adaptive.max_interval {
        return Err(ConfigError::Invalid {
            key: format!("{PREFIX}MIN_INTERVAL_MS"),
            reason: "must not exceed MAX_INTERVAL_MS".to_string(),
        });
    }
    if adaptive.initial_interval.is_zero() || adaptive.adjustment_period.is_zero() {
        return Err(ConfigError::Invalid {
            key: format!("{PREFIX}BATCH_INTERVAL_MS"),
            reason: "intervals must be positive".to_string(),
        });
    }

    let threshold_pct: u32 = env.parse("BREAKER_FAILURE_THRESHOLD_PCT", 50);
    let threshold_pct = u8::try_from(threshold_pct)
        .ok()
        .filter(|pct| *pct <= 100)
        .ok_or_else(|| ConfigError::Invalid {
            key: format!("{PREFIX}BREAKER_FAILURE_THRESHOLD_PCT"),
            reason: format!("{threshold_pct} is outside 0..=100"),
        })?;
    let breaker_defaults = CircuitBreakerConfig::default();
    let breaker = CircuitBreakerConfig {
        sliding_window_size: env
            .parse("BREAKER_WINDOW_SIZE", breaker_defaults.sliding_window_size)
            .max(1),
        minimum_calls: env
            .parse("BREAKER_MINIMUM_CALLS", breaker_defaults.minimum_calls)
            .max(1),
        ..CircuitBreakerConfig::from_percent(
            threshold_pct,
            env.millis("BREAKER_RESET_TIMEOUT_MS", breaker_defaults.reset_timeout),
        )
    };

    let fallback_defaults = FallbackPolicy::default();
    let fallback = FallbackPolicy {
        priority_symbols: env
            .raw("PRIORITY_SYMBOLS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        partial_recovery_limit: env.parse(
            "PARTIAL_RECOVERY_LIMIT",
            fallback_defaults.partial_recovery_limit,
        ),
        full_reprocess_limit: env.parse("FULL_REPROCESS_LIMIT", fallback_defaults.full_reprocess_limit),
    };

    Ok(BatchProcessorConfig {
        max_batch_events: env.parse("MAX_BATCH_EVENTS", defaults.max_batch_events).max(1),
        adaptive,
        max_retry_attempts: env.parse("MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts).max(1),
        retry_base_delay: env.millis("RETRY_BASE_DELAY_MS", defaults.retry_base_delay),
        breaker,
        transform_timeout: env.millis("TRANSFORM_TIMEOUT_MS", defaults.transform_timeout),
        cache_ttl: env.secs("CACHE_TTL_SECS", defaults.cache_ttl),
        fallback,
    })
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable parsed but is not acceptable.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

// =============================================================================
// Parsing
// =============================================================================

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{PREFIX}{name}"))
    }

    fn parse<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        self.raw(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        self.raw(name)
            .map_or(default, |v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }

    fn secs(&self, name: &str, default: Duration) -> Duration {
        self.raw(name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, name: &str, default: Duration) -> Duration {
        self.raw(name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

/// Timer periods must be non-zero.
fn positive(name: &str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(invalid(name, "must be greater than zero"));
    }
    Ok(value)
}

fn invalid(name: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: format!("{PREFIX}{name}"),
        reason: reason.into(),
    }
}

/// `key:token[:cap|cap...]` entries, comma separated; `*` allows everything.
fn parse_api_keys(raw: &str) -> Result<Vec<ApiKeyEntry>, ConfigError> {
    let mut entries = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = item.splitn(3, ':');
        let key = parts.next().unwrap_or_default().trim();
        let token = parts.next().unwrap_or_default().trim();
        if key.is_empty() || token.is_empty() {
            return Err(invalid("API_KEYS", "entries must be key:token[:capabilities]"));
        }

        let capabilities = match parts.next().map(str::trim) {
            None | Some("" | "*") => None,
            Some(caps) => {
                let parsed = caps
                    .split('|')
                    .map(|c| {
                        CapabilityType::from_str_case_insensitive(c)
                            .ok_or_else(|| invalid("API_KEYS", format!("unknown capability '{c}'")))
                    })
                    .collect::<Result<HashSet<_>, _>>()?;
                Some(parsed)
            }
        };

        entries.push(ApiKeyEntry {
            credentials: ClientCredentials::new(key, token),
            capabilities,
        });
    }

    if entries.is_empty() {
        return Err(ConfigError::EmptyValue(format!("{PREFIX}API_KEYS")));
    }
    Ok(entries)
}

/// `provider[.capability]=url` entries, comma separated.
fn parse_endpoints(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let (name, url) = item
                .split_once('=')
                .ok_or_else(|| invalid("UPSTREAMS", "entries must be provider=url"))?;
            let name = name.trim().to_lowercase();
            let url = url.trim();
            if name.is_empty() || !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(invalid("UPSTREAMS", format!("bad entry '{item}'")));
            }
            Ok((name, url.to_string()))
        })
        .collect()
}

/// `provider=key:secret` entries, comma separated.
fn parse_upstream_credentials(
    raw: &str,
) -> Result<BTreeMap<ProviderName, Credentials>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let parsed = item.split_once('=').and_then(|(provider, pair)| {
                let (key, secret) = pair.split_once(':')?;
                Some((provider.trim().to_lowercase(), key.trim(), secret.trim()))
            });
            match parsed {
                Some((provider, key, secret))
                    if !provider.is_empty() && !key.is_empty() && !secret.is_empty() =>
                {
                    Ok((provider, Credentials::new(key.to_string(), secret.to_string())))
                }
                _ => Err(invalid("UPSTREAM_CREDENTIALS", "entries must be provider=key:secret")),
            }
        })
        .collect()
}
