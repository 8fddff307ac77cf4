//! Backend registry and circuit-breaker fallback routing.
//!
//! [`BackendRegistry`] holds the closed set of backend constructors and hands
//! out cached singletons or fresh instances.  [`BackendRouter`] walks the
//! configured fallback chain and returns the first healthy backend,
//! implementing a per-backend circuit breaker:
//!
//! - consecutive failures are tracked per backend
//! - the circuit opens after `failure_threshold` failures
//! - an open circuit is skipped until `cooldown_seconds` elapses, after which
//!   exactly one half-open probe decides the outcome
//! - successful health probes are cached for `health_cache_ttl_seconds`
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleetgate::{Backend, BackendRegistry, BackendRouter, GatewayConfig};
//!
//! # async {
//! let config = GatewayConfig::default();
//! let registry = Arc::new(BackendRegistry::new(config.clone()));
//! let router = BackendRouter::new(registry, &config);
//!
//! let backend = router.pick_healthy_backend().await.unwrap();
//! println!("serving via {}", backend.name());
//! # };
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::fleetgate::backend::{Backend, BackendHealth};
use crate::fleetgate::backends::{
    AnthropicBackend, ClaudeCliBackend, OpenAICompatBackend, ProxyBackend,
};
use crate::fleetgate::config::{BackendSettings, GatewayConfig};
use crate::fleetgate::error::GatewayError;

/// Closed set of backend names the registry can construct.
pub const KNOWN_BACKENDS: [&str; 4] = ["openai-compat", "anthropic", "claude-cli", "proxy"];

/// Capability flags reported by [`BackendRegistry::list`].
#[derive(Debug, Clone)]
pub struct BackendCapability {
    /// Backend name.
    pub name: String,
    /// Whether the backend supports native tool calling.
    pub supports_native_tools: bool,
}

/// Registry of backend constructors with a singleton cache.
pub struct BackendRegistry {
    config: GatewayConfig,
    singletons: Mutex<HashMap<String, Arc<dyn Backend>>>,
}

impl BackendRegistry {
    /// Create a registry over the given configuration.
    pub fn new(config: GatewayConfig) -> Self {
        BackendRegistry {
            config,
            singletons: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `name` is a member of the closed backend set.
    pub fn is_known(name: &str) -> bool {
        KNOWN_BACKENDS.contains(&name)
    }

    fn settings_for(&self, name: &str) -> Option<&BackendSettings> {
        match name {
            "openai-compat" => Some(&self.config.openai_compat),
            "anthropic" => Some(&self.config.anthropic),
            "claude-cli" => Some(&self.config.claude_cli),
            "proxy" => Some(&self.config.proxy),
            _ => None,
        }
    }

    fn construct(
        &self,
        name: &str,
        settings: &BackendSettings,
    ) -> Result<Arc<dyn Backend>, GatewayError> {
        match name {
            "openai-compat" => Ok(Arc::new(OpenAICompatBackend::new(
                settings.base_url.clone(),
                settings.model.clone(),
            ))),
            "anthropic" => Ok(Arc::new(AnthropicBackend::new_with_base_url(
                settings.api_key.clone(),
                settings.model.clone(),
                settings.base_url.clone(),
            ))),
            "claude-cli" => Ok(Arc::new(ClaudeCliBackend::new(settings.model.clone()))),
            "proxy" => Ok(Arc::new(ProxyBackend::new(
                settings.base_url.clone(),
                settings.model.clone(),
                settings.api_key.clone(),
            ))),
            other => Err(GatewayError::Configuration(format!(
                "Unknown backend: {}. Available: {}",
                other,
                KNOWN_BACKENDS.join(", ")
            ))),
        }
    }

    /// Get or create the cached singleton for `name`.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn Backend>, GatewayError> {
        let mut cache = self.singletons.lock().await;
        if let Some(backend) = cache.get(name) {
            return Ok(Arc::clone(backend));
        }
        let settings = self
            .settings_for(name)
            .cloned()
            .ok_or_else(|| {
                GatewayError::Configuration(format!(
                    "Unknown backend: {}. Available: {}",
                    name,
                    KNOWN_BACKENDS.join(", ")
                ))
            })?;
        let backend = self.construct(name, &settings)?;
        cache.insert(name.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    /// Always construct a fresh instance with the supplied settings.
    pub fn create(
        &self,
        name: &str,
        overrides: BackendSettings,
    ) -> Result<Arc<dyn Backend>, GatewayError> {
        if !Self::is_known(name) {
            return Err(GatewayError::Configuration(format!(
                "Unknown backend: {}. Available: {}",
                name,
                KNOWN_BACKENDS.join(", ")
            )));
        }
        self.construct(name, &overrides)
    }

    /// Insert or replace a backend instance under `name`.
    ///
    /// Intended for wiring in pre-built instances (and mocks in tests);
    /// the router resolves names through the singleton cache, so an inserted
    /// backend takes precedence over the constructor table.
    pub async fn register(&self, name: impl Into<String>, backend: Arc<dyn Backend>) {
        self.singletons.lock().await.insert(name.into(), backend);
    }

    /// List each known backend with its capability flags.
    pub async fn list(&self) -> Vec<BackendCapability> {
        let mut result = Vec::with_capacity(KNOWN_BACKENDS.len());
        for name in KNOWN_BACKENDS.iter() {
            let supports = match self.get(name).await {
                Ok(backend) => backend.supports_native_tools(),
                Err(_) => false,
            };
            result.push(BackendCapability {
                name: (*name).to_string(),
                supports_native_tools: supports,
            });
        }
        result
    }
}

/// Tracks backend health state for the circuit breaker.
#[derive(Debug, Clone, Default)]
struct BackendState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    circuit_open: bool,
}

/// Cached health probe result.
struct CachedHealth {
    health: BackendHealth,
    cached_at: Instant,
}

/// Point-in-time view of one backend's circuit, for admin endpoints.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Whether the circuit is currently open.
    pub circuit_open: bool,
    /// Seconds until a half-open probe is allowed (0 when closed).
    pub cooldown_remaining: f64,
}

/// Walks the fallback chain and returns the first healthy backend.
pub struct BackendRouter {
    registry: Arc<BackendRegistry>,
    chain: Vec<String>,
    failure_threshold: u32,
    cooldown: Duration,
    health_ttl: Duration,
    states: Mutex<HashMap<String, BackendState>>,
    health_cache: Mutex<HashMap<String, CachedHealth>>,
    last_healthy: Mutex<Option<String>>,
}

impl BackendRouter {
    /// Create a router over `registry` using the chain and thresholds in
    /// `config`.
    pub fn new(registry: Arc<BackendRegistry>, config: &GatewayConfig) -> Self {
        BackendRouter {
            registry,
            chain: config.backend_chain.clone(),
            failure_threshold: config.failure_threshold,
            cooldown: Duration::from_secs_f64(config.cooldown_seconds.max(0.0)),
            health_ttl: Duration::from_secs_f64(config.health_cache_ttl_seconds.max(0.0)),
            states: Mutex::new(HashMap::new()),
            health_cache: Mutex::new(HashMap::new()),
            last_healthy: Mutex::new(None),
        }
    }

    /// Get the first healthy backend from the priority chain.
    ///
    /// Implements the circuit-breaker walk: open circuits are skipped until
    /// their cooldown expires (half-open), cached healthy probes short-circuit
    /// within the TTL, and failures are recorded against each backend.  Fails
    /// with [`GatewayError::NoHealthyBackend`] carrying the concatenated
    /// per-backend error summaries when the chain is exhausted.
    pub async fn pick_healthy_backend(&self) -> Result<Arc<dyn Backend>, GatewayError> {
        let now = Instant::now();
        let mut errors: Vec<String> = Vec::new();

        for name in &self.chain {
            {
                let states = self.states.lock().await;
                if let Some(state) = states.get(name) {
                    if state.circuit_open {
                        let since_failure = state
                            .last_failure
                            .map(|t| now.duration_since(t))
                            .unwrap_or(self.cooldown);
                        if since_failure < self.cooldown {
                            if log::log_enabled!(log::Level::Debug) {
                                log::debug!("Backend {}: circuit open, skipping", name);
                            }
                            continue;
                        }
                        // Cooldown expired: half-open, the probe below decides.
                        if log::log_enabled!(log::Level::Info) {
                            log::info!("Backend {}: cooldown expired, retrying (half-open)", name);
                        }
                    }
                }
            }

            // Fresh cached health short-circuits the probe.
            {
                let cache = self.health_cache.lock().await;
                if let Some(cached) = cache.get(name) {
                    if now.duration_since(cached.cached_at) < self.health_ttl && cached.health.ok {
                        if log::log_enabled!(log::Level::Debug) {
                            log::debug!("Backend {}: healthy (cached)", name);
                        }
                        drop(cache);
                        self.note_healthy(name).await;
                        return self.registry.get(name).await;
                    }
                }
            }

            let backend = match self.registry.get(name).await {
                Ok(b) => b,
                Err(e) => {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("Unknown backend in chain: {}", name);
                    }
                    errors.push(format!("{}: {}", name, e));
                    continue;
                }
            };

            let health = backend.health_check().await;
            let health_ok = health.ok;
            let health_error = health.error().map(|s| s.to_string());
            self.health_cache.lock().await.insert(
                name.clone(),
                CachedHealth {
                    health,
                    cached_at: Instant::now(),
                },
            );

            if health_ok {
                let mut states = self.states.lock().await;
                let state = states.entry(name.clone()).or_default();
                state.circuit_open = false;
                state.consecutive_failures = 0;
                drop(states);
                self.note_healthy(name).await;
                return Ok(backend);
            }

            let error_msg = health_error.unwrap_or_else(|| "Health check failed".to_string());
            errors.push(format!("{}: {}", name, error_msg));
            self.record_failure(name).await;
        }

        Err(GatewayError::NoHealthyBackend(errors.join(", ")))
    }

    async fn note_healthy(&self, name: &str) {
        let mut last = self.last_healthy.lock().await;
        if last.as_deref() != Some(name) {
            if log::log_enabled!(log::Level::Info) {
                log::info!("Backend switch: {:?} -> {}", last.as_deref(), name);
            }
            *last = Some(name.to_string());
        }
    }

    /// Record a failure against `name` and open the circuit at the threshold.
    ///
    /// Also called by the driver when a stream ends in a transport or
    /// provider error, so request failures count toward the circuit.
    pub async fn record_failure(&self, name: &str) {
        let mut states = self.states.lock().await;
        let state = states.entry(name.to_string()).or_default();
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());
        if state.consecutive_failures >= self.failure_threshold {
            state.circuit_open = true;
            if log::log_enabled!(log::Level::Warn) {
                log::warn!(
                    "Backend {}: circuit OPEN after {} failures",
                    name,
                    state.consecutive_failures
                );
            }
        }
    }

    /// Clear the health cache for one backend, or for all when `None`.
    pub async fn invalidate(&self, name: Option<&str>) {
        let mut cache = self.health_cache.lock().await;
        match name {
            Some(n) => {
                cache.remove(n);
                if log::log_enabled!(log::Level::Info) {
                    log::info!("Health cache invalidated for: {}", n);
                }
            }
            None => {
                cache.clear();
                if log::log_enabled!(log::Level::Info) {
                    log::info!("Health cache invalidated for all backends");
                }
            }
        }
    }

    /// Current circuit states for every backend in the chain.
    pub async fn circuit_states(&self) -> HashMap<String, CircuitSnapshot> {
        let states = self.states.lock().await;
        let now = Instant::now();
        self.chain
            .iter()
            .map(|name| {
                let state = states.get(name).cloned().unwrap_or_default();
                let cooldown_remaining = if state.circuit_open {
                    let elapsed = state
                        .last_failure
                        .map(|t| now.duration_since(t))
                        .unwrap_or(self.cooldown);
                    (self.cooldown.as_secs_f64() - elapsed.as_secs_f64()).max(0.0)
                } else {
                    0.0
                };
                (
                    name.clone(),
                    CircuitSnapshot {
                        consecutive_failures: state.consecutive_failures,
                        circuit_open: state.circuit_open,
                        cooldown_remaining,
                    },
                )
            })
            .collect()
    }

    /// Name of the last backend that served a request, if any.
    pub async fn last_healthy_backend(&self) -> Option<String> {
        self.last_healthy.lock().await.clone()
    }

    /// The registry this router resolves backends through.
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleetgate::backend::{ChatConfig, EventStream, Message};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlakyBackend {
        name: String,
        healthy: AtomicBool,
        probes: AtomicUsize,
    }

    impl FlakyBackend {
        fn new(name: &str, healthy: bool) -> Arc<Self> {
            Arc::new(FlakyBackend {
                name: name.to_string(),
                healthy: AtomicBool::new(healthy),
                probes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn supports_native_tools(&self) -> bool {
            true
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn stream_chat(&self, _messages: Vec<Message>, _config: ChatConfig) -> EventStream {
            Box::pin(futures_util::stream::empty())
        }

        async fn health_check(&self) -> BackendHealth {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                BackendHealth::healthy(self.name.clone())
            } else {
                BackendHealth::unhealthy(self.name.clone(), "connect refused")
            }
        }
    }

    fn test_config(chain: &[&str]) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.backend_chain = chain.iter().map(|s| s.to_string()).collect();
        config
    }

    #[tokio::test]
    async fn test_empty_chain_fails_immediately() {
        let config = test_config(&[]);
        let registry = Arc::new(BackendRegistry::new(config.clone()));
        let router = BackendRouter::new(registry, &config);

        match router.pick_healthy_backend().await {
            Err(GatewayError::NoHealthyBackend(_)) => {}
            other => panic!("expected NoHealthyBackend, got {:?}", other.map(|b| b.name().to_string())),
        }
    }

    #[tokio::test]
    async fn test_unknown_backend_name_is_configuration_error() {
        let config = GatewayConfig::default();
        let registry = BackendRegistry::new(config);
        match registry.get("bogus").await {
            Err(GatewayError::Configuration(msg)) => assert!(msg.contains("bogus")),
            other => panic!("expected Configuration error, got {:?}", other.map(|b| b.name().to_string())),
        }
    }

    #[tokio::test]
    async fn test_primary_down_secondary_serves_and_caches() {
        let config = test_config(&["primary", "secondary"]);
        let registry = Arc::new(BackendRegistry::new(config.clone()));
        let primary = FlakyBackend::new("primary", false);
        let secondary = FlakyBackend::new("secondary", true);
        registry.register("primary", primary.clone()).await;
        registry.register("secondary", secondary.clone()).await;

        let router = BackendRouter::new(Arc::clone(&registry), &config);

        let picked = router.pick_healthy_backend().await.unwrap();
        assert_eq!(picked.name(), "secondary");

        let states = router.circuit_states().await;
        assert_eq!(states["primary"].consecutive_failures, 1);
        assert!(!states["primary"].circuit_open);

        // Second pick within the TTL serves secondary from cache: primary was
        // probed again (its failure is not cached as healthy) but secondary's
        // probe count stays at one.
        let picked = router.pick_healthy_backend().await.unwrap();
        assert_eq!(picked.name(), "secondary");
        assert_eq!(secondary.probes.load(Ordering::SeqCst), 1);
        assert_eq!(router.last_healthy_backend().await.as_deref(), Some("secondary"));
    }

    #[tokio::test]
    async fn test_circuit_opens_at_threshold_and_lists_all_errors() {
        let mut config = test_config(&["primary", "secondary"]);
        config.failure_threshold = 3;
        let registry = Arc::new(BackendRegistry::new(config.clone()));
        registry.register("primary", FlakyBackend::new("primary", false)).await;
        registry.register("secondary", FlakyBackend::new("secondary", false)).await;

        let router = BackendRouter::new(Arc::clone(&registry), &config);

        for _ in 0..3 {
            let err = router.pick_healthy_backend().await.unwrap_err();
            match err {
                GatewayError::NoHealthyBackend(summary) => {
                    assert!(summary.contains("primary"));
                    assert!(summary.contains("secondary"));
                }
                other => panic!("unexpected error: {}", other),
            }
        }

        let states = router.circuit_states().await;
        assert!(states["primary"].circuit_open);
        assert!(states["secondary"].circuit_open);
        assert_eq!(states["primary"].consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_circuit_on_recovery() {
        let mut config = test_config(&["primary"]);
        config.failure_threshold = 1;
        config.cooldown_seconds = 0.0; // Cooldown elapses immediately.
        config.health_cache_ttl_seconds = 0.0; // No healthy-cache short-circuit.
        let registry = Arc::new(BackendRegistry::new(config.clone()));
        let primary = FlakyBackend::new("primary", false);
        registry.register("primary", primary.clone()).await;

        let router = BackendRouter::new(Arc::clone(&registry), &config);

        router.pick_healthy_backend().await.unwrap_err();
        assert!(router.circuit_states().await["primary"].circuit_open);

        // Backend recovers; the half-open probe should close the circuit.
        primary.healthy.store(true, Ordering::SeqCst);
        let picked = router.pick_healthy_backend().await.unwrap();
        assert_eq!(picked.name(), "primary");

        let states = router.circuit_states().await;
        assert!(!states["primary"].circuit_open);
        assert_eq!(states["primary"].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reprobe() {
        let config = test_config(&["primary"]);
        let registry = Arc::new(BackendRegistry::new(config.clone()));
        let primary = FlakyBackend::new("primary", true);
        registry.register("primary", primary.clone()).await;

        let router = BackendRouter::new(Arc::clone(&registry), &config);

        router.pick_healthy_backend().await.unwrap();
        router.pick_healthy_backend().await.unwrap();
        assert_eq!(primary.probes.load(Ordering::SeqCst), 1);

        router.invalidate(Some("primary")).await;
        router.pick_healthy_backend().await.unwrap();
        assert_eq!(primary.probes.load(Ordering::SeqCst), 2);
    }
}
