use serde::Deserialize;

/// Root application configuration. Loaded from environment variables with
/// the prefix `LEDGERPILOT__` and overridable from the CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub deployment: DeploymentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Opaque bearer token checked on every control-plane command.
    #[serde(default = "default_auth_token")]
    pub auth_token: String,
    #[serde(default = "default_push_interval_secs")]
    pub push_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_collect_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,
    /// Absolute error-rate ceiling for the anomaly check, independent of
    /// the health threshold table.
    #[serde(default = "default_error_rate_ceiling")]
    pub error_rate_ceiling: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_status_ttl_secs")]
    pub status_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemediationConfig {
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    /// Maximum worker-pool delta a single scale action may request.
    #[serde(default = "default_max_scale_step")]
    pub max_scale_step: u32,
    /// Rolling window (actions) for the auto-fix success-rate gauge.
    #[serde(default = "default_success_window")]
    pub success_window: usize,
    /// Latency floor (ms) below which the proactive trend check stays quiet.
    #[serde(default = "default_trend_latency_floor_ms")]
    pub trend_latency_floor_ms: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntegrityConfig {
    #[serde(default = "default_hourly_interval_secs")]
    pub hourly_interval_secs: u64,
    #[serde(default = "default_daily_interval_secs")]
    pub daily_interval_secs: u64,
    #[serde(default = "default_freeze_ttl_secs")]
    pub freeze_ttl_secs: i64,
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapacityConfig {
    #[serde(default = "default_capacity_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_notice_pct")]
    pub notice_pct: f64,
    #[serde(default = "default_prewarm_pct")]
    pub prewarm_pct: f64,
    #[serde(default = "default_page_pct")]
    pub page_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    /// Canary rollout stages, percent of traffic.
    #[serde(default = "default_rollout_stages")]
    pub rollout_stages: Vec<u8>,
    /// Minimum healthy dwell before promoting to the next stage.
    #[serde(default = "default_dwell_secs")]
    pub dwell_secs: i64,
    /// Token required to arm destructive kill switches.
    #[serde(default = "default_confirmation_token")]
    pub confirmation_token: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("LEDGERPILOT")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

// Default functions
fn default_node_id() -> String {
    "control-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_auth_token() -> String {
    "dev-token".to_string()
}
fn default_push_interval_secs() -> u64 {
    5
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_collect_interval_secs() -> u64 {
    30
}
fn default_ring_capacity() -> usize {
    100
}
fn default_source_timeout_ms() -> u64 {
    5000
}
fn default_error_rate_ceiling() -> f64 {
    0.25
}
fn default_health_interval_secs() -> u64 {
    60
}
fn default_status_ttl_secs() -> u64 {
    120
}
fn default_action_timeout_ms() -> u64 {
    30_000
}
fn default_max_scale_step() -> u32 {
    4
}
fn default_success_window() -> usize {
    100
}
fn default_trend_latency_floor_ms() -> f64 {
    200.0
}
fn default_hourly_interval_secs() -> u64 {
    3600
}
fn default_daily_interval_secs() -> u64 {
    86_400
}
fn default_freeze_ttl_secs() -> i64 {
    14_400
}
fn default_check_timeout_ms() -> u64 {
    60_000
}
fn default_capacity_interval_secs() -> u64 {
    60
}
fn default_notice_pct() -> f64 {
    80.0
}
fn default_prewarm_pct() -> f64 {
    90.0
}
fn default_page_pct() -> f64 {
    95.0
}
fn default_rollout_stages() -> Vec<u8> {
    vec![1, 10, 50, 100]
}
fn default_dwell_secs() -> i64 {
    300
}
fn default_confirmation_token() -> String {
    "CONFIRM-STOP".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            collector: CollectorConfig::default(),
            health: HealthConfig::default(),
            remediation: RemediationConfig::default(),
            integrity: IntegrityConfig::default(),
            capacity: CapacityConfig::default(),
            deployment: DeploymentConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            auth_token: default_auth_token(),
            push_interval_secs: default_push_interval_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_collect_interval_secs(),
            ring_capacity: default_ring_capacity(),
            source_timeout_ms: default_source_timeout_ms(),
            error_rate_ceiling: default_error_rate_ceiling(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            status_ttl_secs: default_status_ttl_secs(),
        }
    }
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            action_timeout_ms: default_action_timeout_ms(),
            max_scale_step: default_max_scale_step(),
            success_window: default_success_window(),
            trend_latency_floor_ms: default_trend_latency_floor_ms(),
        }
    }
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            hourly_interval_secs: default_hourly_interval_secs(),
            daily_interval_secs: default_daily_interval_secs(),
            freeze_ttl_secs: default_freeze_ttl_secs(),
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_capacity_interval_secs(),
            notice_pct: default_notice_pct(),
            prewarm_pct: default_prewarm_pct(),
            page_pct: default_page_pct(),
        }
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            rollout_stages: default_rollout_stages(),
            dwell_secs: default_dwell_secs(),
            confirmation_token: default_confirmation_token(),
        }
    }
}
