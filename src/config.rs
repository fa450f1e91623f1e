//! Engine-wide configuration.
//!
//! Values are resolved once at startup and handed to components as
//! already-constructed structs (`SupervisorConfig`, `RetryPolicy`) —
//! nothing downstream reads the environment itself, mirroring how
//! `everruns-worker`'s `main` resolves `DATABASE_URL` up front and
//! passes a connected pool down rather than letting deeper code reach
//! for `std::env::var`.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::HitStrategy;
use crate::reliability::RetryPolicy;
use crate::supervisor::SupervisorConfig;

/// Single source of truth for the engine's runtime tunables.
///
/// Loaded with [`EngineConfig::load`], which layers environment
/// variables (optionally from a `.env` file) over these defaults using
/// the `config` crate. Every field has a default so a bare environment
/// with no overrides still produces a usable engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Postgres connection string for `PostgresPersistence`. Left
    /// unset, the engine runs against `InMemoryPersistence` instead.
    pub database_url: Option<String>,

    /// Address the admin HTTP surface binds to.
    pub http_bind_addr: SocketAddr,

    /// OTLP gRPC endpoint for trace export (e.g. `http://localhost:4317`).
    /// Left unset, the engine logs to the console only.
    pub otlp_endpoint: Option<String>,

    pub max_concurrent_workflows: usize,
    pub max_concurrent_calls_per_backend: usize,
    pub metadata_buffer: usize,
    pub default_preemption_budget: u32,
    pub hit_strategy: HitStrategy,

    pub retry_max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub retry_initial_interval: Duration,
    #[serde(with = "duration_millis")]
    pub retry_max_interval: Duration,
    pub retry_multiplier: f64,
    pub retry_jitter: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let supervisor = SupervisorConfig::default();
        Self {
            database_url: None,
            http_bind_addr: ([127, 0, 0, 1], 7878).into(),
            otlp_endpoint: None,
            max_concurrent_workflows: supervisor.max_concurrent_workflows,
            max_concurrent_calls_per_backend: supervisor.max_concurrent_calls_per_backend,
            metadata_buffer: supervisor.metadata_buffer,
            default_preemption_budget: supervisor.default_preemption_budget,
            hit_strategy: supervisor.hit_strategy,
            retry_max_attempts: retry.max_attempts,
            retry_initial_interval: retry.initial_interval,
            retry_max_interval: retry.max_interval,
            retry_multiplier: retry.multiplier,
            retry_jitter: retry.jitter,
        }
    }
}

impl EngineConfig {
    /// Loads config from (in ascending priority) built-in defaults, a
    /// `.env` file if present, and `DAGRUNNER_`-prefixed environment
    /// variables (e.g. `DAGRUNNER_HTTP_BIND_ADDR`).
    ///
    /// A missing `.env` file is not an error — `dotenvy` is purely a
    /// convenience for local development, the same role it plays for
    /// the teacher's workers.
    pub fn load() -> Result<Self, ConfigError> {
        // A missing `.env` is the common case outside local development;
        // only a file that exists but fails to parse is worth surfacing,
        // and `config::Environment` below would fail loudly anyway if the
        // variables it needs are absent.
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        let built = config::Config::builder()
            .set_default("database_url", Option::<String>::None)?
            .set_default("http_bind_addr", defaults.http_bind_addr.to_string())?
            .set_default("otlp_endpoint", Option::<String>::None)?
            .set_default(
                "max_concurrent_workflows",
                defaults.max_concurrent_workflows as i64,
            )?
            .set_default(
                "max_concurrent_calls_per_backend",
                defaults.max_concurrent_calls_per_backend as i64,
            )?
            .set_default("metadata_buffer", defaults.metadata_buffer as i64)?
            .set_default(
                "default_preemption_budget",
                defaults.default_preemption_budget as i64,
            )?
            .set_default("hit_strategy", "copy_outputs")?
            .set_default("retry_max_attempts", defaults.retry_max_attempts as i64)?
            .set_default(
                "retry_initial_interval",
                defaults.retry_initial_interval.as_millis() as i64,
            )?
            .set_default(
                "retry_max_interval",
                defaults.retry_max_interval.as_millis() as i64,
            )?
            .set_default("retry_multiplier", defaults.retry_multiplier)?
            .set_default("retry_jitter", defaults.retry_jitter)?
            .add_source(
                config::Environment::with_prefix("DAGRUNNER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_concurrent_workflows: self.max_concurrent_workflows,
            max_concurrent_calls_per_backend: self.max_concurrent_calls_per_backend,
            metadata_buffer: self.metadata_buffer,
            hit_strategy: self.hit_strategy,
            default_preemption_budget: self.default_preemption_budget,
        }
    }

    pub fn telemetry_config(&self) -> crate::telemetry::TelemetryConfig {
        crate::telemetry::TelemetryConfig {
            service_name: "dagrunner-engine".to_string(),
            otlp_endpoint: self.otlp_endpoint.clone(),
            ..Default::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_interval: self.retry_initial_interval,
            max_interval: self.retry_max_interval,
            multiplier: self.retry_multiplier,
            jitter: self.retry_jitter,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
