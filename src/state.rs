//! Application state shared by every handler: the oracle client and the engine
//! configuration. Sessions themselves live with their WebSocket connection.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::{load_engine_config_from_env, EngineConfig};
use crate::error::OracleError;
use crate::oracle::{HttpOracle, Oracle};
use crate::session::{SessionHandle, SessionSpec};

#[derive(Clone)]
pub struct AppState {
    pub oracle: Arc<dyn Oracle>,
    pub config: Arc<EngineConfig>,
}

impl AppState {
    pub fn new(oracle: Arc<dyn Oracle>, config: EngineConfig) -> Self {
        Self { oracle, config: Arc::new(config) }
    }

    /// Build state from env: load the TOML config (or defaults) and the HTTP oracle client.
    #[instrument(level = "info", skip_all)]
    pub fn from_env() -> Result<Self, OracleError> {
        let config = load_engine_config_from_env().unwrap_or_default();
        let oracle = HttpOracle::from_env(config.oracle.timeout())?;
        if !oracle.has_token() {
            warn!(target: "mastery_backend", "ORACLE_TOKEN not set; oracle calls are unauthenticated");
        }
        info!(
            target: "mastery_backend",
            threshold = config.engine.mastery_threshold,
            max_remediation = config.engine.max_remediation_attempts,
            "Engine policy loaded"
        );
        Ok(Self::new(Arc::new(oracle), config))
    }

    pub fn open_session(&self, spec: SessionSpec) -> SessionHandle {
        SessionHandle::spawn(spec, self.oracle.clone(), self.config.clone())
    }
}
