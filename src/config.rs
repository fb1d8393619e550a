//! Configuração do FLOWGATE carregada a partir de `flowgate.toml`.
//!
//! A struct [`FlowgateConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis `FLOWGATE_SIGNING_SECRET` e `FLOWGATE_BASE_URL` têm
//! precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::orchestrator::DEFAULT_CAS_MAX_ATTEMPTS;
use crate::state_machine::{DEFAULT_SUSPEND_TIMEOUT, FlowStateMachine, MAX_SUSPEND_TIMEOUT};
use crate::telemetry::LogConfig;

pub const DEFAULT_CONFIG_PATH: &str = "flowgate.toml";

/// Teto aceito para `max_suspend_timeout_secs`: 365 dias.
pub const SUSPEND_TIMEOUT_CEILING_SECS: u64 = 365 * 24 * 60 * 60;

/// Configuração de nível superior carregada de `flowgate.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowgateConfig {
    /// Segredo da instância usado para assinar links de retomada.
    #[serde(default)]
    pub signing_secret: String,

    /// URL base dos links de retomada e da página de aprovação.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout de suspensão quando o módulo não define um.
    #[serde(default = "default_suspend_timeout_secs")]
    pub default_suspend_timeout_secs: u64,

    /// Teto aplicado a qualquer timeout de suspensão.
    #[serde(default = "default_max_suspend_timeout_secs")]
    pub max_suspend_timeout_secs: u64,

    /// Intervalo entre varreduras de suspensões expiradas.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Tentativas de compare-and-swap antes de desistir de um evento.
    #[serde(default = "default_cas_max_attempts")]
    pub cas_max_attempts: u32,

    #[serde(default)]
    pub log: LogConfig,
}

// Valor padrão para a URL base: servidor local.
fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

// 30 minutos.
fn default_suspend_timeout_secs() -> u64 {
    DEFAULT_SUSPEND_TIMEOUT.as_secs()
}

// 30 dias.
fn default_max_suspend_timeout_secs() -> u64 {
    MAX_SUSPEND_TIMEOUT.as_secs()
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_cas_max_attempts() -> u32 {
    DEFAULT_CAS_MAX_ATTEMPTS
}

impl Default for FlowgateConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            base_url: default_base_url(),
            default_suspend_timeout_secs: default_suspend_timeout_secs(),
            max_suspend_timeout_secs: default_max_suspend_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            cas_max_attempts: default_cas_max_attempts(),
            log: LogConfig::default(),
        }
    }
}

impl FlowgateConfig {
    /// Carrega a configuração de `flowgate.toml` no diretório atual.
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Carrega a configuração de `path`.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<FlowgateConfig>(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo de configuração.
        if let Ok(secret) = std::env::var("FLOWGATE_SIGNING_SECRET")
            && !secret.is_empty()
        {
            config.signing_secret = secret;
        }
        if let Ok(url) = std::env::var("FLOWGATE_BASE_URL")
            && !url.is_empty()
        {
            config.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.default_suspend_timeout_secs > self.max_suspend_timeout_secs {
            anyhow::bail!(
                "default_suspend_timeout_secs ({}) exceeds max_suspend_timeout_secs ({})",
                self.default_suspend_timeout_secs,
                self.max_suspend_timeout_secs
            );
        }
        if self.max_suspend_timeout_secs > SUSPEND_TIMEOUT_CEILING_SECS {
            anyhow::bail!(
                "max_suspend_timeout_secs ({}) exceeds {} (365 days)",
                self.max_suspend_timeout_secs,
                SUSPEND_TIMEOUT_CEILING_SECS
            );
        }
        if self.cas_max_attempts == 0 {
            anyhow::bail!("cas_max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Máquina de estados com os timeouts desta configuração.
    pub fn state_machine(&self) -> FlowStateMachine {
        FlowStateMachine::new(
            Duration::from_secs(self.default_suspend_timeout_secs),
            Duration::from_secs(self.max_suspend_timeout_secs),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
