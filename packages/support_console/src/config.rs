use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use support_sync::SyncConfig;

/// Build a figment that layers: defaults → config.toml → SUPPORT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `SUPPORT_GATEWAY__BASE_URL=https://..`  →  `gateway.base_url`
///   `SUPPORT_TRANSPORT__MAX_RECONNECT_ATTEMPTS=5`  →  `transport.max_reconnect_attempts`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(SyncConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("SUPPORT_").split("__"))
}

/// Values passed on the command line. They win over every figment layer.
#[derive(Debug, Default, Clone)]
pub struct RuntimeOverrides {
    pub owner_id: Option<String>,
    pub display_name: Option<String>,
}

impl RuntimeOverrides {
    pub fn apply(&self, config: &mut SyncConfig) {
        if let Some(owner_id) = &self.owner_id {
            config.agent.owner_id = owner_id.clone();
        }
        if let Some(display_name) = &self.display_name {
            config.agent.display_name = display_name.clone();
        }
    }
}

// Directory layout (derived from --data-dir, not tunable via figment)

#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    pub data_dir: PathBuf,
}

impl ConsoleConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".support-agent"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Resolves the effective sync configuration.
    pub fn sync_config(
        &self,
        explicit_path: Option<&Path>,
        overrides: &RuntimeOverrides,
    ) -> Result<SyncConfig> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config_toml_path());

        let mut config: SyncConfig = load_config(&path)
            .extract()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        overrides.apply(&mut config);
        Ok(config)
    }
}
