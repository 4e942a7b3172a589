//! Backend settings and the persisted per-display output configuration.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    args::GlobalArgs,
    damage::DEFAULT_HISTORY_DEPTH,
    device::ConnectorInfo,
    error::ConfigError,
};

/// Namespace of the output uuids.
const OUTPUT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_8d3b_4f7a_9e21_5c0d_b7a8_3e14);

const STORE_VERSION: u32 = 1;

/// Identifier of the display behind a connector that stays stable across sessions.
pub fn output_uuid(connector: &ConnectorInfo) -> Uuid {
    let mut name = connector.name.clone();
    if let Some(edid) = &connector.edid {
        name.push(':');
        name.push_str(&edid.make);
        name.push(':');
        name.push_str(&edid.model);
        name.push(':');
        name.push_str(&edid.serial);
    }
    Uuid::new_v5(&OUTPUT_NAMESPACE, name.as_bytes())
}

/// Settings of the output backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Never attempt atomic mode setting
    pub force_legacy_modeset: bool,
    /// Pace every output with simulated vertical blanks
    pub force_software_vsync: bool,
    pub damage_history_depth: usize,
    /// Where output configuration is persisted, the xdg config location if unset
    pub output_config: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            force_legacy_modeset: false,
            force_software_vsync: false,
            damage_history_depth: DEFAULT_HISTORY_DEPTH,
            output_config: None,
        }
    }
}

impl BackendConfig {
    /// Reads `LUMEN_DISABLE_ATOMIC`, `LUMEN_SOFTWARE_VSYNC` and `LUMEN_DAMAGE_HISTORY`.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config.force_legacy_modeset = var("LUMEN_DISABLE_ATOMIC").is_some();
        config.force_software_vsync = var("LUMEN_SOFTWARE_VSYNC").is_some();
        if let Some(depth) = var("LUMEN_DAMAGE_HISTORY") {
            match depth.parse::<usize>() {
                Ok(depth) if depth > 0 => config.damage_history_depth = depth,
                _ => warn!(value = %depth, "Ignoring invalid LUMEN_DAMAGE_HISTORY"),
            }
        }
        config
    }

    /// Applies command line switches on top of the environment.
    pub fn apply_args(&mut self, args: &GlobalArgs) {
        self.force_legacy_modeset |= args.legacy_modeset;
        self.force_software_vsync |= args.software_vsync;
        if let Some(path) = &args.output_config {
            self.output_config = Some(path.clone());
        }
    }
}

/// What is remembered about one display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredOutputs {
    version: u32,
    outputs: BTreeMap<Uuid, OutputConfig>,
}

/// Output configuration keyed by output uuid, persisted with bincode.
#[derive(Debug, Default)]
pub struct OutputConfigStore {
    path: Option<PathBuf>,
    outputs: BTreeMap<Uuid, OutputConfig>,
}

impl OutputConfigStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// `$XDG_CONFIG_HOME/lumen/outputs.bin`, creating the directory if needed.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = xdg::BaseDirectories::with_prefix("lumen")?;
        Ok(dirs.place_config_file("outputs.bin")?)
    }

    /// Loads the store at `path`. A missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let outputs = match fs::read(path) {
            Ok(bytes) => {
                let stored: StoredOutputs = bincode::deserialize(&bytes)?;
                if stored.version != STORE_VERSION {
                    warn!(?path, version = stored.version, "Discarding output configuration of unknown version");
                    BTreeMap::new()
                } else {
                    stored.outputs
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(?path, "No output configuration yet");
                BTreeMap::new()
            }
            Err(err) => return Err(err.into()),
        };
        info!(?path, outputs = outputs.len(), "Loaded output configuration");
        Ok(Self {
            path: Some(path.to_path_buf()),
            outputs,
        })
    }

    /// Opens the store named by `config`, falling back to an in-memory store on errors.
    pub fn open(config: &BackendConfig) -> Self {
        let path = match &config.output_config {
            Some(path) => Ok(path.clone()),
            None => Self::default_path(),
        };
        match path.and_then(|path| Self::load(&path)) {
            Ok(store) => store,
            Err(err) => {
                warn!("Output configuration unavailable, changes will not persist: {err}");
                Self::in_memory()
            }
        }
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&OutputConfig> {
        self.outputs.get(uuid)
    }

    /// Records `config` for `uuid`. Returns whether anything changed.
    pub fn set(&mut self, uuid: Uuid, config: OutputConfig) -> bool {
        if self.outputs.get(&uuid) == Some(&config) {
            return false;
        }
        self.outputs.insert(uuid, config);
        true
    }

    /// Writes the store to disk, if it has a path.
    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let stored = StoredOutputs {
            version: STORE_VERSION,
            outputs: self.outputs.clone(),
        };
        let bytes = bincode::serialize(&stored)?;
        let tmp = path.with_extension("bin.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        debug!(?path, "Saved output configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EdidIdentity;
    use crate::testing::connector;

    #[test]
    fn uuid_depends_on_connector_and_display() {
        let mut first = connector(1, "DP-1", true, 1);
        let plain = output_uuid(&first);
        assert_eq!(plain, output_uuid(&connector(2, "DP-1", false, 3)));

        first.edid = Some(EdidIdentity {
            make: "DEL".into(),
            model: "41042".into(),
            serial: "1234".into(),
        });
        let with_edid = output_uuid(&first);
        assert_ne!(plain, with_edid);
        assert_ne!(with_edid, output_uuid(&connector(1, "DP-2", true, 1)));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = BackendConfig::from_vars(|name| match name {
            "LUMEN_DISABLE_ATOMIC" => Some("1".into()),
            "LUMEN_DAMAGE_HISTORY" => Some("3".into()),
            _ => None,
        });
        assert!(config.force_legacy_modeset);
        assert!(!config.force_software_vsync);
        assert_eq!(config.damage_history_depth, 3);

        let config = BackendConfig::from_vars(|name| {
            (name == "LUMEN_DAMAGE_HISTORY").then(|| "zero".to_owned())
        });
        assert_eq!(config.damage_history_depth, DEFAULT_HISTORY_DEPTH);
    }

    #[test]
    fn store_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputs.bin");
        let uuid = Uuid::new_v5(&OUTPUT_NAMESPACE, b"DP-1");

        let mut store = OutputConfigStore::load(&path).unwrap();
        assert!(store.get(&uuid).is_none());
        let config = OutputConfig {
            name: "DP-1".into(),
            enabled: false,
        };
        assert!(store.set(uuid, config.clone()));
        assert!(!store.set(uuid, config.clone()));
        store.save().unwrap();

        let reloaded = OutputConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.get(&uuid), Some(&config));
    }

    #[test]
    fn corrupt_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputs.bin");
        fs::write(&path, [0xff; 3]).unwrap();
        assert!(matches!(
            OutputConfigStore::load(&path),
            Err(ConfigError::Encoding(_))
        ));
    }
}
