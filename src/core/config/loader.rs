use anyhow::{Context, Result};
use std::{fs, io::Write, path::Path};

use super::model::TunnelConfig;

/// Load the JSON config at `path`; a missing file is created with defaults.
pub fn load_from_path(path: &Path) -> Result<TunnelConfig> {
    if path.exists() {
        let data = fs::read(path).with_context(|| format!("read config: {}", path.display()))?;
        let cfg: TunnelConfig = serde_json::from_slice(&data).context("parse config json")?;
        Ok(cfg)
    } else {
        let cfg = TunnelConfig::default();
        save_to_path(&cfg, path)?;
        Ok(cfg)
    }
}

pub fn save_to_path(cfg: &TunnelConfig, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("create config dir: {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(cfg).context("serialize config")?;
    let mut f =
        fs::File::create(path).with_context(|| format!("create config: {}", path.display()))?;
    f.write_all(json.as_bytes()).context("write config")?;
    tracing::info!(target = "config", path = %path.display(), "config saved");
    Ok(())
}
