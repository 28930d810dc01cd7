use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result, bail},
    naclgate_auth::ServerKeys,
    naclgate_config::{NaclgateConfig, config_dir, discover_and_load, load_config, save_config},
};

const DEFAULT_FILE_NAME: &str = "naclgate.toml";

/// Write a default config with a freshly generated private key.
pub fn init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => config_dir()
            .context("could not determine the config directory")?
            .join(DEFAULT_FILE_NAME),
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let keys = ServerKeys::generate();
    let mut config = NaclgateConfig::default();
    config.server.private_key = Some(keys.secret_key_hex());
    save_config(&config, &path)?;

    println!("Wrote {}", path.display());
    println!("Public key: {}", keys.public_key_hex());
    Ok(())
}

/// Print the public key clients need to seal their messages.
pub fn public_key(config: Option<&Path>) -> Result<()> {
    let config = match config {
        Some(path) => load_config(path)?,
        None => discover_and_load()?,
    };
    let Some(bytes) = config.server.private_key_bytes()? else {
        bail!("no private key configured; run `naclgate init` or set server.private_key");
    };
    println!("{}", ServerKeys::from_bytes(bytes).public_key_hex());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_loadable_config_with_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("naclgate.toml");

        init(Some(path.clone()), false).unwrap();
        let config = load_config(&path).unwrap();
        assert!(config.server.private_key_bytes().unwrap().is_some());
        public_key(Some(&path)).unwrap();

        assert!(init(Some(path.clone()), false).is_err());
        init(Some(path), true).unwrap();
    }

    #[test]
    fn public_key_without_private_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("naclgate.toml");
        save_config(&NaclgateConfig::default(), &path).unwrap();
        assert!(public_key(Some(&path)).is_err());
    }
}
