use anyhow::{Context as _, Result};
use scraps_core::config::{ConfigFile, Credentials};
use scraps_core::paths::ScrapsPaths;

pub async fn load(paths: &ScrapsPaths) -> Result<ConfigFile> {
    let path = &paths.config_file;
    match tokio::fs::read_to_string(path).await {
        Ok(s) => {
            let cfg: ConfigFile = toml::from_str(&s).context("parse config.toml")?;
            cfg.validate().context("validate config.toml")?;
            Ok(cfg)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(err) => Err(err).with_context(|| format!("read config: {}", path.display())),
    }
}

pub async fn load_credentials(paths: &ScrapsPaths) -> Result<Credentials> {
    let path = &paths.credentials_file;
    match tokio::fs::read_to_string(path).await {
        Ok(s) if s.trim().is_empty() => Ok(Credentials::default()),
        Ok(s) => serde_json::from_str(&s)
            .with_context(|| format!("parse credentials: {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Credentials::default()),
        Err(err) => Err(err).with_context(|| format!("read credentials: {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraps_core::config::TransportKind;
    use scraps_core::paths::{compute_paths, PathInputs};
    use tempfile::TempDir;

    fn paths(dir: &TempDir) -> ScrapsPaths {
        compute_paths(PathInputs {
            home_dir: dir.path().to_path_buf(),
            scraps_dir_override: Some(dir.path().join("sc")),
        })
    }

    #[tokio::test]
    async fn missing_files_load_as_defaults() {
        let dir = TempDir::new().unwrap();
        let p = paths(&dir);
        let cfg = load(&p).await.unwrap();
        assert!(cfg.default_host.is_none());
        assert!(load_credentials(&p).await.unwrap().0.is_empty());
    }

    #[tokio::test]
    async fn reads_config_and_credentials() {
        let dir = TempDir::new().unwrap();
        let p = paths(&dir);
        std::fs::create_dir_all(&p.scraps_dir).unwrap();
        std::fs::write(&p.config_file, "[watch]\ntransport = \"ws\"\n").unwrap();
        std::fs::write(
            &p.credentials_file,
            r#"{"https://api.scraps.sh": {"api_key": "k", "user_id": "u1", "username": "ada"}}"#,
        )
        .unwrap();

        let cfg = load(&p).await.unwrap();
        assert_eq!(cfg.effective_watch().transport, TransportKind::Ws);
        let creds = load_credentials(&p).await.unwrap();
        assert_eq!(
            creds.for_host("https://api.scraps.sh").map(|c| c.username.as_str()),
            Some("ada")
        );
    }

    #[tokio::test]
    async fn invalid_config_is_reported_with_context() {
        let dir = TempDir::new().unwrap();
        let p = paths(&dir);
        std::fs::create_dir_all(&p.scraps_dir).unwrap();
        std::fs::write(&p.config_file, "default-host = \"ftp://nope\"\n").unwrap();

        let err = load(&p).await.unwrap_err();
        assert!(format!("{err:#}").contains("validate config.toml"));
    }
}
