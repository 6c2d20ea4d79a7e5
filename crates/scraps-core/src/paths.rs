use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInputs {
    pub home_dir: PathBuf,
    pub scraps_dir_override: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapsPaths {
    pub scraps_dir: PathBuf,

    pub config_file: PathBuf,
    pub credentials_file: PathBuf,
    pub log_path: PathBuf,
}

pub fn compute_paths(inputs: PathInputs) -> ScrapsPaths {
    // Agent scripts read ~/.scraps/credentials.json directly, so the layout stays flat.
    let scraps_dir = inputs
        .scraps_dir_override
        .unwrap_or_else(|| inputs.home_dir.join(".scraps"));

    ScrapsPaths {
        config_file: scraps_dir.join("config.toml"),
        credentials_file: scraps_dir.join("credentials.json"),
        log_path: scraps_dir.join("scraps.log"),
        scraps_dir,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_paths_default() {
        let got = compute_paths(PathInputs {
            home_dir: PathBuf::from("/home/alice"),
            scraps_dir_override: None,
        });
        assert_eq!(got.scraps_dir, PathBuf::from("/home/alice/.scraps"));
        assert_eq!(
            got.config_file,
            PathBuf::from("/home/alice/.scraps/config.toml")
        );
        assert_eq!(
            got.credentials_file,
            PathBuf::from("/home/alice/.scraps/credentials.json")
        );
        assert_eq!(got.log_path, PathBuf::from("/home/alice/.scraps/scraps.log"));
    }

    #[test]
    fn compute_paths_override_moves_everything() {
        let got = compute_paths(PathInputs {
            home_dir: PathBuf::from("/home/alice"),
            scraps_dir_override: Some(PathBuf::from("/tmp/sc")),
        });
        assert_eq!(got.scraps_dir, PathBuf::from("/tmp/sc"));
        assert_eq!(got.config_file, PathBuf::from("/tmp/sc/config.toml"));
        assert_eq!(
            got.credentials_file,
            PathBuf::from("/tmp/sc/credentials.json")
        );
    }
}
