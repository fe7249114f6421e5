use crate::infrastructure::config::{EngineConfig, ensure_default_configs, load_config};
use crate::infrastructure::error::EngineError;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};

pub const DATABASE_FILE_NAME: &str = "engine.sqlite";

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub database_path: PathBuf,
    pub config: EngineConfig,
}

/// Lays out `config/`, `state/` and `logs/` under `workspace_root`, writes the
/// default config when absent and migrates the database.
pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, EngineError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join(DATABASE_FILE_NAME);

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_configs(&config_dir)?;
    let config = load_config(&config_dir)?;
    initialize_database(&database_path)?;

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        logs_dir,
        database_path,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::ENGINE_JSON;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        root: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let root = std::env::temp_dir().join(format!(
                "cadence-bootstrap-{}-{sequence}",
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&root);
            Self { root }
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn bootstrap_creates_layout_and_is_repeatable() {
        let workspace = TempWorkspace::new();

        let first = bootstrap_workspace(&workspace.root).expect("first bootstrap");
        assert!(first.config_dir.join(ENGINE_JSON).exists());
        assert!(first.logs_dir.is_dir());
        assert!(first.database_path.exists());
        assert_eq!(first.config, EngineConfig::default());

        let second = bootstrap_workspace(&workspace.root).expect("second bootstrap");
        assert_eq!(second.database_path, first.database_path);
    }

    #[test]
    fn bootstrap_surfaces_invalid_config() {
        let workspace = TempWorkspace::new();
        let config_dir = workspace.root.join("config");
        fs::create_dir_all(&config_dir).expect("config dir");
        fs::write(config_dir.join(ENGINE_JSON), "{ not json").expect("write config");

        let error = bootstrap_workspace(&workspace.root).expect_err("invalid config");
        assert!(matches!(error, EngineError::Json(_) | EngineError::InvalidConfig(_)));
    }
}
