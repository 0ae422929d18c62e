pub mod cluster_config;

pub use cluster_config::{
    parse_duration, ClusterConfig, ClusterConfigError, ConfigOptions, EnvVarWithFilters, KubeApiConfig,
    LabelWithFilters, PortWithFilters, VolumeWithFilters, SUBNET_AUTO,
};

use std::path::Path;
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cluster config error: {0}")]
    ClusterConfig(#[from] ClusterConfigError),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Read a cluster config file and hand its content to the pure parser
pub fn load_cluster_config_file(path: &Path) -> Result<ClusterConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(ClusterConfig::from_yaml(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_cluster_config_file() {
        let file = create_temp_file("name: dev\nservers: 3\nagents: 1\n");
        let config = load_cluster_config_file(file.path()).unwrap();
        assert_eq!(config.name, "dev");
        assert_eq!(config.servers, 3);
    }

    #[test]
    fn test_load_invalid_config_file() {
        let file = create_temp_file("servers: 2\n");
        let result = load_cluster_config_file(file.path());
        assert!(matches!(result, Err(ConfigError::ClusterConfig(_))));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_cluster_config_file(Path::new("/nonexistent/k3d.yaml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }
}
