use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::config::Config;

/// Reads a JSON config file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf().into_boxed_path(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf().into_boxed_path(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed at {path:?}: {source}")]
    Read {
        path: Box<Path>,
        #[source]
        source: io::Error,
    },
    #[error("config parse failed at {path:?}: {source}")]
    Parse {
        path: Box<Path>,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_cluster_goal() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{
                "cluster": {{
                    "clusterId": "c",
                    "version": 1,
                    "hosts": ["h1:7894"],
                    "f": 0,
                    "maxRMCount": 5
                }},
                "logging": {{ "format": "compact" }}
            }}"#
        )
        .expect("write");

        let config = load(file.path()).expect("load");
        let cluster = config.cluster.expect("cluster section");
        assert_eq!(cluster.cluster_id, "c");
        assert_eq!(config.timing.submission_initial_attempts, 5);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load(Path::new("/nonexistent/strata.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "{{ not json").expect("write");
        let err = load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
