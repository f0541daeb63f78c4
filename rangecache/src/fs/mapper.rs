use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Separator between path components kept by [`KeyMapper::Basename`]
const BASENAME_SEPARATOR: &str = "_@_";

/// Maps a target path to the name used inside cache keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeyMapper {
    #[default]
    /// SHA-256 of the full path; files with the same basename on different targets never collide
    Hash,
    /// Last path component, plus `directory_levels` parent directories
    Basename {
        #[serde(default)]
        directory_levels: usize,
    },
}

impl KeyMapper {
    /// Mapper selected by the `same_names` switch
    pub fn from_same_names(same_names: bool) -> Self {
        if same_names {
            Self::Basename {
                directory_levels: 0,
            }
        } else {
            Self::Hash
        }
    }

    pub fn map(&self, path: &str) -> String {
        match self {
            Self::Hash => hash_path(path),
            Self::Basename { directory_levels } => {
                let parts: Vec<&str> = path
                    .trim_end_matches('/')
                    .split('/')
                    .filter(|part| !part.is_empty())
                    .collect();
                let keep = (directory_levels + 1).min(parts.len());
                parts[parts.len() - keep..].join(BASENAME_SEPARATOR)
            }
        }
    }
}

/// Hex SHA-256 of a path
pub fn hash_path(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    hex::encode(&digest[..])
}
