use std::path::PathBuf;

/// Environment-driven settings for the embedding application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base URL of the inference backend.
    pub backend_url: String,
    /// Location of the persisted chat document.
    pub store_path: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let backend_url = std::env::var("BANTER_HOST")
            .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string());

        let store_path = std::env::var("BANTER_STORE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::data_dir().join("banter.json"));

        Self {
            backend_url,
            store_path,
        }
    }

    fn data_dir() -> PathBuf {
        let base = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".local/share")
            });
        base.join("banter")
    }
}
