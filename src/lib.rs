pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{ConnectConfig, UpConfig, CONFIG_FILE_NAME};
pub use core::{UploadEngine, UploadEvent, UploadPhase, UploadReport};
pub use error::{ConfigIssue, UpError};
pub use storage::{RemoteSession, RemoteStore, SftpStore};

/// 各平台的用户配置目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux：优先 XDG_CONFIG_HOME
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
