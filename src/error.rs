//! 错误类型
//!
//! 所有错误都是致命的：由 main 统一打印并以退出码 1 结束进程。

use std::path::PathBuf;
use thiserror::Error;

/// 配置无效的具体原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigIssue {
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("remotePath must be an absolute path, got '{0}'")]
    RelativeRemotePath(String),

    #[error("malformed configuration: {0}")]
    Malformed(String),

    #[error("invalid exclude pattern '{pattern}': {reason}")]
    ExcludePattern { pattern: String, reason: String },
}

#[derive(Debug, Error)]
pub enum UpError {
    #[error("configuration file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("invalid configuration file, {0}")]
    ConfigInvalid(#[from] ConfigIssue),

    #[error("configuration file already exists: {}", .0.display())]
    ConfigExists(PathBuf),

    #[error("local path not found: {}", .0.display())]
    LocalPathNotFound(PathBuf),

    #[error("local path is neither a file nor a directory: {}", .0.display())]
    UnsupportedLocalPathType(PathBuf),

    #[error("failed to scan local path {}: {reason}", .path.display())]
    LocalScanFailed { path: PathBuf, reason: String },

    #[error("cannot map {} under {}", .path.display(), .root.display())]
    UnmappablePath { path: PathBuf, root: PathBuf },

    #[error("failed to connect to the server: {0}")]
    ConnectionFailed(String),

    #[error("remote operation failed: {cause}")]
    RemoteOperationFailed { cause: String },

    #[error("upload cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UpError {
    /// 远程操作失败（保留底层错误链）
    pub fn remote(err: anyhow::Error) -> Self {
        UpError::RemoteOperationFailed {
            cause: format!("{:#}", err),
        }
    }

    /// 进程退出码：目前所有错误都是 1
    pub fn exit_code(&self) -> u8 {
        1
    }
}

pub type Result<T, E = UpError> = std::result::Result<T, E>;
