pub mod sftp;

#[cfg(test)]
pub(crate) mod memory;

use crate::config::ConnectConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

pub use sftp::SftpStore;

// ============ 公共常量 ============

/// 新建远程目录的权限
pub const DIR_MODE: i32 = 0o755;
/// 上传文件的权限
pub const FILE_MODE: i32 = 0o644;

/// 远程存储：负责建立会话
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 连接并认证，返回独占的会话
    async fn connect(&self, config: &ConnectConfig) -> Result<Box<dyn RemoteSession>>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 一次上传过程中独占使用的远程会话
///
/// 路径都是以 `/` 分隔的绝对路径。
#[async_trait]
pub trait RemoteSession: Send {
    /// 检查路径是否存在（文件或目录）
    async fn exists(&mut self, path: &str) -> Result<bool>;

    /// 创建目录；`recursive` 为 true 时连同缺失的父目录一起创建
    async fn mkdir(&mut self, path: &str, recursive: bool) -> Result<()>;

    /// 上传本地文件，覆盖已存在的远程文件，返回写入的字节数
    async fn put(&mut self, local: &Path, remote: &str) -> Result<u64>;

    /// 关闭会话
    async fn close(&mut self) -> Result<()>;
}

/// 把绝对远程路径展开为逐级前缀：`/a/b` -> [`/a`, `/a/b`]
pub fn remote_ancestors(path: &str) -> Vec<String> {
    let mut current = String::new();
    path.split('/')
        .filter(|part| !part.is_empty())
        .map(|part| {
            current.push('/');
            current.push_str(part);
            current.clone()
        })
        .collect()
}
