//! 本地路径到远程路径的映射
//!
//! 例如 localPath 为 /home/user/project、remotePath 为 /var/www/project 时，
//! /home/user/project/index.html 映射为 /var/www/project/index.html。
//! localPath 本身是文件时映射为 remotePath 下的同名文件。

use crate::config::UpConfig;
use crate::error::{Result, UpError};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// 本地绝对路径 -> 远程绝对路径
pub type PathMap = BTreeMap<PathBuf, String>;

/// 映射一组本地路径（纯函数）
pub fn map_to_remote(local_paths: &[PathBuf], config: &UpConfig) -> Result<PathMap> {
    local_paths
        .iter()
        .map(|path| {
            let remote = remote_path_for(path, &config.local_path, &config.remote_path)?;
            Ok((path.clone(), remote))
        })
        .collect()
}

/// 计算单个本地路径对应的远程路径
pub fn remote_path_for(path: &Path, local_root: &Path, remote_root: &str) -> Result<String> {
    let unmappable = || UpError::UnmappablePath {
        path: path.to_path_buf(),
        root: local_root.to_path_buf(),
    };

    if path == local_root {
        // localPath 是文件
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(unmappable)?;
        return Ok(join_remote(remote_root, [name]));
    }

    let relative = path.strip_prefix(local_root).map_err(|_| unmappable())?;
    let segments = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(unmappable)?;

    Ok(join_remote(remote_root, segments))
}

/// 用 `/` 拼接远程路径，remote_root 为 `/` 时不产生 `//`
fn join_remote<'a>(remote_root: &str, segments: impl IntoIterator<Item = &'a str>) -> String {
    let mut remote = remote_root.trim_end_matches('/').to_string();
    for segment in segments {
        remote.push('/');
        remote.push_str(segment);
    }
    if remote.is_empty() {
        remote.push('/');
    }
    remote
}
