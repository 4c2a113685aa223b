//! 内存远程存储，用于在没有网络的情况下测试上传流程

use super::{remote_ancestors, RemoteSession, RemoteStore};
use crate::config::ConnectConfig;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// 会话上执行过的操作，按顺序记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Connect,
    Exists(String),
    Mkdir { path: String, recursive: bool },
    Put { local: String, remote: String },
    Close,
}

#[derive(Debug, Default)]
pub struct MemoryState {
    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub ops: Vec<RemoteOp>,
    /// 置位后 connect 失败
    pub refuse_connect: bool,
    /// 上传到该远程路径时失败
    pub fail_put: Option<String>,
}

impl MemoryState {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.dirs.contains(path) || self.files.contains_key(path)
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn with_dirs(self, dirs: &[&str]) -> Self {
        self.state().dirs.extend(dirs.iter().map(|d| d.to_string()));
        self
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn connect(&self, _config: &ConnectConfig) -> Result<Box<dyn RemoteSession>> {
        let mut state = self.state();
        state.ops.push(RemoteOp::Connect);
        if state.refuse_connect {
            bail!("connection refused");
        }
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            closed: false,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

pub struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    closed: bool,
}

impl MemorySession {
    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        if self.closed {
            bail!("session is closed");
        }
        Ok(self.state.lock().unwrap())
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn exists(&mut self, path: &str) -> Result<bool> {
        let mut state = self.state()?;
        state.ops.push(RemoteOp::Exists(path.to_string()));
        Ok(state.exists(path))
    }

    async fn mkdir(&mut self, path: &str, recursive: bool) -> Result<()> {
        let mut state = self.state()?;
        state.ops.push(RemoteOp::Mkdir {
            path: path.to_string(),
            recursive,
        });
        if recursive {
            for dir in remote_ancestors(path) {
                if state.files.contains_key(&dir) {
                    bail!("mkdir {}: not a directory", dir);
                }
                state.dirs.insert(dir);
            }
            return Ok(());
        }
        if state.exists(path) {
            bail!("mkdir {}: already exists", path);
        }
        if !state.exists(parent_of(path)) {
            bail!("mkdir {}: no such file", path);
        }
        state.dirs.insert(path.to_string());
        Ok(())
    }

    async fn put(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let mut state = self.state()?;
        state.ops.push(RemoteOp::Put {
            local: local.display().to_string(),
            remote: remote.to_string(),
        });
        if state.fail_put.as_deref() == Some(remote) {
            return Err(anyhow!("permission denied"));
        }
        if !state.dirs.contains(parent_of(remote)) && parent_of(remote) != "/" {
            bail!("put {}: parent directory missing", remote);
        }
        let data = std::fs::read(local).with_context(|| format!("cannot open {}", local.display()))?;
        let len = data.len() as u64;
        state.files.insert(remote.to_string(), data);
        Ok(len)
    }

    async fn close(&mut self) -> Result<()> {
        self.state()?.ops.push(RemoteOp::Close);
        self.closed = true;
        Ok(())
    }
}
