use super::{remote_ancestors, RemoteSession, RemoteStore, DIR_MODE, FILE_MODE};
use crate::config::ConnectConfig;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ssh2::{ErrorCode, OpenFlags, OpenType, Session, Sftp};
use std::fs::File;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// LIBSSH2_FX_NO_SUCH_FILE
const FX_NO_SUCH_FILE: i32 = 2;

/// 基于 ssh2 的 SFTP 存储
pub struct SftpStore {
    name: String,
}

impl SftpStore {
    pub fn new() -> Self {
        Self {
            name: "sftp".to_string(),
        }
    }
}

impl Default for SftpStore {
    fn default() -> Self {
        Self::new()
    }
}

/// 一条 TCP 连接上的 SSH 会话和 SFTP 通道
struct SftpConnection {
    session: Session,
    sftp: Sftp,
}

pub struct SftpSession {
    conn: Option<Arc<Mutex<SftpConnection>>>,
    addr: String,
}

impl SftpSession {
    fn conn(&self) -> Result<Arc<Mutex<SftpConnection>>> {
        self.conn
            .clone()
            .ok_or_else(|| anyhow!("SFTP session to {} is closed", self.addr))
    }

    /// ssh2 是阻塞 API，使用 spawn_blocking 避免阻塞 async runtime
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SftpConnection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| anyhow!("SFTP connection lock poisoned"))?;
            op(&conn)
        })
        .await?
    }
}

#[async_trait]
impl RemoteStore for SftpStore {
    async fn connect(&self, config: &ConnectConfig) -> Result<Box<dyn RemoteSession>> {
        let addr = format!("{}:{}", config.host, config.port);
        info!("正在连接服务器: {}", addr);

        let config = config.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&config)).await??;

        info!("SFTP 已连接: {}", addr);
        Ok(Box::new(SftpSession {
            conn: Some(Arc::new(Mutex::new(conn))),
            addr,
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl RemoteSession for SftpSession {
    async fn exists(&mut self, path: &str) -> Result<bool> {
        let path = path.to_string();
        self.blocking(move |conn| stat_exists(&conn.sftp, &path)).await
    }

    async fn mkdir(&mut self, path: &str, recursive: bool) -> Result<()> {
        let path = path.to_string();
        self.blocking(move |conn| make_dir(&conn.sftp, &path, recursive))
            .await
    }

    async fn put(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.blocking(move |conn| upload(&conn.sftp, &local, &remote))
            .await
    }

    async fn close(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        debug!("关闭 SFTP 会话: {}", self.addr);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| anyhow!("SFTP connection lock poisoned"))?;
            conn.session
                .disconnect(None, "upload finished", None)
                .context("SSH disconnect failed")
        })
        .await?
    }
}

fn open_connection(config: &ConnectConfig) -> Result<SftpConnection> {
    let timeout = (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs));
    let tcp = connect_tcp(&config.host, config.port, timeout)?;

    let mut session = Session::new().context("failed to create SSH session")?;
    session.set_tcp_stream(tcp);
    if let Some(timeout) = timeout {
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    }

    session.handshake().context("SSH handshake failed")?;
    session
        .userauth_password(&config.username, &config.password)
        .with_context(|| format!("authentication failed for user '{}'", config.username))?;
    if !session.authenticated() {
        bail!("authentication failed for user '{}'", config.username);
    }

    // 超时只约束建立连接，传输本身不限时
    session.set_timeout(0);

    let sftp = session.sftp().context("failed to open SFTP subsystem")?;
    Ok(SftpConnection { session, sftp })
}

fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {}:{}", host, port))?;

    let mut last_err = None;
    for addr in addrs {
        let result = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match result {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("连接 {} 失败: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(anyhow::Error::new(e)
            .context(format!("TCP connection to {}:{} failed", host, port))),
        None => bail!("no address found for {}:{}", host, port),
    }
}

fn stat_exists(sftp: &Sftp, path: &str) -> Result<bool> {
    match sftp.stat(Path::new(path)) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.code(), ErrorCode::SFTP(FX_NO_SUCH_FILE)) => Ok(false),
        Err(e) => Err(anyhow::Error::new(e).context(format!("stat {} failed", path))),
    }
}

fn make_dir(sftp: &Sftp, path: &str, recursive: bool) -> Result<()> {
    if !recursive {
        return sftp
            .mkdir(Path::new(path), DIR_MODE)
            .with_context(|| format!("mkdir {} failed", path));
    }

    // 类似 mkdir -p：逐级检查，只创建缺失的部分
    for dir in remote_ancestors(path) {
        if stat_exists(sftp, &dir)? {
            continue;
        }
        sftp.mkdir(Path::new(&dir), DIR_MODE)
            .with_context(|| format!("mkdir {} failed", dir))?;
        debug!("已创建远程目录: {}", dir);
    }
    Ok(())
}

fn upload(sftp: &Sftp, local: &Path, remote: &str) -> Result<u64> {
    let mut source =
        File::open(local).with_context(|| format!("cannot open {}", local.display()))?;

    let flags = OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE;
    let mut target = sftp
        .open_mode(Path::new(remote), flags, FILE_MODE, OpenType::File)
        .with_context(|| format!("cannot open remote file {}", remote))?;

    std::io::copy(&mut source, &mut target)
        .with_context(|| format!("put {} -> {} failed", local.display(), remote))
}
