use crate::config::UpConfig;
use crate::core::mapper::{map_to_remote, PathMap};
use crate::core::scanner::{LocalScanner, LocalTree};
use crate::error::{Result, UpError};
use crate::storage::{RemoteSession, RemoteStore};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 上传阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Idle,
    ConfigLoaded,
    Scanned,
    Connected,
    DirsEnsured,
    FilesUploaded,
    Failed,
}

/// 上传进度事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Phase(UploadPhase),
    DirCreated(String),
    FileUploaded {
        local: PathBuf,
        remote: String,
        bytes: u64,
    },
}

/// 上传计划：扫描结果和映射
#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub tree: LocalTree,
    pub dir_map: PathMap,
    pub file_map: PathMap,
}

impl UploadPlan {
    /// 扫描本地路径并计算映射
    pub fn build(config: &UpConfig, cancel_flag: Arc<AtomicBool>) -> Result<Self> {
        let tree = LocalScanner::new(&config.exclude)?
            .with_cancel(cancel_flag)
            .scan(&config.local_path)?;
        let dir_map = map_to_remote(&tree.dirs, config)?;
        let file_map = map_to_remote(&tree.files, config)?;
        Ok(Self {
            tree,
            dir_map,
            file_map,
        })
    }

    fn remote<'a>(map: &'a PathMap, local: &Path, config: &UpConfig) -> Result<&'a str> {
        map.get(local)
            .map(String::as_str)
            .ok_or_else(|| UpError::UnmappablePath {
                path: local.to_path_buf(),
                root: config.local_path.clone(),
            })
    }
}

/// 上传报告
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub dirs_created: u32,
    pub dirs_existing: u32,
    pub files_uploaded: u32,
    pub bytes_transferred: u64,
    pub start_time: i64,
    pub end_time: i64,
    /// 耗时（毫秒）
    pub duration: u64,
}

/// 上传引擎
///
/// 流程：扫描 -> 映射 -> 连接 -> 创建远程目录（父目录在前）-> 逐个上传文件。
/// 任一步失败立即终止，已创建的目录和已上传的文件不会回滚。
pub struct UploadEngine {
    config: UpConfig,
    cancelled: Arc<AtomicBool>,
    phase: Mutex<UploadPhase>,
}

impl UploadEngine {
    pub fn new(config: UpConfig) -> Self {
        Self {
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
            phase: Mutex::new(UploadPhase::Idle),
        }
    }

    /// 取消标志，可以交给信号处理器
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// 取消上传
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 当前阶段，运行前为 `Idle`
    pub fn phase(&self) -> UploadPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter_phase(&self, tx: &Option<mpsc::Sender<UploadEvent>>, phase: UploadPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
        self.send_progress(tx, UploadEvent::Phase(phase)).await;
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(UpError::Cancelled);
        }
        Ok(())
    }

    /// 发送进度事件；通道已满或接收端已关闭时丢弃，不阻塞上传
    async fn send_progress(&self, tx: &Option<mpsc::Sender<UploadEvent>>, event: UploadEvent) {
        if let Some(tx) = tx {
            if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
                debug!("进度通道已满，丢弃事件: {:?}", event);
            }
        }
    }

    /// 扫描并计算映射（不访问网络）
    pub async fn plan(&self) -> Result<UploadPlan> {
        let config = self.config.clone();
        let cancel_flag = self.cancelled.clone();
        // 使用 spawn_blocking 避免阻塞 async runtime
        tokio::task::spawn_blocking(move || UploadPlan::build(&config, cancel_flag))
            .await
            .map_err(|e| UpError::LocalScanFailed {
                path: self.config.local_path.clone(),
                reason: e.to_string(),
            })?
    }

    /// 运行上传任务
    ///
    /// `progress_tx` 接收阶段和逐个文件的进度。发送不会等待接收端，
    /// 调用方没有及时消费时多出的事件会被丢弃。
    pub async fn run(
        &self,
        store: &dyn RemoteStore,
        progress_tx: Option<mpsc::Sender<UploadEvent>>,
    ) -> Result<UploadReport> {
        let start_time = chrono::Utc::now().timestamp();
        let started = Instant::now();

        self.enter_phase(&progress_tx, UploadPhase::ConfigLoaded).await;

        match self.run_phases(store, &progress_tx).await {
            Ok(mut report) => {
                report.start_time = start_time;
                report.end_time = chrono::Utc::now().timestamp();
                report.duration = started.elapsed().as_millis() as u64;
                self.enter_phase(&progress_tx, UploadPhase::FilesUploaded).await;
                info!(
                    "上传完成: {} 个文件, {} 字节, 新建 {} 个目录, 耗时 {}ms",
                    report.files_uploaded,
                    report.bytes_transferred,
                    report.dirs_created,
                    report.duration
                );
                Ok(report)
            }
            Err(e) => {
                self.enter_phase(&progress_tx, UploadPhase::Failed).await;
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        store: &dyn RemoteStore,
        progress_tx: &Option<mpsc::Sender<UploadEvent>>,
    ) -> Result<UploadReport> {
        self.check_cancelled()?;
        let plan = self.plan().await?;
        debug!(
            "上传计划: {} 个目录, {} 个文件",
            plan.tree.dirs.len(),
            plan.tree.files.len()
        );
        self.enter_phase(progress_tx, UploadPhase::Scanned).await;

        self.check_cancelled()?;
        info!("正在连接服务器 ({})...", store.name());
        let mut session = store
            .connect(&self.config.connect)
            .await
            .map_err(|e| UpError::ConnectionFailed(format!("{:#}", e)))?;
        self.enter_phase(progress_tx, UploadPhase::Connected).await;

        let result = self.transfer(session.as_mut(), &plan, progress_tx).await;

        // 无论成功与否都关闭会话
        if let Err(e) = session.close().await {
            warn!("关闭远程会话失败: {:#}", e);
        }

        result
    }

    async fn transfer(
        &self,
        session: &mut dyn RemoteSession,
        plan: &UploadPlan,
        progress_tx: &Option<mpsc::Sender<UploadEvent>>,
    ) -> Result<UploadReport> {
        let mut report = UploadReport::default();

        self.ensure_dir(session, &self.config.remote_path, &mut report, progress_tx)
            .await?;

        // 先创建所有目录（dirs 已按父目录在前排序）
        for local_dir in &plan.tree.dirs {
            self.check_cancelled()?;
            let remote_dir = UploadPlan::remote(&plan.dir_map, local_dir, &self.config)?;
            self.ensure_dir(session, remote_dir, &mut report, progress_tx)
                .await?;
        }
        self.enter_phase(progress_tx, UploadPhase::DirsEnsured).await;

        // 再逐个上传文件
        for local_file in &plan.tree.files {
            self.check_cancelled()?;
            let remote_file = UploadPlan::remote(&plan.file_map, local_file, &self.config)?;
            info!("上传: {} -> {}", local_file.display(), remote_file);
            let bytes = session
                .put(local_file, remote_file)
                .await
                .map_err(UpError::remote)?;
            report.files_uploaded += 1;
            report.bytes_transferred += bytes;
            self.send_progress(
                progress_tx,
                UploadEvent::FileUploaded {
                    local: local_file.clone(),
                    remote: remote_file.to_string(),
                    bytes,
                },
            )
            .await;
        }

        Ok(report)
    }

    /// 确保远程目录存在，不存在时递归创建
    async fn ensure_dir(
        &self,
        session: &mut dyn RemoteSession,
        remote_dir: &str,
        report: &mut UploadReport,
        progress_tx: &Option<mpsc::Sender<UploadEvent>>,
    ) -> Result<()> {
        if session.exists(remote_dir).await.map_err(UpError::remote)? {
            report.dirs_existing += 1;
            return Ok(());
        }

        warn!("远程目录不存在，正在创建: {}", remote_dir);
        session
            .mkdir(remote_dir, true)
            .await
            .map_err(UpError::remote)?;
        report.dirs_created += 1;
        self.send_progress(progress_tx, UploadEvent::DirCreated(remote_dir.to_string()))
            .await;
        Ok(())
    }
}

/// 按配置执行一次完整上传
pub async fn execute(config: UpConfig, store: &dyn RemoteStore) -> Result<UploadReport> {
    UploadEngine::new(config).run(store, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectConfig;
    use crate::logging::LogConfig;
    use crate::storage::memory::{MemoryStore, RemoteOp};
    use std::fs;
    use tempfile::TempDir;

    fn config(local: &Path, remote: &str) -> UpConfig {
        UpConfig {
            connect: ConnectConfig {
                host: "example.com".to_string(),
                port: 22,
                username: "deploy".to_string(),
                password: "secret".to_string(),
                timeout_secs: 20,
            },
            local_path: local.to_path_buf(),
            remote_path: remote.to_string(),
            exclude: Vec::new(),
            log: LogConfig::default(),
        }
    }

    /// src/a.txt, src/sub/b.txt
    fn source_tree() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"bravo!").unwrap();
        dir
    }

    fn position(ops: &[RemoteOp], wanted: impl Fn(&RemoteOp) -> bool) -> usize {
        ops.iter().position(wanted).expect("operation not found")
    }

    fn drain(mut rx: mpsc::Receiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_plan_for_directory() {
        let src = source_tree();
        let engine = UploadEngine::new(config(src.path(), "/srv/dst"));
        let plan = engine.plan().await.unwrap();

        assert_eq!(plan.dir_map.len(), 1);
        assert_eq!(plan.dir_map[&src.path().join("sub")], "/srv/dst/sub");
        assert_eq!(plan.file_map.len(), 2);
        assert_eq!(plan.file_map[&src.path().join("a.txt")], "/srv/dst/a.txt");
        assert_eq!(plan.file_map[&src.path().join("sub/b.txt")], "/srv/dst/sub/b.txt");
    }

    #[tokio::test]
    async fn test_upload_directory() {
        let src = source_tree();
        let store = MemoryStore::new();
        let report = execute(config(src.path(), "/srv/dst"), &store).await.unwrap();

        assert_eq!(report.files_uploaded, 2);
        assert_eq!(report.bytes_transferred, 11);
        assert_eq!(report.dirs_created, 2);

        let state = store.state();
        assert_eq!(state.files["/srv/dst/a.txt"], b"alpha");
        assert_eq!(state.files["/srv/dst/sub/b.txt"], b"bravo!");
        assert!(state.dirs.contains("/srv/dst/sub"));

        let mkdir_sub = position(&state.ops, |op| {
            matches!(op, RemoteOp::Mkdir { path, .. } if path == "/srv/dst/sub")
        });
        let put_b = position(&state.ops, |op| {
            matches!(op, RemoteOp::Put { remote, .. } if remote == "/srv/dst/sub/b.txt")
        });
        assert!(mkdir_sub < put_b);
        assert_eq!(state.ops.first(), Some(&RemoteOp::Connect));
        assert_eq!(state.ops.last(), Some(&RemoteOp::Close));
    }

    #[tokio::test]
    async fn test_upload_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("report.pdf");
        fs::write(&file, b"%PDF").unwrap();

        let store = MemoryStore::new();
        let report = execute(config(&file, "/srv/reports"), &store).await.unwrap();

        assert_eq!(report.files_uploaded, 1);
        let state = store.state();
        assert_eq!(state.files.len(), 1);
        assert_eq!(state.files["/srv/reports/report.pdf"], b"%PDF");
    }

    #[tokio::test]
    async fn test_parent_created_before_child() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::create_dir_all(dir.path().join("a/longer-name")).unwrap();
        fs::write(dir.path().join("a/b/c/deep.txt"), b"x").unwrap();

        let store = MemoryStore::new();
        execute(config(dir.path(), "/dst"), &store).await.unwrap();

        let state = store.state();
        let created: Vec<&str> = state
            .ops
            .iter()
            .filter_map(|op| match op {
                RemoteOp::Mkdir { path, .. } => Some(path.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            created,
            vec!["/dst", "/dst/a", "/dst/a/b", "/dst/a/b/c", "/dst/a/longer-name"]
        );
    }

    #[tokio::test]
    async fn test_run_twice_is_idempotent() {
        let src = source_tree();
        let store = MemoryStore::new();

        let first = execute(config(src.path(), "/srv/dst"), &store).await.unwrap();
        let (dirs, files) = {
            let state = store.state();
            (state.dirs.clone(), state.files.clone())
        };

        let second = execute(config(src.path(), "/srv/dst"), &store).await.unwrap();
        let state = store.state();
        assert_eq!(state.dirs, dirs);
        assert_eq!(state.files, files);
        assert_eq!(first.dirs_created, 2);
        assert_eq!(second.dirs_created, 0);
        assert_eq!(second.dirs_existing, 2);
        assert_eq!(second.files_uploaded, 2);
    }

    #[tokio::test]
    async fn test_existing_remote_root_not_recreated() {
        let src = source_tree();
        let store = MemoryStore::new().with_dirs(&["/srv", "/srv/dst"]);
        execute(config(src.path(), "/srv/dst"), &store).await.unwrap();

        let state = store.state();
        assert!(!state.ops.iter().any(|op| matches!(
            op,
            RemoteOp::Mkdir { path, .. } if path == "/srv/dst"
        )));
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let src = source_tree();
        let store = MemoryStore::new();
        store.state().refuse_connect = true;

        let err = execute(config(src.path(), "/srv/dst"), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, UpError::ConnectionFailed(ref msg) if msg.contains("refused")));
        assert_eq!(store.state().ops, vec![RemoteOp::Connect]);
    }

    #[tokio::test]
    async fn test_put_failure_aborts_and_closes() {
        let src = source_tree();
        let store = MemoryStore::new();
        store.state().fail_put = Some("/srv/dst/sub/b.txt".to_string());

        let err = execute(config(src.path(), "/srv/dst"), &store)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UpError::RemoteOperationFailed { ref cause } if cause.contains("permission denied")
        ));

        // 不回滚：之前的目录和文件仍然存在
        let state = store.state();
        assert!(state.files.contains_key("/srv/dst/a.txt"));
        assert!(state.dirs.contains("/srv/dst/sub"));
        assert_eq!(state.ops.last(), Some(&RemoteOp::Close));
    }

    #[tokio::test]
    async fn test_local_path_missing_before_connect() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let err = execute(config(&dir.path().join("missing"), "/srv"), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, UpError::LocalPathNotFound(_)));
        assert!(store.state().ops.is_empty());
    }

    #[tokio::test]
    async fn test_excluded_entries_not_uploaded() {
        let src = source_tree();
        fs::write(src.path().join("sub/c.log"), b"log").unwrap();
        let mut config = config(src.path(), "/srv/dst");
        config.exclude = vec!["**/*.log".to_string()];

        let store = MemoryStore::new();
        let report = execute(config, &store).await.unwrap();
        assert_eq!(report.files_uploaded, 2);
        assert!(!store.state().files.contains_key("/srv/dst/sub/c.log"));
    }

    #[tokio::test]
    async fn test_phase_events() {
        let src = source_tree();
        let store = MemoryStore::new();
        let (tx, rx) = mpsc::channel(64);

        let engine = UploadEngine::new(config(src.path(), "/srv/dst"));
        engine.run(&store, Some(tx)).await.unwrap();

        let events = drain(rx);
        let phases: Vec<UploadPhase> = events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Phase(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                UploadPhase::ConfigLoaded,
                UploadPhase::Scanned,
                UploadPhase::Connected,
                UploadPhase::DirsEnsured,
                UploadPhase::FilesUploaded,
            ]
        );
        let uploaded = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::FileUploaded { .. }))
            .count();
        assert_eq!(uploaded, 2);
        assert!(events.contains(&UploadEvent::DirCreated("/srv/dst/sub".to_string())));
    }

    #[tokio::test]
    async fn test_phase_tracks_run() {
        let src = source_tree();
        let engine = UploadEngine::new(config(src.path(), "/srv/dst"));
        assert_eq!(engine.phase(), UploadPhase::Idle);
        engine.run(&MemoryStore::new(), None).await.unwrap();
        assert_eq!(engine.phase(), UploadPhase::FilesUploaded);

        let store = MemoryStore::new();
        store.state().refuse_connect = true;
        let engine = UploadEngine::new(config(src.path(), "/srv/dst"));
        assert!(engine.run(&store, None).await.is_err());
        assert_eq!(engine.phase(), UploadPhase::Failed);
    }

    #[tokio::test]
    async fn test_undrained_progress_channel_does_not_block() {
        let src = tempfile::tempdir().unwrap();
        for i in 0..10 {
            fs::write(src.path().join(format!("f{i}.txt")), b"x").unwrap();
        }
        let store = MemoryStore::new();
        let (tx, rx) = mpsc::channel(1);

        let engine = UploadEngine::new(config(src.path(), "/srv/dst"));
        let report = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            engine.run(&store, Some(tx)),
        )
        .await
        .expect("upload blocked on the progress channel")
        .unwrap();

        assert_eq!(report.files_uploaded, 10);
        assert_eq!(
            drain(rx),
            vec![UploadEvent::Phase(UploadPhase::ConfigLoaded)]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_connect() {
        let src = source_tree();
        let store = MemoryStore::new();
        let (tx, rx) = mpsc::channel(8);

        let engine = UploadEngine::new(config(src.path(), "/srv/dst"));
        engine.cancel();
        let err = engine.run(&store, Some(tx)).await.unwrap_err();

        assert!(matches!(err, UpError::Cancelled));
        assert!(store.state().ops.is_empty());
        assert_eq!(
            drain(rx),
            vec![
                UploadEvent::Phase(UploadPhase::ConfigLoaded),
                UploadEvent::Phase(UploadPhase::Failed),
            ]
        );
    }
}
