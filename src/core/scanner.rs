use crate::error::{ConfigIssue, Result, UpError};
use glob::{MatchOptions, Pattern};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 扫描结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalTree {
    /// 目录，按路径长度升序（父目录总在子目录之前）
    pub dirs: Vec<PathBuf>,
    /// 文件，按遍历顺序（同级按文件名排序）
    pub files: Vec<PathBuf>,
}

/// 排除规则（glob patterns）
///
/// `*` 只匹配单级路径，`**` 跨级匹配，大小写敏感。每个条目同时用相对于扫描根目录的路径
/// 和绝对路径去匹配，任一命中即排除。以 `/**` 结尾的规则同时排除该目录本身。
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    rules: Vec<ExcludeRule>,
}

#[derive(Debug, Clone)]
struct ExcludeRule {
    pattern: Pattern,
    /// `dir/**` 中的 `dir`，只对目录生效
    dir_pattern: Option<Pattern>,
}

fn compile(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern).map_err(|e| {
        UpError::from(ConfigIssue::ExcludePattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
    })
}

impl ExcludeSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let rules = patterns
            .iter()
            .map(|p| {
                let dir_pattern = match p.strip_suffix("/**") {
                    Some(prefix) if !prefix.is_empty() => Some(compile(prefix)?),
                    _ => None,
                };
                Ok(ExcludeRule {
                    pattern: compile(p)?,
                    dir_pattern,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    fn match_options() -> MatchOptions {
        MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        }
    }

    /// 检查路径是否应该被排除（扫描根目录本身永远不排除）
    pub fn is_excluded(&self, root: &Path, path: &Path, is_dir: bool) -> bool {
        let relative = match path.strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => return false,
            Ok(rel) => Some(rel),
            Err(_) => None,
        };
        let options = Self::match_options();
        let matches = |pattern: &Pattern| {
            relative.is_some_and(|rel| pattern.matches_path_with(rel, options))
                || pattern.matches_path_with(path, options)
        };
        self.rules.iter().any(|rule| {
            matches(&rule.pattern) || (is_dir && rule.dir_pattern.as_ref().is_some_and(matches))
        })
    }
}

/// 本地文件扫描器
pub struct LocalScanner {
    exclude: ExcludeSet,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl LocalScanner {
    pub fn new(exclude_patterns: &[String]) -> Result<Self> {
        Ok(Self {
            exclude: ExcludeSet::new(exclude_patterns)?,
            cancel_flag: None,
        })
    }

    /// 创建带取消标志的扫描器
    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(cancel_flag);
        self
    }

    /// 检查是否已取消
    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// 扫描本地路径（文件或目录）
    pub fn scan(&self, local_path: &Path) -> Result<LocalTree> {
        let metadata = match fs::metadata(local_path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(UpError::LocalPathNotFound(local_path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.is_file() {
            debug!("本地路径是文件: {}", local_path.display());
            return Ok(LocalTree {
                dirs: Vec::new(),
                files: vec![local_path.to_path_buf()],
            });
        }

        if metadata.is_dir() {
            return self.scan_dir(local_path);
        }

        Err(UpError::UnsupportedLocalPathType(local_path.to_path_buf()))
    }

    fn scan_dir(&self, root: &Path) -> Result<LocalTree> {
        info!("开始扫描本地目录: {}", root.display());

        let mut tree = LocalTree::default();
        let mut excluded_count = 0;

        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let excluded =
                    self.exclude
                        .is_excluded(root, entry.path(), entry.file_type().is_dir());
                if excluded {
                    debug!("排除: {}", entry.path().display());
                    excluded_count += 1;
                }
                !excluded
            });

        for entry in walker {
            if self.is_cancelled() {
                return Err(UpError::Cancelled);
            }

            let entry = entry.map_err(|e| UpError::LocalScanFailed {
                path: e.path().unwrap_or(root).to_path_buf(),
                reason: e.to_string(),
            })?;
            let path = entry.path();
            let file_type = entry.file_type();

            if file_type.is_dir() {
                tree.dirs.push(path.to_path_buf());
            } else if file_type.is_file() {
                tree.files.push(path.to_path_buf());
            } else if file_type.is_symlink() {
                // 不跟随符号链接：指向文件的按文件上传，其余跳过
                match fs::metadata(path) {
                    Ok(target) if target.is_file() => tree.files.push(path.to_path_buf()),
                    Ok(_) => warn!("跳过指向目录的符号链接: {}", path.display()),
                    Err(e) => warn!("跳过无效的符号链接: {} ({})", path.display(), e),
                }
            } else {
                warn!("跳过特殊文件: {}", path.display());
            }
        }

        // 父目录的路径是子目录路径的严格前缀，按长度排序即可保证父目录在前
        tree.dirs.sort_by_key(|dir| dir.as_os_str().len());

        info!(
            "扫描完成: {} 个文件, {} 个目录, {} 个被排除",
            tree.files.len(),
            tree.dirs.len(),
            excluded_count
        );

        Ok(tree)
    }
}

/// 扫描 `local_path`，跳过匹配 `exclude_patterns` 的条目
pub fn scan(local_path: &Path, exclude_patterns: &[String]) -> Result<LocalTree> {
    LocalScanner::new(exclude_patterns)?.scan(local_path)
}
