//! 上传配置模块
//!
//! 配置文件固定为调用目录下的 `up.config.json`。读取顺序：先校验必填字段，再解析类型并填默认值，
//! 最后把 localPath 解析为绝对路径。

use crate::error::{ConfigIssue, Result, UpError};
use crate::logging::LogConfig;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// 默认配置文件名
pub const CONFIG_FILE_NAME: &str = "up.config.json";

/// 必填字段，按报告顺序排列
const REQUIRED_FIELDS: [&str; 5] = ["host", "username", "password", "localPath", "remotePath"];

fn default_port() -> u16 {
    22
}

fn default_timeout_secs() -> u64 {
    20
}

/// 连接参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// 建立连接（TCP + 握手 + 认证）的超时秒数，0 表示不限制
    pub timeout_secs: u64,
}

/// 校验并规范化后的配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpConfig {
    pub connect: ConnectConfig,
    /// 绝对路径
    pub local_path: PathBuf,
    /// 绝对路径，已去掉末尾的 `/`（根目录除外）
    pub remote_path: String,
    pub exclude: Vec<String>,
    pub log: LogConfig,
}

/// 配置文件的原始形态，所有字段都可能缺失
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default, deserialize_with = "lenient_string")]
    host: Option<String>,
    port: Option<u16>,
    #[serde(default, deserialize_with = "lenient_string")]
    username: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    password: Option<String>,
    local_path: Option<String>,
    remote_path: Option<String>,
    exclude: Option<Vec<String>>,
    timeout: Option<u64>,
    log: Option<LogConfig>,
}

/// 主机、用户名、密码允许写成数字，例如纯数字密码
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "invalid type: {}, expected a string",
            other
        ))),
    }
}

/// 与 JSON 的真值判断一致：缺失、null、空字符串、0、false 都视为未填写
fn is_filled(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// 在类型解析之前校验：先列出所有缺失的必填字段，再检查 remotePath 是否为绝对路径
fn validate(fields: &Map<String, Value>) -> Result<()> {
    let missing: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|name| !is_filled(fields.get(**name)))
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ConfigIssue::MissingFields(missing).into());
    }

    match fields.get("remotePath") {
        Some(Value::String(remote_path)) if remote_path.starts_with('/') => Ok(()),
        Some(Value::String(remote_path)) => {
            Err(ConfigIssue::RelativeRemotePath(remote_path.clone()).into())
        }
        other => Err(ConfigIssue::RelativeRemotePath(
            other.map(Value::to_string).unwrap_or_default(),
        )
        .into()),
    }
}

impl UpConfig {
    /// 从配置文件加载，localPath 相对于当前工作目录解析
    pub fn load(path: &Path) -> Result<Self> {
        info!("读取配置文件: {}", path.display());
        if !path.exists() {
            return Err(UpError::ConfigNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        let cwd = std::env::current_dir()?;
        let config = Self::parse_str(&content, &cwd)?;
        info!("配置文件校验通过");
        Ok(config)
    }

    /// 从 JSON 文本解析配置，localPath 相对于 `cwd` 解析
    pub fn parse_str(content: &str, cwd: &Path) -> Result<Self> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| ConfigIssue::Malformed(e.to_string()))?;
        let Some(fields) = value.as_object() else {
            return Err(ConfigIssue::Malformed("expected a JSON object".to_string()).into());
        };
        validate(fields)?;

        let raw: RawConfig = serde_json::from_value(value)
            .map_err(|e| ConfigIssue::Malformed(e.to_string()))?;

        let RawConfig {
            host,
            port,
            username,
            password,
            local_path,
            remote_path,
            exclude,
            timeout,
            log,
        } = raw;

        Ok(Self {
            connect: ConnectConfig {
                host: host.unwrap_or_default(),
                port: port.unwrap_or_else(default_port),
                username: username.unwrap_or_default(),
                password: password.unwrap_or_default(),
                timeout_secs: timeout.unwrap_or_else(default_timeout_secs),
            },
            local_path: resolve_local_path(cwd, &local_path.unwrap_or_default()),
            remote_path: normalize_remote_root(&remote_path.unwrap_or_default()),
            exclude: exclude.unwrap_or_default(),
            log: log.unwrap_or_default(),
        })
    }

    /// 用于确认提示的展示文本，密码以星号代替
    pub fn display(&self) -> String {
        let masked = if self.connect.password.is_empty() { "" } else { "********" };
        let value = serde_json::json!({
            "host": self.connect.host,
            "port": self.connect.port,
            "username": self.connect.username,
            "password": masked,
            "localPath": self.local_path.display().to_string(),
            "remotePath": self.remote_path,
            "exclude": self.exclude,
            "timeout": self.connect.timeout_secs,
        });
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
    }

    /// 写入配置模板（--init），文件已存在时报错
    pub fn write_template(path: &Path) -> Result<()> {
        if path.exists() {
            return Err(UpError::ConfigExists(path.to_path_buf()));
        }
        let template = serde_json::json!({
            "host": "127.0.0.1",
            "port": default_port(),
            "username": "root",
            "password": "",
            "localPath": "./dist",
            "remotePath": "/var/www/html",
            "exclude": ["**/.DS_Store"],
            "timeout": default_timeout_secs(),
            "log": LogConfig::default(),
        });
        let content = serde_json::to_string_pretty(&template)
            .map_err(|e| UpError::Io(std::io::Error::other(e)))?;
        fs::write(path, content + "\n")?;
        Ok(())
    }
}

/// 按词法把 `local` 解析为绝对路径（不跟随符号链接）
fn resolve_local_path(cwd: &Path, local: &str) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in cwd.join(local).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved
}

fn normalize_remote_root(remote: &str) -> String {
    let trimmed = remote.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
