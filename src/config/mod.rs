use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::LevelFilter;
use crate::core::error::{DownloadError, DownloadResult};
use crate::core::task::{ProxyConfig, RetryStrategy, WriteStrategy};

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 默认下载目录
    pub download_dir: String,
    /// 每个任务的连接数（分片数）
    pub connections: usize,
    /// 连接超时时间（秒）
    pub timeout: u64,
    /// User-Agent
    pub user_agent: String,
    /// HTTP 代理，如 `127.0.0.1:8888`
    pub proxy: Option<String>,
    /// 文件写入策略
    pub write_strategy: WriteStrategy,
    /// 每个分片的重试次数
    pub retry_count: usize,
    /// 重试延迟（秒）
    pub retry_delay: u64,
    /// 最大重试延迟（秒）
    pub retry_max_delay: u64,
    /// 日志文件，不设置时输出到终端
    pub log_file: Option<String>,
    /// 日志级别
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            connections: 4,
            timeout: 30,
            user_agent: "MultiDown/2.0".to_string(),
            proxy: None,
            write_strategy: WriteStrategy::Seek,
            retry_count: 3,
            retry_delay: 2,
            retry_max_delay: 60,
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// 加载配置文件，不存在时写入带教程的默认配置
    pub fn load(path: &str) -> DownloadResult<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    log::warn!("配置文件格式错误: {}，将使用默认配置", e);
                    Ok(Config::default())
                }
            }
        } else {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            Ok(config)
        }
    }

    /// 保存带教程的配置文件（唯一写入方法）
    pub fn save_with_tutorial(&self, path: &str) -> DownloadResult<()> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }
        let tutorial_content = Config::generate_tutorial_content();
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| DownloadError::Config(format!("无法序列化配置: {}", e)))?;
        let full_content = format!("{}\n\n{}", tutorial_content, config_content);
        fs::write(path, full_content)?;
        Ok(())
    }

    fn generate_tutorial_content() -> String {
        r#"# MultiDown 配置文件
# ====================
#
# 这是一个 TOML 格式的配置文件，用于配置 MultiDown 下载引擎的行为。
#
# 配置文件位置：
# - Windows: %APPDATA%/multidown/multidown.conf
# - macOS: ~/Library/Application Support/multidown/multidown.conf
# - Linux: ~/.config/multidown/multidown.conf
#
# 命令行参数会覆盖配置文件中的设置，优先级：命令行 > 配置文件 > 默认值
#
# 使用示例：
#   multidown https://example.com/file.zip                        # 使用默认配置
#   multidown -n 8 https://example.com/file.zip                   # 使用8个连接
#   multidown -x 127.0.0.1:8888 https://example.com/file.zip      # 通过HTTP代理下载
#   multidown -s chunk_file https://example.com/file.zip          # 分片临时文件写入

# ==================== 下载设置 ====================
#
# download_dir    下载目录，支持相对路径和绝对路径
# connections     每个任务的连接数。服务器不支持 Range 或文件大小未知时只用1个连接
# write_strategy  "seek"：所有分片直接写入目标文件（默认）
#                 "chunk_file"：每个分片写入 <文件名>.parts/ 下的临时文件，完成后合并

# ==================== 网络设置 ====================
#
# timeout         建立连接的超时时间（秒）
# user_agent      请求使用的 User-Agent
# proxy           HTTP 代理地址，如 "127.0.0.1:8888"。不设置则直连

# ==================== 重试设置 ====================
#
# retry_count     每个分片连接失败后的重试次数
# retry_delay     第一次重试前的等待时间（秒），之后指数退避
# retry_max_delay 重试延迟的最大值（秒）

# ==================== 日志设置 ====================
#
# log_file        日志文件路径，不设置时输出到终端（可用 RUST_LOG 覆盖级别）
# log_level       error / warn / info / debug / trace

# ==================== 配置项 ===================="#.to_string()
    }

    /// 校验配置合法性
    pub fn validate(&self) -> DownloadResult<()> {
        if self.connections == 0 {
            return Err(DownloadError::Config("连接数必须大于0".to_string()));
        }
        if self.timeout == 0 {
            return Err(DownloadError::Config("超时时间必须大于0".to_string()));
        }
        if self.download_dir.is_empty() {
            return Err(DownloadError::Config("下载目录不能为空".to_string()));
        }
        if self.retry_max_delay < self.retry_delay {
            return Err(DownloadError::Config("最大重试延迟不能小于重试延迟".to_string()));
        }
        self.proxy_config()?;
        self.log_level
            .parse::<LevelFilter>()
            .map_err(|_| DownloadError::Config(format!("未知的日志级别: {}", self.log_level)))?;
        Ok(())
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        if let Some(dir) = &args.download_dir {
            self.download_dir = dir.clone();
        }
        if let Some(connections) = args.connections {
            self.connections = connections;
        }
        if let Some(proxy) = &args.proxy {
            self.proxy = Some(proxy.clone());
        }
        if let Some(strategy) = args.strategy {
            self.write_strategy = strategy;
        }
    }

    pub fn proxy_config(&self) -> DownloadResult<Option<ProxyConfig>> {
        self.proxy
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| p.parse::<ProxyConfig>())
            .transpose()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy {
            max_retries: self.retry_count,
            base_delay: Duration::from_secs(self.retry_delay),
            max_delay: Duration::from_secs(self.retry_max_delay),
            ..RetryStrategy::default()
        }
    }

    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }

    /// 任务记录文件
    pub fn journal_path(&self) -> PathBuf {
        Path::new(&self.download_dir).join("tasks.json")
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 下载目录: {}\n\
            - 连接数: {}\n\
            - 超时时间: {} 秒\n\
            - 代理: {}\n\
            - 写入策略: {:?}\n\
            - 重试次数: {}",
            self.download_dir,
            self.connections,
            self.timeout,
            self.proxy.as_deref().unwrap_or("直连"),
            self.write_strategy,
            self.retry_count,
        )
    }
}
