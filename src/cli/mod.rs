//! CLI: 命令行接口和参数解析模块
//!
//! ## 支持的命令
//!
//! - 基本下载：`multidown <url>`
//! - 指定连接数：`multidown -n 8 <url>`
//! - 通过代理：`multidown -x 127.0.0.1:8888 <url>`
//! - 编辑配置：`multidown -e`
//! - 指定配置：`multidown -c config.conf <url>`

use clap::Parser;
use std::env;
use crate::config::Config;
use crate::core::error::{DownloadError, DownloadResult};
use crate::core::task::WriteStrategy;
use crate::utils::validator;

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/multidown/multidown.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/multidown/multidown.conf", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/multidown/multidown.conf", home)
    }
}

/// 用系统编辑器打开配置文件
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 xdg-open，否则 nano
        if std::process::Command::new("xdg-open").arg(config_path).status().is_err() {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\n构建时间: ", env!("VERGEN_BUILD_TIMESTAMP"),
    "\n提交: ", env!("VERGEN_GIT_SHA"),
);

/// MultiDown 命令行参数
///
/// 示例用法：
///   multidown https://example.com/file.zip
///   multidown -n 8 -d ./downloads https://example.com/file.zip
///   multidown -e  # 编辑配置文件
#[derive(Parser, Debug, Clone)]
#[command(
    name = "multidown",
    author = "panzhifu",
    version = env!("CARGO_PKG_VERSION"),
    long_version = LONG_VERSION,
    about = "一个用 Rust 编写的多连接、可断点续传的 HTTP 下载器",
    long_about = "按 Range 把文件切成多个分片并发下载，支持暂停/继续、失败分片自动重试和 HTTP 代理。\n\n示例：\n  multidown https://example.com/file.zip\n  multidown -n 8 -s chunk_file https://example.com/file.zip\n  multidown -e\n"
)]
pub struct Args {
    /// 要下载的URL
    #[arg(required_unless_present = "edit_config", help = "要下载的URL（http 或 https）。")]
    pub url: Option<String>,

    /// 连接数
    #[arg(short = 'n', long, help = "每个任务的连接数，覆盖配置文件中的设置。")]
    pub connections: Option<usize>,

    /// 下载目录
    #[arg(short = 'd', long, help = "下载目录，覆盖配置文件中的设置。")]
    pub download_dir: Option<String>,

    /// 输出文件名
    #[arg(short = 'o', long, help = "输出文件名，默认从URL推断。")]
    pub output: Option<String>,

    /// 配置文件路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    /// HTTP 代理
    #[arg(short = 'x', long, help = "HTTP 代理地址，如 127.0.0.1:8888。")]
    pub proxy: Option<String>,

    /// 写入策略
    #[arg(short = 's', long, help = "写入策略：seek 或 chunk_file。")]
    pub strategy: Option<WriteStrategy>,

    /// 编辑配置文件
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,
}

impl Args {
    /// 加载配置、合并命令行参数并校验
    pub fn load_config(&self) -> DownloadResult<Config> {
        let mut config = Config::load(&self.config)?;
        config.merge_from_args(self);
        config.validate()?;
        Ok(config)
    }

    /// 校验并返回下载地址
    pub fn target_url(&self) -> DownloadResult<&str> {
        let url = self.url.as_deref()
            .ok_or_else(|| DownloadError::InvalidUrl("未提供下载地址".to_string()))?;
        validator::validate_url(url)?;
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::testing::temp_dir;

    #[test]
    fn test_args_parsing() {
        let args = Args::try_parse_from(["multidown", "-n", "8", "-o", "a.zip", "https://example.com/file.zip"]).unwrap();
        assert_eq!(args.connections, Some(8));
        assert_eq!(args.output.as_deref(), Some("a.zip"));
        assert_eq!(args.target_url().unwrap(), "https://example.com/file.zip");
        assert!(!args.edit_config);
    }

    #[test]
    fn test_url_required_unless_editing() {
        assert!(Args::try_parse_from(["multidown"]).is_err());
        let args = Args::try_parse_from(["multidown", "-e"]).unwrap();
        assert!(args.edit_config);
        assert!(args.target_url().is_err());
    }

    #[test]
    fn test_strategy_argument() {
        let args = Args::try_parse_from(["multidown", "-s", "chunk_file", "http://example.com/a"]).unwrap();
        assert_eq!(args.strategy, Some(WriteStrategy::ChunkFile));
        assert!(Args::try_parse_from(["multidown", "-s", "mmap", "http://example.com/a"]).is_err());
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let args = Args::try_parse_from(["multidown", "ftp://example.com/a"]).unwrap();
        assert!(matches!(args.target_url(), Err(DownloadError::InvalidUrl(_))));
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let dir = temp_dir();
        let path = dir.join("multidown.conf");
        let args = Args::try_parse_from([
            "multidown", "-c", path.to_str().unwrap(), "-n", "2", "http://example.com/a",
        ]).unwrap();
        let config = args.load_config().unwrap();
        assert_eq!(config.connections, 2);
        assert!(path.exists());
        std::fs::remove_dir_all(dir).ok();
    }
}
