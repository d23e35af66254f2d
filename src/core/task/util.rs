use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{DownloadError, DownloadResult};

/// 远程文件信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// 0 表示服务器未给出长度
    pub size: u64,
    pub supports_range: bool,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

/// 用 `HEAD` 请求获取文件大小和分段下载支持情况
pub async fn probe(url: &str, user_agent: &str, timeout: Duration) -> DownloadResult<FileInfo> {
    let client = awc::Client::builder().timeout(timeout).finish();
    let response = client.head(url)
        .insert_header(("User-Agent", user_agent))
        .send()
        .await
        .map_err(|e| DownloadError::ConnectFailure(format!("{}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(DownloadError::Protocol(format!("服务器错误: {}", response.status())));
    }

    let header = |name: &str| {
        response.headers().get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    Ok(FileInfo {
        size: header("content-length")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0),
        supports_range: header("accept-ranges")
            .map(|s| s.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false),
        last_modified: header("last-modified"),
        etag: header("etag"),
    })
}

/// 删除已存在的文件；路径被目录占用时报错
pub fn delete_if_exists(path: &Path) -> DownloadResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(DownloadError::Setup(format!(
            "{} 是目录，无法作为输出文件", path.display()
        ))),
        Ok(_) => fs::remove_file(path)
            .map_err(|e| DownloadError::Setup(format!("无法删除旧文件 {}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::Setup(format!("无法访问 {}: {}", path.display(), e))),
    }
}

/// 创建目录（含父目录），已存在时什么都不做
pub fn create_dir_smart(path: &Path) -> DownloadResult<()> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(DownloadError::Setup(format!("{} 已存在且不是目录", path.display())));
    }
    fs::create_dir_all(path)
        .map_err(|e| DownloadError::Setup(format!("无法创建目录 {}: {}", path.display(), e)))
}

/// 从 URL 路径中提取文件名
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let name = parsed.path_segments()?.last()?.to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
