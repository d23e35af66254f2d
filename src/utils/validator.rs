use crate::core::error::{DownloadError, DownloadResult};

pub fn is_valid_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

pub fn validate_url(url: &str) -> DownloadResult<()> {
    if !is_valid_url(url) {
        return Err(DownloadError::InvalidUrl(url.to_string()));
    }
    Ok(())
}

/// 文件名不能为空，也不能包含路径分隔符
pub fn validate_file_name(name: &str) -> DownloadResult<()> {
    if name.trim().is_empty() {
        return Err(DownloadError::Config("文件名不能为空".to_string()));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(DownloadError::Config(format!("文件名不能包含路径: {}", name)));
    }
    Ok(())
}
