use thiserror::Error;
use std::io;

/// 下载引擎的错误类型
///
/// 资源释放类错误（`CloseFailure`）只在本地记录日志，永远不向调用方传播；
/// 启动和前置检查错误同步返回给调用方；连接失败只体现为分片状态变化。
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("启动失败: {0}")]
    Setup(String),

    #[error("连接失败: {0}")]
    ConnectFailure(String),

    #[error("关闭资源失败: {0}")]
    CloseFailure(String),

    #[error("无法继续下载: {0}")]
    Precondition(String),

    #[error("写入文件失败: {0}")]
    WriteFailure(String),

    #[error("响应错误: {0}")]
    Protocol(String),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("IO错误: {0}")]
    IoError(#[from] io::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("任务不存在: {0}")]
    NotFound(String),

    #[error("未知错误: {0}")]
    Unknown(String),
}

impl DownloadError {
    /// 同一分片重新连接后有可能成功的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::ConnectFailure(_) |
            DownloadError::IoError(_)
        )
    }

    /// 把 `Setup` 之外的错误包装为 `Setup`，保留原始信息
    pub fn into_setup(self) -> DownloadError {
        match self {
            DownloadError::Setup(msg) => DownloadError::Setup(msg),
            other => DownloadError::Setup(other.to_string()),
        }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
