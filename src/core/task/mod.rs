//! `task` 模块包含了单个分片下载任务的全部逻辑
//!
//! 主要包括：
//! - `model`: 任务、分片、请求等数据模型
//! - `state`: 任务状态 `TaskStatus` 与分片状态 `ChunkStatus`
//! - `downloader`: `ChunkedDownloader`，任务的启动、暂停、继续与关闭
//! - `connect`: 分片连接的发起与请求写出
//! - `retry`: 分片重试，以及重试策略
//! - `handler`: 响应解析与数据写入
//! - `registry`: 分片的连接和文件句柄
//! - `strategy`: 文件写入策略（扩展点）
//! - `callback`: 事件通知（扩展点）
//! - `util`: 文件信息探测和文件系统工具

pub mod model;
pub mod state;
pub mod downloader;
pub mod connect;
pub mod retry;
pub mod handler;
pub mod registry;
pub mod strategy;
pub mod callback;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

// 导出核心组件，方便外部使用
pub use callback::{DownloadCallback, LogCallback};
pub use downloader::ChunkedDownloader;
pub use model::{DownloadChunk, DownloadTask, ProxyConfig, RequestDescriptor, TaskContext, TaskSnapshot};
pub use registry::ResourceRegistry;
pub use retry::{RetryContext, RetryOutcome, RetryStrategy};
pub use state::{ChunkStatus, TaskStatus};
pub use strategy::{ChunkFileStrategy, DownloadStrategy, FileWriter, SeekFileStrategy, WriteStrategy};
pub use self::util::FileInfo;
