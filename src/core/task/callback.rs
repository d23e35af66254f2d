use crate::core::error::DownloadError;
use super::model::{DownloadChunk, TaskContext};

/// 下载事件通知
///
/// 回调可能在任意工作线程上执行，不同分片的回调之间没有先后保证；
/// 实现不应长时间阻塞，也不应在回调中同步等待下载器的其他操作完成。
pub trait DownloadCallback: Send + Sync {
    fn on_start(&self, _ctx: &TaskContext) {}

    fn on_pause(&self, _ctx: &TaskContext) {}

    fn on_continue(&self, _ctx: &TaskContext) {}

    fn on_chunk_done(&self, _ctx: &TaskContext, _chunk: &DownloadChunk) {}

    /// 所有分片完成且合并成功
    fn on_done(&self, _ctx: &TaskContext) {}

    fn on_error(&self, _ctx: &TaskContext, _error: &DownloadError) {}
}

/// 只记录日志的回调
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCallback;

impl DownloadCallback for LogCallback {
    fn on_start(&self, ctx: &TaskContext) {
        log::info!("任务开始: {} ({} 字节)", ctx.task.file_name, ctx.task.total_size);
    }

    fn on_pause(&self, ctx: &TaskContext) {
        log::info!("任务暂停: {}", ctx.task.file_name);
    }

    fn on_continue(&self, ctx: &TaskContext) {
        log::info!("任务继续: {}", ctx.task.file_name);
    }

    fn on_chunk_done(&self, ctx: &TaskContext, chunk: &DownloadChunk) {
        log::debug!("分片完成: {} #{} ({} 字节)", ctx.task.file_name, chunk.index, chunk.down_size);
    }

    fn on_done(&self, ctx: &TaskContext) {
        log::info!("任务完成: {}", ctx.task.task_file_path().display());
    }

    fn on_error(&self, ctx: &TaskContext, error: &DownloadError) {
        log::error!("任务失败: {} - {}", ctx.task.file_name, error);
    }
}
