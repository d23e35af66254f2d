//! 分片下载器：任务级的启动、暂停、继续与关闭
//!
//! 锁顺序固定为 任务锁 -> 分片锁 -> 请求锁。连接完成回调只持有分片，
//! 从不获取任务锁；需要汇总任务状态时先释放分片锁。

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::core::error::{DownloadError, DownloadResult};
use crate::core::transport::Transport;
use super::callback::DownloadCallback;
use super::model::{now_millis, validate_chunks, ChunkSlot, DownloadChunk, DownloadTask, TaskContext, TaskSnapshot};
use super::registry::{Attr, ResourceRegistry};
use super::retry::RetryOutcome;
use super::state::{ChunkStatus, TaskStatus};
use super::strategy::DownloadStrategy;
use super::util;

pub struct ChunkedDownloader {
    pub(crate) ctx: TaskContext,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) strategy: Arc<dyn DownloadStrategy>,
    pub(crate) callback: Option<Arc<dyn DownloadCallback>>,
    pub(crate) registry: ResourceRegistry,
    /// 连接建立与回调所在的运行时
    pub(crate) runtime: Handle,
}

impl ChunkedDownloader {
    pub fn new(
        ctx: TaskContext,
        transport: Arc<dyn Transport>,
        strategy: Arc<dyn DownloadStrategy>,
        runtime: Handle,
    ) -> Self {
        Self {
            ctx,
            transport,
            strategy,
            callback: None,
            registry: ResourceRegistry::new(),
            runtime,
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn DownloadCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn task(&self) -> &DownloadTask {
        &self.ctx.task
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.ctx.task.snapshot()
    }

    /// 启动任务：重建分片列表、清理旧文件、创建目录，然后为每个分片发起连接。
    ///
    /// 准备阶段的任何失败都以 `DownloadError::Setup` 返回，此时不会发起任何连接，
    /// 也不会触发 `on_start`。`on_start` 在所有分片的连接发起之后（而非完成之后）触发。
    pub fn start(self: &Arc<Self>) -> DownloadResult<()> {
        let task = &self.ctx.task;
        let chunks = self.strategy.build_chunks(task).map_err(DownloadError::into_setup)?;
        validate_chunks(&chunks, task.total_size, task.support_range)?;
        util::delete_if_exists(&task.task_file_path())?;
        util::create_dir_smart(&task.file_path)?;
        self.strategy.prepare(&self.ctx).map_err(DownloadError::into_setup)?;

        {
            let mut state = task.lock();
            for old in &state.chunks {
                let info = old.lock();
                old.invalidate_attempt();
                self.close_chunk(&info);
            }
            state.chunks = chunks.into_iter().map(|c| Arc::new(ChunkSlot::new(c))).collect();
            state.reset();
            let now = now_millis();
            state.status = TaskStatus::Running;
            state.start_time = now;
            state.last_time = now;
            for chunk in &state.chunks {
                let mut info = chunk.lock();
                info.start_time = now;
                info.last_time = now;
                self.issue_connect(chunk, &mut info, ChunkStatus::ConnectingNormal);
            }
            log::info!("任务开始下载: {} ({} 个分片)", task.file_name, state.chunks.len());
        }

        if let Some(callback) = &self.callback {
            callback.on_start(&self.ctx);
        }
        Ok(())
    }

    /// 暂停任务：关闭所有分片的连接与文件句柄，未完成的分片置为 `Pause`。
    ///
    /// 可重复调用。任务未运行（尚未启动、合并中或已结束）时返回 `Precondition`。
    pub fn pause(&self) -> DownloadResult<()> {
        {
            let mut state = self.ctx.task.lock();
            match state.status {
                TaskStatus::Running | TaskStatus::Pause => {}
                ref other => {
                    return Err(DownloadError::Precondition(format!("任务状态为 {:?}，无法暂停", other)));
                }
            }
            let now = now_millis();
            state.status = TaskStatus::Pause;
            state.last_time = now;
            for chunk in &state.chunks {
                let mut info = chunk.lock();
                chunk.invalidate_attempt();
                self.close_chunk(&info);
                if info.status != ChunkStatus::Done {
                    info.status = ChunkStatus::Pause;
                    info.last_time = now;
                }
            }
        }
        log::info!("任务已暂停: {}", self.ctx.task.file_name);
        if let Some(callback) = &self.callback {
            callback.on_pause(&self.ctx);
        }
        Ok(())
    }

    /// 继续任务：累计暂停时长，并以 `ConnectingNormal` 重新连接所有暂停中的分片。
    ///
    /// 任务不处于暂停状态或策略的 `can_continue` 拒绝时返回 `Precondition`，
    /// 不修改任何状态，也不触发通知。
    pub fn resume(self: &Arc<Self>) -> DownloadResult<()> {
        let mut finished = Vec::new();
        {
            let mut state = self.ctx.task.lock();
            if state.status != TaskStatus::Pause {
                return Err(DownloadError::Precondition(format!("任务状态为 {:?}，无需继续", state.status)));
            }
            if !self.strategy.can_continue(&self.ctx)? {
                return Err(DownloadError::Precondition(format!("{} 的下载文件不可用", self.ctx.task.file_name)));
            }
            let now = now_millis();
            state.pause_time += now - state.last_time;
            state.last_time = now;
            state.status = TaskStatus::Running;
            let pause_time = state.pause_time;
            for chunk in &state.chunks {
                let mut info = chunk.lock();
                if info.status == ChunkStatus::Pause {
                    info.pause_time = pause_time;
                    info.last_time = now;
                    if let RetryOutcome::Done(done) = self.retry_locked(chunk, &mut info, ChunkStatus::ConnectingNormal) {
                        finished.push(done);
                    }
                }
            }
        }
        log::info!("任务继续下载: {}", self.ctx.task.file_name);
        if let Some(callback) = &self.callback {
            callback.on_continue(&self.ctx);
        }
        if !finished.is_empty() {
            for chunk in &finished {
                self.notify_chunk_done(chunk);
            }
            self.check_finished();
        }
        Ok(())
    }

    /// 关闭所有分片的资源，不改变任何状态
    pub fn close(&self) {
        let state = self.ctx.task.lock();
        for chunk in &state.chunks {
            let info = chunk.lock();
            chunk.invalidate_attempt();
            self.close_chunk(&info);
        }
    }

    /// 关闭分片的连接和文件句柄并删除资源表条目。须持有该分片的锁调用。
    ///
    /// 每个句柄独立关闭，失败只记录日志。
    pub fn close_chunk(&self, chunk: &DownloadChunk) {
        let Some(attrs) = self.registry.remove(chunk.index) else {
            return;
        };
        for attr in attrs.into_values() {
            match attr {
                Attr::Channel(channel) => {
                    log::debug!("下载连接关闭：channelId[{}]\t#{}", channel.id(), chunk.index);
                    if let Err(e) = channel.close() {
                        log::error!("关闭分片 {} 的连接失败: {}", chunk.index, e);
                    }
                }
                Attr::FileWriters(writers) => {
                    for writer in writers {
                        if let Err(e) = writer.close() {
                            log::error!("关闭分片 {} 的文件失败: {}", chunk.index, e);
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn notify_chunk_done(&self, chunk: &DownloadChunk) {
        log::debug!("分片下载完成: {:?}", chunk);
        if let Some(callback) = &self.callback {
            callback.on_chunk_done(&self.ctx, chunk);
        }
    }

    /// 所有分片完成时进入合并；只有把任务从 `Running` 切到 `Merging` 的调用者执行合并
    pub(crate) fn check_finished(self: &Arc<Self>) {
        {
            let mut state = self.ctx.task.lock();
            if state.status != TaskStatus::Running {
                return;
            }
            if !state.chunks.iter().all(|c| c.lock().status == ChunkStatus::Done) {
                return;
            }
            state.status = TaskStatus::Merging;
        }
        let this = Arc::clone(self);
        self.runtime.spawn_blocking(move || this.merge_and_finish());
    }

    fn merge_and_finish(&self) {
        let result = self.strategy.merge(&self.ctx);
        {
            let mut state = self.ctx.task.lock();
            state.last_time = now_millis();
            state.status = match &result {
                Ok(()) => TaskStatus::Done,
                Err(e) => TaskStatus::Failed(e.to_string()),
            };
        }
        match result {
            Ok(()) => {
                log::info!("下载完成: {}", self.ctx.task.task_file_path().display());
                if let Some(callback) = &self.callback {
                    callback.on_done(&self.ctx);
                }
            }
            Err(e) => {
                log::error!("合并失败: {} - {}", self.ctx.task.file_name, e);
                if let Some(callback) = &self.callback {
                    callback.on_error(&self.ctx, &e);
                }
            }
        }
    }

    /// 放弃任务：关闭全部资源，任务置为 `Failed` 并触发 `on_error`。
    ///
    /// 合并中或已结束的任务不受影响，返回 `false`。
    pub fn fail(&self, error: DownloadError) -> bool {
        {
            let mut state = self.ctx.task.lock();
            if state.status == TaskStatus::Merging || state.status.is_terminal() {
                return false;
            }
            state.status = TaskStatus::Failed(error.to_string());
            state.last_time = now_millis();
            for chunk in &state.chunks {
                let info = chunk.lock();
                chunk.invalidate_attempt();
                self.close_chunk(&info);
            }
        }
        log::error!("任务失败: {} - {}", self.ctx.task.file_name, error);
        if let Some(callback) = &self.callback {
            callback.on_error(&self.ctx, &error);
        }
        true
    }
}
