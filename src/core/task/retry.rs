use std::sync::Arc;
use std::time::{Duration, Instant};

use super::downloader::ChunkedDownloader;
use super::model::{now_millis, ChunkRef, DownloadChunk};
use super::state::{ChunkStatus, TaskStatus};

/// 一次分片重试的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// 分片其实已下载完毕，直接标记为完成
    Done(DownloadChunk),
    /// 已发起新的连接
    Reconnecting,
    /// 任务未在运行，或分片已暂停、已完成，什么都没做
    Skipped,
}

impl ChunkedDownloader {
    /// 以 `ConnectingFail` 重试分片
    pub fn retry_chunk(self: &Arc<Self>, chunk: &ChunkRef) -> RetryOutcome {
        self.retry_chunk_with(chunk, ChunkStatus::ConnectingFail)
    }

    /// 关闭分片现有资源后重新连接。
    ///
    /// 只对运行中任务里未暂停、未完成的分片生效，否则返回 `Skipped`。
    /// 已下载字节数等于分片大小时不再连接，分片直接完成并触发 `on_chunk_done`。
    /// 支持分段时从 `ori_start + down_size` 续传，否则从头下载。
    pub fn retry_chunk_with(self: &Arc<Self>, chunk: &ChunkRef, status: ChunkStatus) -> RetryOutcome {
        let outcome = {
            let state = self.ctx.task.lock();
            let mut info = chunk.lock();
            if state.status != TaskStatus::Running {
                log::debug!("任务状态为 {:?}，不重试分片 #{}", state.status, info.index);
                RetryOutcome::Skipped
            } else if matches!(info.status, ChunkStatus::Pause | ChunkStatus::Done) {
                log::debug!("分片 #{} 状态为 {:?}，不重试", info.index, info.status);
                RetryOutcome::Skipped
            } else {
                self.retry_locked(chunk, &mut info, status)
            }
        };
        if let RetryOutcome::Done(done) = &outcome {
            self.notify_chunk_done(done);
            self.check_finished();
        }
        outcome
    }

    /// 须持有任务锁和分片锁调用，不检查状态（继续下载时分片仍是 `Pause`）；
    /// 完成通知由调用者在释放锁之后发出
    pub(crate) fn retry_locked(
        self: &Arc<Self>,
        chunk: &ChunkRef,
        info: &mut DownloadChunk,
        status: ChunkStatus,
    ) -> RetryOutcome {
        chunk.invalidate_attempt();
        self.close_chunk(info);
        if info.is_complete() {
            info.status = ChunkStatus::Done;
            info.last_time = now_millis();
            return RetryOutcome::Done(info.clone());
        }
        if self.ctx.task.support_range {
            info.now_start = info.resume_position();
        }
        self.issue_connect(chunk, info, status);
        RetryOutcome::Reconnecting
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64, // 抖动因子，避免重试风暴
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryStrategy {
    pub fn can_retry(&self, retry_count: usize) -> bool {
        retry_count < self.max_retries
    }

    pub fn get_delay(&self, retry_count: usize) -> Duration {
        let delay_secs = self.base_delay.as_secs_f64() *
            self.backoff_multiplier.powi(retry_count as i32);

        let jitter = delay_secs * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = delay_secs + jitter;

        let delay = Duration::from_secs_f64(final_delay.max(0.1)); // 最小延迟100ms
        delay.min(self.max_delay)
    }
}

/// 单个分片的重试记录
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub retry_count: usize,
    pub next_retry_at: Option<Instant>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self { retry_count: 0, next_retry_at: None }
    }

    /// 第一次发现失败时只安排时间，到期后才真正重试
    pub fn is_due(&mut self, strategy: &RetryStrategy, now: Instant) -> bool {
        match self.next_retry_at {
            Some(at) => now >= at,
            None => {
                self.next_retry_at = Some(now + strategy.get_delay(self.retry_count));
                false
            }
        }
    }

    pub fn record_retry(&mut self) {
        self.retry_count += 1;
        self.next_retry_at = None;
    }

    pub fn is_exhausted(&self, strategy: &RetryStrategy) -> bool {
        !strategy.can_retry(self.retry_count)
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use crate::core::task::testing::*;

    #[tokio::test]
    async fn test_retry_of_finished_chunk_completes_without_connecting() {
        let dir = temp_dir();
        let h = Harness::new(&dir, 1000, true, 2);
        h.downloader.start().unwrap();
        assert!(wait_until(|| h.transport.connect_count() == 2).await);

        let chunk = h.downloader.task().chunks()[1].clone();
        chunk.lock().down_size = 500;
        let outcome = h.downloader.retry_chunk(&chunk);

        assert!(matches!(outcome, RetryOutcome::Done(ref c) if c.index == 1));
        assert_eq!(chunk.snapshot().status, ChunkStatus::Done);
        assert_eq!(h.callback.count(|e| *e == Event::ChunkDone(1)), 1);
        assert!(!h.downloader.registry().contains(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.transport.connect_count(), 2);
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_retry_resumes_from_downloaded_offset() {
        let dir = temp_dir();
        let h = Harness::new(&dir, 1000, true, 2);
        h.downloader.start().unwrap();
        assert!(wait_until(|| h.downloader.registry().len() == 2).await);

        let chunk = h.downloader.task().chunks()[1].clone();
        chunk.lock().down_size = 200;
        let outcome = h.downloader.retry_chunk(&chunk);

        assert_eq!(outcome, RetryOutcome::Reconnecting);
        let info = chunk.snapshot();
        assert_eq!(info.status, ChunkStatus::ConnectingFail);
        assert_eq!(info.now_start, 700);
        assert_eq!(info.ori_start, 500);
        assert!(wait_until(|| h.transport.connections().len() == 3).await);
        assert!(wait_until(|| !h.transport.connections()[2].writes().is_empty()).await);
        assert_eq!(
            header_of(&h.transport.connections()[2].written_text(), crate::core::task::model::RANGE),
            Some("bytes=700-999".to_string())
        );
        // 旧连接已关闭
        assert_eq!(h.transport.connections().iter().filter(|c| c.is_closed()).count(), 1);
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_last_chunk_finished_by_retry_completes_task() {
        let dir = temp_dir();
        let h = Harness::new(&dir, 1000, true, 2);
        h.downloader.start().unwrap();
        let chunks = h.downloader.task().chunks();
        chunks[0].lock().status = ChunkStatus::Done;
        chunks[1].lock().down_size = 500;

        h.downloader.retry_chunk_with(&chunks[1], ChunkStatus::ConnectingNormal);
        assert!(wait_until(|| h.downloader.task().status() == TaskStatus::Done).await);
        assert_eq!(h.strategy.merge_count(), 1);
        assert_eq!(h.callback.count(|e| *e == Event::Done), 1);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_get_delay_is_bounded() {
        let strategy = RetryStrategy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        };
        let first = strategy.get_delay(0);
        assert!(first >= Duration::from_millis(950) && first <= Duration::from_millis(1050));
        assert_eq!(strategy.get_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_can_retry() {
        let strategy = RetryStrategy::default();
        assert!(strategy.can_retry(0));
        assert!(strategy.can_retry(2));
        assert!(!strategy.can_retry(3));
    }

    #[tokio::test]
    async fn test_retry_on_paused_task_is_skipped() {
        let dir = temp_dir();
        let h = Harness::new(&dir, 1000, true, 2);
        h.downloader.start().unwrap();
        assert!(wait_until(|| h.downloader.registry().len() == 2).await);
        h.downloader.pause().unwrap();

        let chunk = h.downloader.task().chunks()[0].clone();
        assert_eq!(h.downloader.retry_chunk(&chunk), RetryOutcome::Skipped);
        assert_eq!(chunk.snapshot().status, ChunkStatus::Pause);
        assert_eq!(h.downloader.task().status(), TaskStatus::Pause);
        assert!(h.downloader.registry().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.transport.connect_count(), 2);
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_retry_before_start_is_skipped() {
        let dir = temp_dir();
        let h = Harness::new(&dir, 1000, true, 1);
        let chunk = std::sync::Arc::new(crate::core::task::model::ChunkSlot::new(DownloadChunk::new(0, 0, 999)));
        assert_eq!(h.downloader.retry_chunk(&chunk), RetryOutcome::Skipped);
        assert_eq!(h.transport.connect_count(), 0);
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_retry_keeps_done_chunk_with_incomplete_counters() {
        let dir = temp_dir();
        let h = Harness::new(&dir, 1000, true, 2);
        h.downloader.start().unwrap();
        assert!(wait_until(|| h.downloader.registry().len() == 2).await);
        let chunk = h.downloader.task().chunks()[0].clone();
        chunk.lock().status = ChunkStatus::Done;

        assert_eq!(h.downloader.retry_chunk(&chunk), RetryOutcome::Skipped);
        assert_eq!(chunk.snapshot().status, ChunkStatus::Done);
        assert_eq!(h.callback.count(|e| matches!(e, Event::ChunkDone(_))), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.transport.connect_count(), 2);
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_retry_after_empty_streamed_download_is_skipped() {
        let dir = temp_dir();
        let h = Harness::new(&dir, 0, false, 1);
        h.downloader.start().unwrap();
        assert!(wait_until(|| h.transport.handlers().len() == 1).await);
        let handler = h.transport.handlers()[0].clone();
        assert!(handler.on_read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap());
        handler.on_eof();

        let chunk = h.downloader.task().chunks()[0].clone();
        assert_eq!(chunk.snapshot().status, ChunkStatus::Done);
        assert!(wait_until(|| h.downloader.task().status() == TaskStatus::Done).await);
        assert_eq!(h.downloader.retry_chunk(&chunk), RetryOutcome::Skipped);
        assert_eq!(chunk.snapshot().status, ChunkStatus::Done);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.transport.connect_count(), 1);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_retry_context_schedules_then_fires() {
        let strategy = RetryStrategy {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            ..RetryStrategy::default()
        };
        let mut ctx = RetryContext::new();
        let now = Instant::now();
        assert!(!ctx.is_due(&strategy, now));
        assert!(!ctx.is_due(&strategy, now));
        assert!(ctx.is_due(&strategy, now + Duration::from_secs(1)));
        ctx.record_retry();
        assert!(ctx.is_exhausted(&strategy));
    }
}
