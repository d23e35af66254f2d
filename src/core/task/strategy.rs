//! 文件写入策略
//!
//! 核心只依赖 `DownloadStrategy` 提供的能力，具体的文件布局（单文件按偏移写入，
//! 或每个分片一个临时文件再合并）由实现决定。

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Serialize, Deserialize};

use crate::core::error::{DownloadError, DownloadResult};
use super::model::{split_ranges, DownloadChunk, DownloadTask, TaskContext};

/// 可按偏移写入、可关闭的文件句柄
pub trait FileWriter: Send + Sync {
    fn write_at(&self, pos: u64, buf: &[u8]) -> DownloadResult<()>;
    fn close(&self) -> DownloadResult<()>;
}

/// 下载任务的扩展点
pub trait DownloadStrategy: Send + Sync {
    /// 任务启动时调用一次，此时目标目录已存在，旧文件已删除
    fn prepare(&self, _ctx: &TaskContext) -> DownloadResult<()> {
        Ok(())
    }

    /// 构建分片列表
    fn build_chunks(&self, task: &DownloadTask) -> DownloadResult<Vec<DownloadChunk>> {
        Ok(split_ranges(task.total_size, task.connections, task.support_range))
    }

    /// 响应头解析完成后为分片打开写入句柄
    fn open_writers(&self, ctx: &TaskContext, chunk: &DownloadChunk) -> DownloadResult<Vec<Arc<dyn FileWriter>>>;

    /// 写入分片数据（`chunk.down_size` 为写入前的值），返回写入后分片是否完成
    fn write_chunk(&self, chunk: &DownloadChunk, writers: &[Arc<dyn FileWriter>], buf: &[u8]) -> DownloadResult<bool>;

    /// 继续下载前的检查
    fn can_continue(&self, ctx: &TaskContext) -> DownloadResult<bool>;

    /// 所有分片完成后合并
    fn merge(&self, ctx: &TaskContext) -> DownloadResult<()>;
}

/// 写入策略类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// 单个文件，各分片按偏移写入
    #[default]
    Seek,
    /// 每个分片一个临时文件，完成后合并
    ChunkFile,
}

impl WriteStrategy {
    pub fn build(self) -> Arc<dyn DownloadStrategy> {
        match self {
            WriteStrategy::Seek => Arc::new(SeekFileStrategy),
            WriteStrategy::ChunkFile => Arc::new(ChunkFileStrategy),
        }
    }
}

impl std::str::FromStr for WriteStrategy {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seek" => Ok(WriteStrategy::Seek),
            "chunk_file" | "chunk-file" | "chunk" => Ok(WriteStrategy::ChunkFile),
            other => Err(DownloadError::Config(format!("未知的写入策略: {}", other))),
        }
    }
}

/// 基于 `std::fs::File` 的写入句柄
#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileHandle {
    /// 打开（必要时创建）文件，不截断已有内容
    pub fn open(path: impl AsRef<Path>) -> DownloadResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| DownloadError::WriteFailure(format!("无法打开 {}: {}", path.display(), e)))?;
        Ok(Self { path, file: Mutex::new(Some(file)) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileWriter for FileHandle {
    fn write_at(&self, pos: u64, buf: &[u8]) -> DownloadResult<()> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let file = guard.as_mut()
            .ok_or_else(|| DownloadError::WriteFailure(format!("{} 已关闭", self.path.display())))?;
        file.seek(SeekFrom::Start(pos))
            .and_then(|_| file.write_all(buf))
            .map_err(|e| DownloadError::WriteFailure(format!("{} 偏移 {}: {}", self.path.display(), pos, e)))
    }

    fn close(&self) -> DownloadResult<()> {
        let file = self.file.lock().unwrap_or_else(PoisonError::into_inner).take();
        match file {
            Some(f) => f.sync_all()
                .map_err(|e| DownloadError::CloseFailure(format!("{}: {}", self.path.display(), e))),
            None => Ok(()),
        }
    }
}

fn first_writer(writers: &[Arc<dyn FileWriter>]) -> DownloadResult<&Arc<dyn FileWriter>> {
    writers.first()
        .ok_or_else(|| DownloadError::WriteFailure("分片没有可用的写入句柄".to_string()))
}

fn completes(chunk: &DownloadChunk, written: usize) -> bool {
    chunk.total_size > 0 && chunk.down_size + written as u64 >= chunk.total_size
}

/// 单文件策略
#[derive(Debug, Default, Clone, Copy)]
pub struct SeekFileStrategy;

impl DownloadStrategy for SeekFileStrategy {
    fn prepare(&self, ctx: &TaskContext) -> DownloadResult<()> {
        let task = &ctx.task;
        let file = File::create(task.task_file_path())?;
        if task.total_size > 0 {
            file.set_len(task.total_size)?;
        }
        Ok(())
    }

    fn open_writers(&self, ctx: &TaskContext, _chunk: &DownloadChunk) -> DownloadResult<Vec<Arc<dyn FileWriter>>> {
        let handle: Arc<dyn FileWriter> = Arc::new(FileHandle::open(ctx.task.task_file_path())?);
        Ok(vec![handle])
    }

    fn write_chunk(&self, chunk: &DownloadChunk, writers: &[Arc<dyn FileWriter>], buf: &[u8]) -> DownloadResult<bool> {
        first_writer(writers)?.write_at(chunk.resume_position(), buf)?;
        Ok(completes(chunk, buf.len()))
    }

    fn can_continue(&self, ctx: &TaskContext) -> DownloadResult<bool> {
        let exists = ctx.task.task_file_path().is_file();
        if !exists {
            log::warn!("下载文件已不存在，无法继续: {}", ctx.task.task_file_path().display());
        }
        Ok(exists)
    }

    fn merge(&self, _ctx: &TaskContext) -> DownloadResult<()> {
        Ok(())
    }
}

/// 分片临时文件策略
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkFileStrategy;

impl ChunkFileStrategy {
    pub fn parts_dir(task: &DownloadTask) -> PathBuf {
        task.file_path.join(format!("{}.parts", task.file_name))
    }

    pub fn chunk_file_path(task: &DownloadTask, index: usize) -> PathBuf {
        Self::parts_dir(task).join(format!("chunk_{:04}", index))
    }
}

impl DownloadStrategy for ChunkFileStrategy {
    fn prepare(&self, ctx: &TaskContext) -> DownloadResult<()> {
        let dir = Self::parts_dir(&ctx.task);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(())
    }

    fn open_writers(&self, ctx: &TaskContext, chunk: &DownloadChunk) -> DownloadResult<Vec<Arc<dyn FileWriter>>> {
        let handle: Arc<dyn FileWriter> = Arc::new(FileHandle::open(Self::chunk_file_path(&ctx.task, chunk.index))?);
        Ok(vec![handle])
    }

    fn write_chunk(&self, chunk: &DownloadChunk, writers: &[Arc<dyn FileWriter>], buf: &[u8]) -> DownloadResult<bool> {
        first_writer(writers)?.write_at(chunk.down_size, buf)?;
        Ok(completes(chunk, buf.len()))
    }

    fn can_continue(&self, ctx: &TaskContext) -> DownloadResult<bool> {
        let exists = Self::parts_dir(&ctx.task).is_dir();
        if !exists {
            log::warn!("分片临时目录已不存在，无法继续: {}", Self::parts_dir(&ctx.task).display());
        }
        Ok(exists)
    }

    fn merge(&self, ctx: &TaskContext) -> DownloadResult<()> {
        let task = &ctx.task;
        let snapshot = task.snapshot();
        let mut output = File::create(task.task_file_path())?;
        for chunk in &snapshot.chunks {
            let path = Self::chunk_file_path(task, chunk.index);
            let part = File::open(&path)
                .map_err(|e| DownloadError::WriteFailure(format!("无法打开分片文件 {}: {}", path.display(), e)))?;
            let copied = if chunk.total_size > 0 {
                io::copy(&mut part.take(chunk.total_size), &mut output)?
            } else {
                let mut part = part;
                io::copy(&mut part, &mut output)?
            };
            log::debug!("合并分片 {}: {} 字节", chunk.index, copied);
        }
        output.sync_all()?;
        if let Err(e) = fs::remove_dir_all(Self::parts_dir(task)) {
            log::warn!("清理分片临时目录失败: {}", e);
        }
        Ok(())
    }
}
