//! 分片响应处理：解析响应头、校验续传位置、把响应体交给写入策略

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use regex::Regex;

use crate::core::error::{DownloadError, DownloadResult};
use crate::core::transport::ResponseHandler;
use super::downloader::ChunkedDownloader;
use super::model::{now_millis, ChunkRef, DownloadChunk};
use super::state::ChunkStatus;

const MAX_HEAD_SIZE: usize = 64 * 1024;

/// 解析后的响应头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn parse(raw: &[u8]) -> DownloadResult<Self> {
        let text = String::from_utf8_lossy(raw);
        let mut lines = text.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.split_whitespace();
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(DownloadError::Protocol(format!("无效的状态行: {}", status_line)));
        }
        let status = parts.next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| DownloadError::Protocol(format!("无效的状态码: {}", status_line)))?;

        let headers = lines
            .filter(|l| !l.is_empty())
            .filter_map(|l| l.split_once(':'))
            .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            .collect();
        Ok(Self { status, headers })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"))
    }
}

/// `\r\n\r\n` 之后第一个字节的位置
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn content_range_regex() -> Option<&'static Regex> {
    static CONTENT_RANGE: OnceLock<Option<Regex>> = OnceLock::new();
    CONTENT_RANGE
        .get_or_init(|| Regex::new(r"^bytes\s+(\d+)-(\d+)/(\d+|\*)$").ok())
        .as_ref()
}

/// 解析 `Content-Range: bytes start-end/total`，返回 (start, end)
pub fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let caps = content_range_regex()?.captures(value.trim())?;
    let start = caps.get(1)?.as_str().parse().ok()?;
    let end = caps.get(2)?.as_str().parse().ok()?;
    Some((start, end))
}

/// 单次连接的响应处理器
///
/// 每次连接尝试一个实例；尝试被作废（暂停、重试、关闭）后收到的数据一律丢弃。
pub struct ChunkResponseHandler {
    downloader: Arc<ChunkedDownloader>,
    chunk: ChunkRef,
    attempt: u64,
    /// 响应头收齐之前的缓冲，收齐后为 `None`
    head: Mutex<Option<Vec<u8>>>,
    finished: AtomicBool,
}

impl ChunkResponseHandler {
    pub fn new(downloader: Arc<ChunkedDownloader>, chunk: ChunkRef, attempt: u64) -> Self {
        Self {
            downloader,
            chunk,
            attempt,
            head: Mutex::new(Some(Vec::new())),
            finished: AtomicBool::new(false),
        }
    }

    fn is_current(&self) -> bool {
        self.chunk.current_attempt() == self.attempt
    }

    fn stop(&self) -> bool {
        self.finished.store(true, Ordering::SeqCst);
        false
    }

    /// 校验响应头并打开写入句柄，返回是否继续接收
    fn accept_head(&self, head: &ResponseHead) -> DownloadResult<bool> {
        let support_range = self.downloader.task().support_range;
        let mut info = self.chunk.lock();
        if !self.is_current() || !info.status.is_connecting() {
            return Ok(self.stop());
        }
        if head.is_chunked() {
            return Err(DownloadError::Protocol("不支持 chunked 传输编码".to_string()));
        }
        match head.status {
            206 if support_range => {
                let range = head.header("content-range").and_then(parse_content_range);
                if let Some((start, _)) = range {
                    if start != info.now_start {
                        return Err(DownloadError::Protocol(format!(
                            "分片 #{} 请求从 {} 开始，服务器返回 {}", info.index, info.now_start, start
                        )));
                    }
                }
            }
            200 if !support_range => {
                // 不支持续传，重新从头写
                info.down_size = 0;
                if info.total_size == 0 {
                    if let Some(len) = head.content_length().filter(|l| *l > 0) {
                        info.total_size = len;
                        info.end = len - 1;
                    }
                }
            }
            status => {
                return Err(DownloadError::Protocol(format!("分片 #{} 收到意外的响应状态 {}", info.index, status)));
            }
        }

        let writers = self.downloader.strategy.open_writers(self.downloader.context(), &info)?;
        self.downloader.registry().set_file_writers(info.index, writers);
        info.status = ChunkStatus::Running;
        info.last_time = now_millis();
        log::debug!("分片 #{} 开始接收数据，起始位置 {}", info.index, info.now_start);
        Ok(true)
    }

    fn on_body(&self, data: &[u8]) -> DownloadResult<bool> {
        let done = {
            let mut info = self.chunk.lock();
            if !self.is_current() || info.status != ChunkStatus::Running {
                return Ok(self.stop());
            }
            let take = if info.total_size > 0 {
                data.len().min(info.remaining() as usize)
            } else {
                data.len()
            };
            let mut reported = false;
            if take > 0 {
                let writers = self.downloader.registry().get_file_writers(info.index)
                    .ok_or_else(|| DownloadError::WriteFailure(format!("分片 #{} 没有打开的文件", info.index)))?;
                reported = self.downloader.strategy.write_chunk(&info, &writers, &data[..take])?;
                info.down_size += take as u64;
                info.last_time = now_millis();
            }
            let counted = info.is_complete();
            if info.total_size > 0 && reported != counted && (reported || take > 0) {
                log::warn!(
                    "分片 #{} 写入策略报告完成为 {}，已下载 {}/{}",
                    info.index, reported, info.down_size, info.total_size
                );
            }
            if reported || counted {
                if info.total_size == 0 {
                    // 长度未知时由写入策略判定结束
                    info.total_size = info.down_size;
                    info.end = (info.ori_start + info.down_size).saturating_sub(1);
                }
                info.status = ChunkStatus::Done;
                self.downloader.close_chunk(&info);
                Some(info.clone())
            } else {
                None
            }
        };
        match done {
            Some(chunk) => {
                self.stop();
                self.finish(&chunk);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    fn finish(&self, chunk: &DownloadChunk) {
        self.downloader.notify_chunk_done(chunk);
        self.downloader.check_finished();
    }

    /// 分片置为 `Fail` 并释放资源，由管理器按退避策略重试
    fn fail(&self, error: &DownloadError) {
        let mut info = self.chunk.lock();
        if self.is_current() && info.status.is_active() {
            if error.is_retryable() {
                log::warn!("分片 #{} 下载中断，等待重试: {}", info.index, error);
            } else {
                log::error!("分片 #{} 下载失败: {}", info.index, error);
            }
            info.status = ChunkStatus::Fail;
            self.downloader.close_chunk(&info);
        }
    }
}

impl ResponseHandler for ChunkResponseHandler {
    fn on_read(&self, data: &[u8]) -> DownloadResult<bool> {
        if self.finished.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let parsed = {
            let mut pending = self.head.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.as_mut() {
                None => None,
                Some(buf) => {
                    buf.extend_from_slice(data);
                    let Some(end) = find_head_end(buf) else {
                        if buf.len() > MAX_HEAD_SIZE {
                            return Err(DownloadError::Protocol("响应头过大".to_string()));
                        }
                        return Ok(true);
                    };
                    let rest = buf.split_off(end);
                    let head = ResponseHead::parse(buf)?;
                    *pending = None;
                    Some((head, rest))
                }
            }
        };
        match parsed {
            None => self.on_body(data),
            Some((head, rest)) => {
                log::debug!("分片 #{} 响应状态 {}", self.chunk.index(), head.status);
                if !self.accept_head(&head)? {
                    return Ok(false);
                }
                if rest.is_empty() {
                    Ok(true)
                } else {
                    self.on_body(&rest)
                }
            }
        }
    }

    fn on_eof(&self) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        self.stop();
        let done = {
            let mut info = self.chunk.lock();
            if !self.is_current() || !info.status.is_active() {
                return;
            }
            if info.status == ChunkStatus::Running && info.total_size == 0 {
                // 长度未知的响应以连接关闭为结束
                info.total_size = info.down_size;
                info.end = (info.ori_start + info.down_size).saturating_sub(1);
                info.status = ChunkStatus::Done;
                self.downloader.close_chunk(&info);
                info.clone()
            } else {
                log::warn!("分片 #{} 连接提前关闭，已下载 {}/{}", info.index, info.down_size, info.total_size);
                info.status = ChunkStatus::Fail;
                self.downloader.close_chunk(&info);
                return;
            }
        };
        self.finish(&done);
    }

    fn on_error(&self, error: DownloadError) {
        if self.finished.load(Ordering::SeqCst) || !self.is_current() {
            return;
        }
        self.stop();
        self.fail(&error);
    }
}
