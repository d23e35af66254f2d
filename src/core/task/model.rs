//! 任务与分片的数据模型
//!
//! `DownloadChunk` / `TaskSnapshot` 是可序列化的"值数据"；
//! 运行期的锁（任务锁、分片锁、请求锁）由 `DownloadTask`、`ChunkSlot`
//! 和 `TaskContext` 持有。网络连接与文件句柄不在这里，见 `registry`。

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::{Serialize, Deserialize};
use url::Url;
use uuid::Uuid;

use crate::core::error::{DownloadError, DownloadResult};
use super::state::{ChunkStatus, TaskStatus};

pub const RANGE: &str = "Range";

/// 当前时间（毫秒）
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 分片信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadChunk {
    pub index: usize,
    /// 原始起始位置，构建后不再变化
    pub ori_start: u64,
    /// 本次连接请求的起始位置（重试时重新计算）
    pub now_start: u64,
    /// 结束位置（包含）
    pub end: u64,
    pub down_size: u64,
    /// 分片大小，0 表示长度未知
    pub total_size: u64,
    pub status: ChunkStatus,
    pub start_time: i64,
    pub pause_time: i64,
    pub last_time: i64,
}

impl DownloadChunk {
    /// 覆盖 `[start, end]` 的分片；`end < start` 时大小记为 0，由 `validate_chunks` 拒绝
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            ori_start: start,
            now_start: start,
            end,
            down_size: 0,
            total_size: end.checked_sub(start).and_then(|d| d.checked_add(1)).unwrap_or(0),
            status: ChunkStatus::Pending,
            start_time: 0,
            pause_time: 0,
            last_time: 0,
        }
    }

    /// 覆盖整个资源的单个分片，`total_size` 为 0 时长度未知
    pub fn whole(total_size: u64) -> Self {
        Self {
            end: total_size.saturating_sub(1),
            total_size,
            ..Self::new(0, 0, 0)
        }
    }

    /// 已下载字节数达到分片大小
    pub fn is_complete(&self) -> bool {
        self.total_size > 0 && self.down_size == self.total_size
    }

    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.down_size)
    }

    /// 断点续传的起始位置，只由已下载字节数推导
    pub fn resume_position(&self) -> u64 {
        self.ori_start + self.down_size
    }

    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.now_start, self.end)
    }
}

pub type ChunkRef = Arc<ChunkSlot>;

/// 带锁的分片，索引在整个任务生命周期内不变
#[derive(Debug)]
pub struct ChunkSlot {
    index: usize,
    attempt: AtomicU64,
    info: Mutex<DownloadChunk>,
}

impl ChunkSlot {
    pub fn new(chunk: DownloadChunk) -> Self {
        Self {
            index: chunk.index,
            attempt: AtomicU64::new(0),
            info: Mutex::new(chunk),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// 获取分片锁
    pub fn lock(&self) -> MutexGuard<'_, DownloadChunk> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> DownloadChunk {
        self.lock().clone()
    }

    /// 开启新的一次连接尝试，须持有分片锁调用
    pub(crate) fn next_attempt(&self) -> u64 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 作废进行中的连接尝试，须持有分片锁调用
    pub(crate) fn invalidate_attempt(&self) {
        self.attempt.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn current_attempt(&self) -> u64 {
        self.attempt.load(Ordering::SeqCst)
    }
}

/// 任务锁保护的可变状态
#[derive(Debug)]
pub struct TaskState {
    pub status: TaskStatus,
    pub start_time: i64,
    pub pause_time: i64,
    pub last_time: i64,
    /// 按索引排序，`start` 之后长度与元素不再变化
    pub chunks: Vec<ChunkRef>,
}

impl TaskState {
    /// 重置计时
    pub fn reset(&mut self) {
        self.start_time = 0;
        self.pause_time = 0;
        self.last_time = 0;
    }
}

/// 下载任务
#[derive(Debug)]
pub struct DownloadTask {
    pub id: Uuid,
    /// 保存目录
    pub file_path: PathBuf,
    pub file_name: String,
    /// 资源总大小，0 表示未知
    pub total_size: u64,
    pub support_range: bool,
    pub connections: usize,
    state: Mutex<TaskState>,
}

impl DownloadTask {
    pub fn new(
        file_path: impl Into<PathBuf>,
        file_name: impl Into<String>,
        total_size: u64,
        support_range: bool,
        connections: usize,
    ) -> Self {
        if support_range && total_size == 0 {
            log::warn!("资源大小未知，禁用分段下载");
        }
        Self {
            id: Uuid::new_v4(),
            file_path: file_path.into(),
            file_name: file_name.into(),
            total_size,
            support_range: support_range && total_size > 0,
            connections: connections.max(1),
            state: Mutex::new(TaskState {
                status: TaskStatus::Ready,
                start_time: 0,
                pause_time: 0,
                last_time: 0,
                chunks: Vec::new(),
            }),
        }
    }

    /// 获取任务锁
    pub fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status.clone()
    }

    pub fn chunks(&self) -> Vec<ChunkRef> {
        self.lock().chunks.clone()
    }

    /// 最终输出文件路径
    pub fn task_file_path(&self) -> PathBuf {
        self.file_path.join(&self.file_name)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.lock();
        TaskSnapshot {
            id: self.id,
            file_path: self.file_path.clone(),
            file_name: self.file_name.clone(),
            total_size: self.total_size,
            support_range: self.support_range,
            connections: self.connections,
            status: state.status.clone(),
            start_time: state.start_time,
            pause_time: state.pause_time,
            last_time: state.last_time,
            chunks: state.chunks.iter().map(|c| c.snapshot()).collect(),
        }
    }
}

/// 任务的可观察（可持久化）字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub file_path: PathBuf,
    pub file_name: String,
    pub total_size: u64,
    pub support_range: bool,
    pub connections: usize,
    pub status: TaskStatus,
    pub start_time: i64,
    pub pause_time: i64,
    pub last_time: i64,
    pub chunks: Vec<DownloadChunk>,
}

impl TaskSnapshot {
    pub fn down_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.down_size).sum()
    }

    pub fn progress(&self) -> f32 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.down_size() as f32 / self.total_size as f32) * 100.0
    }
}

/// 按连接数切分 `[0, total)`，余数并入最后一个分片
pub fn split_ranges(total_size: u64, connections: usize, support_range: bool) -> Vec<DownloadChunk> {
    if !support_range || total_size == 0 {
        return vec![DownloadChunk::whole(total_size)];
    }
    let count = (connections.max(1) as u64).min(total_size);
    let size = total_size / count;
    (0..count)
        .map(|i| {
            let start = i * size;
            let end = if i == count - 1 { total_size - 1 } else { (i + 1) * size - 1 };
            DownloadChunk::new(i as usize, start, end)
        })
        .collect()
}

/// 校验分片列表：非空、按索引排序，支持分段时无缝覆盖整个资源
pub fn validate_chunks(chunks: &[DownloadChunk], total_size: u64, support_range: bool) -> DownloadResult<()> {
    if chunks.is_empty() {
        return Err(DownloadError::Setup("分片列表为空".to_string()));
    }
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.index != i {
            return Err(DownloadError::Setup(format!("分片索引不连续: 位置 {} 的索引为 {}", i, chunk.index)));
        }
        if chunk.end < chunk.ori_start {
            return Err(DownloadError::Setup(format!("分片 {} 的范围 {}-{} 无效", i, chunk.ori_start, chunk.end)));
        }
        if chunk.down_size > chunk.total_size && chunk.total_size > 0 {
            return Err(DownloadError::Setup(format!("分片 {} 已下载字节数超过分片大小", i)));
        }
    }
    if !support_range {
        return Ok(());
    }
    let mut expected = 0u64;
    for chunk in chunks {
        if chunk.ori_start != expected {
            return Err(DownloadError::Setup(format!(
                "分片 {} 的范围 {}-{} 与前一分片不衔接", chunk.index, chunk.ori_start, chunk.end
            )));
        }
        expected = chunk.end.saturating_add(1);
    }
    if expected != total_size {
        return Err(DownloadError::Setup(format!("分片只覆盖到 {}，资源大小 {}", expected, total_size)));
    }
    Ok(())
}

/// 连接目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
}

/// HTTP 代理配置。配置后由代理解析并连接源站
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl FromStr for ProxyConfig {
    type Err = DownloadError;

    /// 支持 `host:port` 和 `http://host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let with_scheme = if raw.contains("://") { raw.to_string() } else { format!("http://{}", raw) };
        let url = Url::parse(&with_scheme)
            .map_err(|e| DownloadError::Config(format!("代理地址无效 {}: {}", s, e)))?;
        if url.scheme() != "http" {
            return Err(DownloadError::Config(format!("只支持 HTTP 代理: {}", s)));
        }
        let host = url.host_str()
            .ok_or_else(|| DownloadError::Config(format!("代理地址缺少主机名: {}", s)))?;
        Ok(Self {
            host: host.to_string(),
            port: url.port_or_known_default().unwrap_or(80),
        })
    }
}

/// 下载请求
///
/// 所有分片共享同一个请求，`Range` 头在每次连接发送前改写，
/// 因此通过 `TaskContext::request` 的锁串行访问。
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    /// origin-form 请求目标（路径 + 查询）
    pub uri: String,
    headers: Vec<(String, String)>,
    pub content: Option<Bytes>,
}

impl RequestDescriptor {
    pub fn from_url(url: &str) -> DownloadResult<Self> {
        let parsed = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", url, e)))?;
        let ssl = match parsed.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(DownloadError::InvalidUrl(format!("不支持的协议 {}: {}", other, url))),
        };
        let host = parsed.host_str()
            .ok_or_else(|| DownloadError::InvalidUrl(format!("缺少主机名: {}", url)))?
            .to_string();
        let port = parsed.port_or_known_default().unwrap_or(if ssl { 443 } else { 80 });
        let mut uri = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            uri.push('?');
            uri.push_str(query);
        }
        let host_header = match parsed.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.clone(),
        };
        let mut request = Self {
            method: "GET".to_string(),
            scheme: parsed.scheme().to_string(),
            host,
            port,
            ssl,
            uri,
            headers: Vec::new(),
            content: None,
        };
        request.set_header("Host", host_header);
        request.set_header("Accept", "*/*");
        request.set_header("Connection", "close");
        Ok(request)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// 设置请求体，同时写入 `Content-Length`
    pub fn with_body(mut self, method: &str, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.method = method.to_string();
        self.set_header("Content-Length", body.len().to_string());
        self.content = Some(body);
        self
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            ssl: self.ssl,
        }
    }

    pub fn absolute_uri(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.uri)
    }

    /// 编码请求行和请求头；经代理发送时使用 absolute-form
    pub fn encode_head(&self, absolute_form: bool) -> Vec<u8> {
        let target = if absolute_form { self.absolute_uri() } else { self.uri.clone() };
        let mut head = format!("{} {} HTTP/1.1\r\n", self.method, target);
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// 下载任务的完整上下文：任务本身、共享请求和代理配置
#[derive(Debug)]
pub struct TaskContext {
    pub task: DownloadTask,
    pub request: tokio::sync::Mutex<RequestDescriptor>,
    pub proxy: Option<ProxyConfig>,
}

impl TaskContext {
    pub fn new(task: DownloadTask, request: RequestDescriptor, proxy: Option<ProxyConfig>) -> Self {
        Self {
            task,
            request: tokio::sync::Mutex::new(request),
            proxy,
        }
    }
}
