//! 测试用的传输层、写入策略和回调

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use uuid::Uuid;

pub use crate::core::transport::{Connection, ResponseHandler};
use crate::core::error::{DownloadError, DownloadResult};
use crate::core::transport::{next_connection_id, Transport};
use super::callback::DownloadCallback;
use super::downloader::ChunkedDownloader;
use super::model::{ChunkRef, DownloadChunk, DownloadTask, Endpoint, ProxyConfig, RequestDescriptor, TaskContext};
use super::strategy::{DownloadStrategy, FileWriter};

/// 系统临时目录下的独立目录
pub fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("multidown-test-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// 轮询直到条件成立，最多约 2 秒
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// 从已编码的请求头中取出某个头的值
pub fn header_of(request: &str, name: &str) -> Option<String> {
    let head = request.split("\r\n\r\n").next()?;
    head.split("\r\n")
        .skip(1)
        .filter_map(|l| l.split_once(':'))
        .find(|(n, _)| n.trim().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim().to_string())
}

pub struct MockConnection {
    id: u64,
    closed: AtomicBool,
    close_attempted: AtomicBool,
    fail_close: bool,
    fail_writes: bool,
    writes: Mutex<Vec<Vec<u8>>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            id: next_connection_id(),
            closed: AtomicBool::new(false),
            close_attempted: AtomicBool::new(false),
            fail_close: false,
            fail_writes: false,
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_close() -> Self {
        Self { fail_close: true, ..Self::new() }
    }

    fn broken() -> Self {
        Self { fail_writes: true, ..Self::new() }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.writes().concat()).into_owned()
    }

    pub fn close_attempted(&self) -> bool {
        self.close_attempted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn write(&self, data: &[u8]) -> DownloadResult<()> {
        if self.fail_writes || self.is_closed() {
            return Err(DownloadError::WriteFailure(format!("连接 {} 不可写", self.id)));
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn close(&self) -> DownloadResult<()> {
        self.close_attempted.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(DownloadError::CloseFailure(format!("连接 {}", self.id)));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

type Link = (Arc<MockConnection>, Arc<dyn ResponseHandler>);

/// 记录所有连接请求的传输层，可让指定序号的连接失败，或在放行前阻塞
#[derive(Default)]
pub struct MockTransport {
    calls: AtomicUsize,
    finished: AtomicUsize,
    fail_on: HashSet<usize>,
    gate: Option<Arc<Semaphore>>,
    broken_writes: bool,
    endpoints: Mutex<Vec<(Endpoint, Option<ProxyConfig>)>>,
    links: Mutex<Vec<Link>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 第 n 次（从 0 开始）连接失败
    pub fn failing(calls: &[usize]) -> Self {
        Self { fail_on: calls.iter().copied().collect(), ..Self::default() }
    }

    /// 每次连接都要等到 `Semaphore` 放行
    pub fn gated() -> (Self, Arc<Semaphore>) {
        Self::gated_failing(&[])
    }

    pub fn gated_failing(calls: &[usize]) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let transport = Self { gate: Some(gate.clone()), ..Self::failing(calls) };
        (transport, gate)
    }

    /// 连接成功但写入总是失败
    pub fn broken_writes() -> Self {
        Self { broken_writes: true, ..Self::default() }
    }

    pub fn connect_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<(Endpoint, Option<ProxyConfig>)> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.links.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn handlers(&self) -> Vec<Arc<dyn ResponseHandler>> {
        self.links.lock().unwrap().iter().map(|(_, h)| h.clone()).collect()
    }

    /// 按请求中的 `Range` 找到分片当前连接的处理器
    pub async fn handler_for(&self, chunk: &ChunkRef) -> Arc<dyn ResponseHandler> {
        let range = chunk.snapshot().range_header();
        let found = wait_until(|| {
            self.connections().iter().any(|c| header_of(&c.written_text(), "Range").as_deref() == Some(range.as_str()))
        }).await;
        assert!(found, "no connection requested {}", range);
        let links = self.links.lock().unwrap();
        links.iter()
            .rev()
            .find(|(c, _)| header_of(&c.written_text(), "Range").as_deref() == Some(range.as_str()))
            .map(|(_, h)| h.clone())
            .unwrap()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        proxy: Option<&ProxyConfig>,
        handler: Arc<dyn ResponseHandler>,
    ) -> DownloadResult<Arc<dyn Connection>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push((endpoint.clone(), proxy.cloned()));
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| DownloadError::ConnectFailure(e.to_string()))?
                .forget();
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.contains(&call) {
            return Err(DownloadError::ConnectFailure(format!("模拟第 {} 次连接失败", call)));
        }
        let conn = Arc::new(if self.broken_writes { MockConnection::broken() } else { MockConnection::new() });
        self.links.lock().unwrap().push((conn.clone(), handler));
        Ok(conn as Arc<dyn Connection>)
    }
}

/// 写入内存的文件句柄
#[derive(Default)]
pub struct MemoryWriter {
    data: Mutex<Vec<(u64, Vec<u8>)>>,
    closed: AtomicBool,
    fail_close: bool,
}

impl MemoryWriter {
    pub fn failing_close() -> Self {
        Self { fail_close: true, ..Self::default() }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl FileWriter for MemoryWriter {
    fn write_at(&self, pos: u64, buf: &[u8]) -> DownloadResult<()> {
        self.data.lock().unwrap().push((pos, buf.to_vec()));
        Ok(())
    }

    fn close(&self) -> DownloadResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(DownloadError::CloseFailure("模拟关闭失败".to_string()));
        }
        Ok(())
    }
}

/// 把分片数据收集在内存中的写入策略
pub struct MemoryStrategy {
    can_continue: AtomicBool,
    merges: AtomicUsize,
    written: Mutex<HashMap<usize, Vec<u8>>>,
}

impl Default for MemoryStrategy {
    fn default() -> Self {
        Self {
            can_continue: AtomicBool::new(true),
            merges: AtomicUsize::new(0),
            written: Mutex::new(HashMap::new()),
        }
    }
}

impl MemoryStrategy {
    pub fn set_can_continue(&self, value: bool) {
        self.can_continue.store(value, Ordering::SeqCst);
    }

    pub fn merge_count(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }

    pub fn written(&self, index: usize) -> Vec<u8> {
        self.written.lock().unwrap().get(&index).cloned().unwrap_or_default()
    }
}

impl DownloadStrategy for MemoryStrategy {
    fn open_writers(&self, _ctx: &TaskContext, _chunk: &DownloadChunk) -> DownloadResult<Vec<Arc<dyn FileWriter>>> {
        let writer: Arc<dyn FileWriter> = Arc::new(MemoryWriter::default());
        Ok(vec![writer])
    }

    fn write_chunk(&self, chunk: &DownloadChunk, writers: &[Arc<dyn FileWriter>], buf: &[u8]) -> DownloadResult<bool> {
        for writer in writers {
            writer.write_at(chunk.down_size, buf)?;
        }
        self.written.lock().unwrap().entry(chunk.index).or_default().extend_from_slice(buf);
        Ok(chunk.total_size > 0 && chunk.down_size + buf.len() as u64 >= chunk.total_size)
    }

    fn can_continue(&self, _ctx: &TaskContext) -> DownloadResult<bool> {
        Ok(self.can_continue.load(Ordering::SeqCst))
    }

    fn merge(&self, _ctx: &TaskContext) -> DownloadResult<()> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    Pause,
    Continue,
    ChunkDone(usize),
    Done,
    Error(String),
}

/// 按顺序记录所有通知
#[derive(Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<Event>>,
}

impl RecordingCallback {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl DownloadCallback for RecordingCallback {
    fn on_start(&self, _ctx: &TaskContext) {
        self.push(Event::Start);
    }

    fn on_pause(&self, _ctx: &TaskContext) {
        self.push(Event::Pause);
    }

    fn on_continue(&self, _ctx: &TaskContext) {
        self.push(Event::Continue);
    }

    fn on_chunk_done(&self, _ctx: &TaskContext, chunk: &DownloadChunk) {
        self.push(Event::ChunkDone(chunk.index));
    }

    fn on_done(&self, _ctx: &TaskContext) {
        self.push(Event::Done);
    }

    fn on_error(&self, _ctx: &TaskContext, error: &DownloadError) {
        self.push(Event::Error(error.to_string()));
    }
}

/// 组装好的下载器及其测试替身，文件名固定为 `out.bin`
pub struct Harness {
    pub downloader: Arc<ChunkedDownloader>,
    pub transport: Arc<MockTransport>,
    pub strategy: Arc<MemoryStrategy>,
    pub callback: Arc<RecordingCallback>,
}

impl Harness {
    pub fn new(dir: &Path, total: u64, support_range: bool, connections: usize) -> Self {
        Self::with_transport(dir, total, support_range, connections, MockTransport::new())
    }

    pub fn with_transport(dir: &Path, total: u64, support_range: bool, connections: usize, transport: MockTransport) -> Self {
        Self::build(dir, total, support_range, connections, transport, default_request(), None)
    }

    /// 使用真实的写入策略；`strategy` 字段此时不参与下载
    pub fn with_strategy(
        dir: &Path,
        total: u64,
        support_range: bool,
        connections: usize,
        strategy: Arc<dyn DownloadStrategy>,
    ) -> Self {
        Self::assemble(dir, total, support_range, connections, MockTransport::new(), default_request(), None, Some(strategy))
    }

    pub fn build(
        dir: &Path,
        total: u64,
        support_range: bool,
        connections: usize,
        transport: MockTransport,
        request: RequestDescriptor,
        proxy: Option<ProxyConfig>,
    ) -> Self {
        Self::assemble(dir, total, support_range, connections, transport, request, proxy, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        dir: &Path,
        total: u64,
        support_range: bool,
        connections: usize,
        transport: MockTransport,
        request: RequestDescriptor,
        proxy: Option<ProxyConfig>,
        strategy: Option<Arc<dyn DownloadStrategy>>,
    ) -> Self {
        let task = DownloadTask::new(dir, "out.bin", total, support_range, connections);
        let ctx = TaskContext::new(task, request, proxy);
        let transport = Arc::new(transport);
        let memory = Arc::new(MemoryStrategy::default());
        let callback = Arc::new(RecordingCallback::default());
        let strategy = strategy.unwrap_or_else(|| memory.clone() as Arc<dyn DownloadStrategy>);
        let downloader = ChunkedDownloader::new(ctx, transport.clone(), strategy, Handle::current())
            .with_callback(callback.clone());
        Self {
            downloader: Arc::new(downloader),
            transport,
            strategy: memory,
            callback,
        }
    }
}

fn default_request() -> RequestDescriptor {
    RequestDescriptor::from_url("http://localhost/out.bin").unwrap()
}
