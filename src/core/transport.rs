//! 传输层：异步建立连接、写出请求，并把响应数据推送给处理器
//!
//! 核心只依赖这里的三个 trait。`TcpTransport` 是基于 tokio 的明文实现，
//! TLS 由其他 `Transport` 实现提供。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::core::error::{DownloadError, DownloadResult};
use crate::core::task::model::{Endpoint, ProxyConfig};

const READ_BUFFER_SIZE: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 分配连接编号
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// 接收响应数据的处理器，由传输层的读任务调用
pub trait ResponseHandler: Send + Sync {
    /// 返回 `Ok(false)` 表示不再需要后续数据
    fn on_read(&self, data: &[u8]) -> DownloadResult<bool>;
    /// 对端关闭连接
    fn on_eof(&self);
    /// 读取出错
    fn on_error(&self, error: DownloadError);
}

/// 已建立的连接
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> u64;
    async fn write(&self, data: &[u8]) -> DownloadResult<()>;
    /// 关闭连接，不等待对端
    fn close(&self) -> DownloadResult<()>;
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立连接。配置了代理时只连接代理，不在本地解析源站地址
    async fn connect(
        &self,
        endpoint: &Endpoint,
        proxy: Option<&ProxyConfig>,
        handler: Arc<dyn ResponseHandler>,
    ) -> DownloadResult<Arc<dyn Connection>>;

    /// 能否连接到该地址，不能时任务在创建阶段就被拒绝
    fn supports(&self, _endpoint: &Endpoint, _proxy: Option<&ProxyConfig>) -> bool {
        true
    }
}

/// 基于 tokio `TcpStream` 的明文传输
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        proxy: Option<&ProxyConfig>,
        handler: Arc<dyn ResponseHandler>,
    ) -> DownloadResult<Arc<dyn Connection>> {
        if !self.supports(endpoint, proxy) {
            return Err(DownloadError::ConnectFailure(format!(
                "{}:{} 需要 TLS，当前传输层只支持明文连接", endpoint.host, endpoint.port
            )));
        }
        let (host, port) = match proxy {
            Some(p) => (p.host.as_str(), p.port),
            None => (endpoint.host.as_str(), endpoint.port),
        };
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DownloadError::ConnectFailure(format!("连接 {}:{} 超时", host, port)))?
            .map_err(|e| DownloadError::ConnectFailure(format!("连接 {}:{} 失败: {}", host, port, e)))?;
        stream.set_nodelay(true).ok();

        let (mut read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        handler.on_eof();
                        break;
                    }
                    Ok(n) => match handler.on_read(&buf[..n]) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            handler.on_error(e);
                            break;
                        }
                    },
                    Err(e) => {
                        handler.on_error(DownloadError::IoError(e));
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(TcpConnection {
            id: next_connection_id(),
            closed: AtomicBool::new(false),
            writer: Mutex::new(Some(write_half)),
            reader,
        }))
    }

    /// 代理负责 TLS 时可以连接 https 源站
    fn supports(&self, endpoint: &Endpoint, proxy: Option<&ProxyConfig>) -> bool {
        proxy.is_some() || !endpoint.ssl
    }
}

/// TCP 连接：写半部分由连接持有，读半部分在独立任务中
pub struct TcpConnection {
    id: u64,
    closed: AtomicBool,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn write(&self, data: &[u8]) -> DownloadResult<()> {
        let mut writer = self.writer.lock().await;
        let result = match writer.as_mut() {
            Some(w) => {
                w.write_all(data).await?;
                w.flush().await?;
                Ok(())
            }
            None => Err(DownloadError::WriteFailure(format!("连接 {} 已关闭", self.id))),
        };
        // 写入期间被关闭时由这里释放写半部分
        if self.closed.load(Ordering::SeqCst) {
            writer.take();
        }
        result
    }

    fn close(&self) -> DownloadResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
