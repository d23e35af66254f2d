//! 分片连接：发起异步连接，连接建立后写出带 `Range` 的请求

use std::sync::Arc;

use crate::core::transport::Connection;
use super::downloader::ChunkedDownloader;
use super::handler::ChunkResponseHandler;
use super::model::{ChunkRef, DownloadChunk, RANGE};
use super::state::ChunkStatus;

impl ChunkedDownloader {
    /// 为分片发起一次新连接，立即返回。
    ///
    /// 分片状态同步置为 `status`（`ConnectingNormal` 或 `ConnectingFail`），
    /// 连接结果在运行时的工作线程上处理。
    pub fn start_chunk(self: &Arc<Self>, chunk: &ChunkRef, status: ChunkStatus) {
        let mut info = chunk.lock();
        self.issue_connect(chunk, &mut info, status);
    }

    /// 须持有分片锁调用
    pub(crate) fn issue_connect(self: &Arc<Self>, chunk: &ChunkRef, info: &mut DownloadChunk, status: ChunkStatus) {
        log::debug!("开始下载：{:?}", info);
        let attempt = chunk.next_attempt();
        info.status = status;
        let this = Arc::clone(self);
        let slot = Arc::clone(chunk);
        self.runtime.spawn(async move {
            this.connect_chunk(slot, attempt).await;
        });
    }

    async fn connect_chunk(self: Arc<Self>, chunk: ChunkRef, attempt: u64) {
        let index = chunk.index();
        let endpoint = self.ctx.request.lock().await.endpoint();
        let handler = Arc::new(ChunkResponseHandler::new(Arc::clone(&self), Arc::clone(&chunk), attempt));

        let conn = match self.transport.connect(&endpoint, self.ctx.proxy.as_ref(), handler).await {
            Ok(conn) => conn,
            Err(e) => {
                let mut info = chunk.lock();
                if chunk.current_attempt() == attempt && info.status.is_connecting() {
                    log::warn!("下载连接失败：#{} {}:{} - {}", index, endpoint.host, endpoint.port, e);
                    info.status = ChunkStatus::Fail;
                    self.close_chunk(&info);
                } else {
                    log::debug!("忽略过期的连接失败：#{} - {}", index, e);
                }
                return;
            }
        };

        let range = {
            let info = chunk.lock();
            if chunk.current_attempt() != attempt || !info.status.is_connecting() {
                log::debug!("分片 #{} 已暂停或重新连接，关闭多余连接 channelId[{}]", index, conn.id());
                discard(conn.as_ref());
                return;
            }
            self.registry.set_channel(index, Arc::clone(&conn));
            info.range_header()
        };

        let sent = {
            let mut request = self.ctx.request.lock().await;
            log::debug!("下载连接成功：channelId[{}]\t#{}", conn.id(), index);
            if self.ctx.task.support_range {
                request.set_header(RANGE, range);
            } else {
                request.remove_header(RANGE);
            }
            let head = request.encode_head(self.ctx.proxy.is_some());
            match conn.write(&head).await {
                Ok(()) => match &request.content {
                    Some(body) => conn.write(body).await,
                    None => Ok(()),
                },
                Err(e) => Err(e),
            }
        };

        if let Err(e) = sent {
            let mut info = chunk.lock();
            if chunk.current_attempt() == attempt && info.status.is_active() {
                log::warn!("发送请求失败：#{} - {}", index, e);
                info.status = ChunkStatus::Fail;
                self.close_chunk(&info);
            }
        }
    }
}

fn discard(conn: &dyn Connection) {
    if let Err(e) = conn.close() {
        log::error!("关闭连接 {} 失败: {}", conn.id(), e);
    }
}
