use actix::prelude::*;
use chrono::{DateTime, Local};
use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use uuid::Uuid;
use crate::config::Config;
use crate::core::error::{DownloadError, DownloadResult};
use crate::core::task::model::ChunkRef;
use crate::core::task::util::file_name_from_url;
use crate::core::task::{
    ChunkStatus, ChunkedDownloader, DownloadCallback, DownloadChunk, DownloadTask, FileInfo,
    RequestDescriptor, RetryContext, RetryStrategy, TaskContext, TaskSnapshot, TaskStatus,
};
use crate::core::transport::{TcpTransport, Transport};
use crate::utils::validator;

/// 失败分片的巡检间隔
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);
/// 无法从 URL 推断文件名时使用
const FALLBACK_FILE_NAME: &str = "download.bin";

/// ================== 任务元数据结构体 ==================
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DownloadTaskMeta {
    pub id: Uuid,
    pub url: String,
    pub file_path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub support_range: bool,
    pub status: TaskStatus,
    pub progress: f32,
    pub created_at: DateTime<Local>,
}

/// 所有任务的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadStats {
    pub total: usize,
    pub running: usize,
    pub paused: usize,
    pub done: usize,
    pub failed: usize,
    pub downloaded_bytes: u64,
}

struct ManagedTask {
    downloader: Arc<ChunkedDownloader>,
    /// 按分片序号记录的重试次数
    retries: HashMap<usize, RetryContext>,
}

/// 全局任务管理器 Actor
///
/// 每个任务对应一个 `ChunkedDownloader`。下载器的通知经 `ManagerCallback`
/// 转成 `TaskEvent` 投递回来，用于刷新元数据并写入任务记录。
/// 定时巡检负责重试失败的分片，重试用尽的任务标记为失败。
pub struct DownloadManagerActor {
    config: Config,
    transport: Arc<dyn Transport>,
    tasks: HashMap<Uuid, ManagedTask>,
    metas: HashMap<Uuid, DownloadTaskMeta>,
    retry: RetryStrategy,
    supervise_interval: Duration,
}

impl DownloadManagerActor {
    // 创建一个新的任务管理器
    pub fn new(config: Config) -> Self {
        let transport = Arc::new(TcpTransport::new(config.connect_timeout()));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let retry = config.retry_strategy();
        let mut mgr = Self {
            config,
            transport,
            tasks: HashMap::new(),
            metas: HashMap::new(),
            retry,
            supervise_interval: SUPERVISE_INTERVAL,
        };
        mgr.load_tasks_from_file();
        mgr
    }

    pub fn with_supervise_interval(mut self, interval: Duration) -> Self {
        self.supervise_interval = interval;
        self
    }

    fn build_downloader(
        &self,
        addr: Addr<Self>,
        id: Uuid,
        url: &str,
        file_name: &str,
        size: u64,
        support_range: bool,
    ) -> DownloadResult<Arc<ChunkedDownloader>> {
        let request = RequestDescriptor::from_url(url)?
            .with_header("User-Agent", self.config.user_agent.clone());
        let proxy = self.config.proxy_config()?;
        if !self.transport.supports(&request.endpoint(), proxy.as_ref()) {
            return Err(DownloadError::InvalidUrl(format!("{} 需要 TLS，请配置代理后再下载", url)));
        }
        let mut task = DownloadTask::new(&self.config.download_dir, file_name, size, support_range, self.config.connections);
        task.id = id;
        let downloader = ChunkedDownloader::new(
            TaskContext::new(task, request, proxy),
            self.transport.clone(),
            self.config.write_strategy.build(),
            Handle::current(),
        )
        .with_callback(Arc::new(ManagerCallback { addr, id }));
        Ok(Arc::new(downloader))
    }

    fn downloader(&self, id: &Uuid) -> DownloadResult<Arc<ChunkedDownloader>> {
        self.tasks
            .get(id)
            .map(|t| t.downloader.clone())
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }

    /// 用下载器的当前状态刷新元数据
    fn refresh(&mut self, id: &Uuid) {
        let Some(managed) = self.tasks.get(id) else {
            return;
        };
        let snapshot = managed.downloader.snapshot();
        if let Some(meta) = self.metas.get_mut(id) {
            meta.status = snapshot.status.clone();
            meta.progress = snapshot.progress();
        }
        self.save_tasks_to_file();
    }

    /// 重试失败的分片；所有失败分片都已用尽重试次数的任务直接判定失败
    fn supervise(&mut self) {
        let now = Instant::now();
        let mut exhausted = Vec::new();
        for (id, managed) in self.tasks.iter_mut() {
            if managed.downloader.task().status() != TaskStatus::Running {
                continue;
            }
            let failed: Vec<ChunkRef> = managed.downloader.task().chunks()
                .into_iter()
                .filter(|c| c.snapshot().status == ChunkStatus::Fail)
                .collect();
            if failed.is_empty() {
                continue;
            }

            let mut retrying = false;
            for chunk in failed {
                let retry = managed.retries.entry(chunk.index()).or_default();
                if retry.is_exhausted(&self.retry) {
                    continue;
                }
                retrying = true;
                if retry.is_due(&self.retry, now) {
                    retry.record_retry();
                    log::warn!(
                        "分片 {} #{} 第 {} 次重试",
                        managed.downloader.task().file_name,
                        chunk.index(),
                        retry.retry_count
                    );
                    managed.downloader.retry_chunk(&chunk);
                }
            }
            if !retrying {
                exhausted.push(*id);
            }
        }

        for id in exhausted {
            if let Some(managed) = self.tasks.get(&id) {
                managed.downloader.fail(DownloadError::ConnectFailure(format!(
                    "分片重试 {} 次后仍然失败",
                    self.retry.max_retries
                )));
            }
        }
    }

    pub fn save_tasks_to_file(&self) {
        let path = self.config.journal_path();
        let mut metas: Vec<&DownloadTaskMeta> = self.metas.values().collect();
        metas.sort_by_key(|m| m.created_at);
        let result = serde_json::to_string_pretty(&metas)
            .map_err(|e| DownloadError::Unknown(e.to_string()))
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, json)?;
                Ok(())
            });
        if let Err(e) = result {
            log::warn!("保存任务记录失败: {} - {}", path.display(), e);
        }
    }

    pub fn load_tasks_from_file(&mut self) {
        let path = self.config.journal_path();
        let Ok(data) = fs::read_to_string(&path) else {
            return;
        };
        match serde_json::from_str::<Vec<DownloadTaskMeta>>(&data) {
            Ok(list) => {
                for mut meta in list {
                    // 未完成的任务需要重新开始
                    if !meta.status.is_terminal() {
                        meta.status = TaskStatus::Ready;
                        meta.progress = 0.0;
                    }
                    self.metas.insert(meta.id, meta);
                }
                log::info!("已载入 {} 条任务记录", self.metas.len());
            }
            Err(e) => log::warn!("任务记录无法解析: {} - {}", path.display(), e),
        }
    }
}

impl Actor for DownloadManagerActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        // 为记录中未完成的任务重建下载器
        let pending: Vec<DownloadTaskMeta> = self.metas.values()
            .filter(|m| !m.status.is_terminal())
            .cloned()
            .collect();
        for meta in pending {
            match self.build_downloader(ctx.address(), meta.id, &meta.url, &meta.file_name, meta.size, meta.support_range) {
                Ok(downloader) => {
                    self.tasks.insert(meta.id, ManagedTask { downloader, retries: HashMap::new() });
                }
                Err(e) => log::warn!("无法恢复任务 {}: {}", meta.url, e),
            }
        }

        ctx.run_interval(self.supervise_interval, |act, _ctx| act.supervise());
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        for managed in self.tasks.values() {
            managed.downloader.close();
        }
    }
}

/// 添加下载任务
pub struct AddTask {
    pub url: String,
    /// 为空时从 URL 推断
    pub file_name: Option<String>,
    pub info: FileInfo,
}
impl Message for AddTask { type Result = Result<Uuid, DownloadError>; }
/// 处理添加下载任务消息
impl Handler<AddTask> for DownloadManagerActor {
    type Result = Result<Uuid, DownloadError>;
    fn handle(&mut self, msg: AddTask, ctx: &mut Self::Context) -> Self::Result {
        validator::validate_url(&msg.url)?;
        let file_name = msg.file_name
            .or_else(|| file_name_from_url(&msg.url))
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
        validator::validate_file_name(&file_name)?;

        let id = Uuid::new_v4();
        let downloader = self.build_downloader(ctx.address(), id, &msg.url, &file_name, msg.info.size, msg.info.supports_range)?;
        let task = downloader.task();
        let meta = DownloadTaskMeta {
            id,
            url: msg.url,
            file_path: task.file_path.clone(),
            file_name,
            size: task.total_size,
            support_range: task.support_range,
            status: TaskStatus::Ready,
            progress: 0.0,
            created_at: Local::now(),
        };
        log::info!("添加任务: {} -> {}", meta.url, task.task_file_path().display());
        self.tasks.insert(id, ManagedTask { downloader, retries: HashMap::new() });
        self.metas.insert(id, meta);
        self.save_tasks_to_file();
        Ok(id)
    }
}

/// 启动指定任务
pub struct StartTaskById { pub task_id: Uuid }
impl Message for StartTaskById { type Result = Result<(), DownloadError>; }
impl Handler<StartTaskById> for DownloadManagerActor {
    type Result = Result<(), DownloadError>;
    fn handle(&mut self, msg: StartTaskById, _ctx: &mut Self::Context) -> Self::Result {
        let downloader = self.downloader(&msg.task_id)?;
        if let Some(managed) = self.tasks.get_mut(&msg.task_id) {
            managed.retries.clear();
        }
        let result = downloader.start();
        self.refresh(&msg.task_id);
        result
    }
}

/// 暂停指定任务
pub struct PauseTaskById { pub task_id: Uuid }
impl Message for PauseTaskById { type Result = Result<(), DownloadError>; }
impl Handler<PauseTaskById> for DownloadManagerActor {
    type Result = Result<(), DownloadError>;
    fn handle(&mut self, msg: PauseTaskById, _ctx: &mut Self::Context) -> Self::Result {
        let result = self.downloader(&msg.task_id)?.pause();
        self.refresh(&msg.task_id);
        result
    }
}

/// 继续指定任务，重试次数清零
pub struct ResumeTaskById { pub task_id: Uuid }
impl Message for ResumeTaskById { type Result = Result<(), DownloadError>; }
impl Handler<ResumeTaskById> for DownloadManagerActor {
    type Result = Result<(), DownloadError>;
    fn handle(&mut self, msg: ResumeTaskById, _ctx: &mut Self::Context) -> Self::Result {
        let downloader = self.downloader(&msg.task_id)?;
        downloader.resume()?;
        if let Some(managed) = self.tasks.get_mut(&msg.task_id) {
            managed.retries.clear();
        }
        self.refresh(&msg.task_id);
        Ok(())
    }
}

/// 关闭指定任务的连接和文件，不改变状态
pub struct CloseTaskById { pub task_id: Uuid }
impl Message for CloseTaskById { type Result = (); }
impl Handler<CloseTaskById> for DownloadManagerActor {
    type Result = ();
    fn handle(&mut self, msg: CloseTaskById, _ctx: &mut Self::Context) {
        if let Some(managed) = self.tasks.get(&msg.task_id) {
            managed.downloader.close();
        }
    }
}

/// 移除指定任务
pub struct RemoveTaskById { pub task_id: Uuid }
impl Message for RemoveTaskById { type Result = Result<bool, DownloadError>; }
impl Handler<RemoveTaskById> for DownloadManagerActor {
    type Result = Result<bool, DownloadError>;
    fn handle(&mut self, msg: RemoveTaskById, _ctx: &mut Self::Context) -> Self::Result {
        if let Some(managed) = self.tasks.remove(&msg.task_id) {
            managed.downloader.close();
        }
        let removed = self.metas.remove(&msg.task_id).is_some();
        self.save_tasks_to_file();
        Ok(removed)
    }
}

/// 查询指定任务的快照
pub struct QueryTaskSnapshot { pub task_id: Uuid }
impl Message for QueryTaskSnapshot { type Result = Option<TaskSnapshot>; }
impl Handler<QueryTaskSnapshot> for DownloadManagerActor {
    type Result = Option<TaskSnapshot>;
    fn handle(&mut self, msg: QueryTaskSnapshot, _ctx: &mut Self::Context) -> Self::Result {
        self.tasks.get(&msg.task_id).map(|t| t.downloader.snapshot())
    }
}

/// 查询所有任务元数据
pub struct ListTasks;
impl Message for ListTasks { type Result = Vec<DownloadTaskMeta>; }
impl Handler<ListTasks> for DownloadManagerActor {
    type Result = MessageResult<ListTasks>;
    fn handle(&mut self, _msg: ListTasks, _ctx: &mut Self::Context) -> Self::Result {
        let mut metas: Vec<DownloadTaskMeta> = self.metas.values().cloned().collect();
        metas.sort_by_key(|m| m.created_at);
        MessageResult(metas)
    }
}

/// 查询汇总信息
pub struct GetStats;
impl Message for GetStats { type Result = DownloadStats; }
impl Handler<GetStats> for DownloadManagerActor {
    type Result = MessageResult<GetStats>;
    fn handle(&mut self, _msg: GetStats, _ctx: &mut Self::Context) -> Self::Result {
        let mut stats = DownloadStats { total: self.metas.len(), ..DownloadStats::default() };
        for meta in self.metas.values() {
            match meta.status {
                TaskStatus::Running | TaskStatus::Merging => stats.running += 1,
                TaskStatus::Pause => stats.paused += 1,
                TaskStatus::Done => stats.done += 1,
                TaskStatus::Failed(_) => stats.failed += 1,
                TaskStatus::Ready => {}
            }
        }
        stats.downloaded_bytes = self.tasks.values().map(|t| t.downloader.snapshot().down_size()).sum();
        MessageResult(stats)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEventKind {
    Started,
    Paused,
    Continued,
    ChunkDone(usize),
    Done,
    Error(String),
}

/// 下载器发出的通知
pub struct TaskEvent {
    pub id: Uuid,
    pub kind: TaskEventKind,
}
impl Message for TaskEvent { type Result = (); }
impl Handler<TaskEvent> for DownloadManagerActor {
    type Result = ();
    fn handle(&mut self, msg: TaskEvent, _ctx: &mut Self::Context) {
        match &msg.kind {
            TaskEventKind::ChunkDone(index) => {
                if let Some(managed) = self.tasks.get_mut(&msg.id) {
                    managed.retries.remove(index);
                }
            }
            TaskEventKind::Error(reason) => log::error!("任务 {} 失败: {}", msg.id, reason),
            TaskEventKind::Done => log::info!("任务 {} 完成", msg.id),
            _ => {}
        }
        self.refresh(&msg.id);
    }
}

/// 把下载器的通知转发给管理器
struct ManagerCallback {
    addr: Addr<DownloadManagerActor>,
    id: Uuid,
}

impl ManagerCallback {
    fn send(&self, kind: TaskEventKind) {
        self.addr.do_send(TaskEvent { id: self.id, kind });
    }
}

impl DownloadCallback for ManagerCallback {
    fn on_start(&self, _ctx: &TaskContext) {
        self.send(TaskEventKind::Started);
    }

    fn on_pause(&self, _ctx: &TaskContext) {
        self.send(TaskEventKind::Paused);
    }

    fn on_continue(&self, _ctx: &TaskContext) {
        self.send(TaskEventKind::Continued);
    }

    fn on_chunk_done(&self, _ctx: &TaskContext, chunk: &DownloadChunk) {
        self.send(TaskEventKind::ChunkDone(chunk.index));
    }

    fn on_done(&self, _ctx: &TaskContext) {
        self.send(TaskEventKind::Done);
    }

    fn on_error(&self, _ctx: &TaskContext, error: &DownloadError) {
        self.send(TaskEventKind::Error(error.to_string()));
    }
}
