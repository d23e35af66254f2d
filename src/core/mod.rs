//! Core: 分片下载引擎、传输层、任务管理 actor 与错误类型

pub mod actor_manager;
pub mod error;
pub mod task;
pub mod transport;

// 只导出主流程和其它模块实际用到的类型
pub use actor_manager::{
    DownloadManagerActor, DownloadStats, DownloadTaskMeta, AddTask, StartTaskById, PauseTaskById,
    ResumeTaskById, CloseTaskById, RemoveTaskById, QueryTaskSnapshot, ListTasks, GetStats,
};
pub use error::{DownloadError, DownloadResult};
pub use task::{ChunkStatus, TaskSnapshot, TaskStatus};
