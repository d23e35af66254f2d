use serde::{Serialize, Deserialize};

/// 下载任务状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Ready,
    Running,
    Pause,
    /// 所有分片已完成，正在合并
    Merging,
    Done,
    Failed(String),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed(_))
    }
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    /// 已构建，尚未发起连接
    Pending,
    /// 正常发起的连接
    ConnectingNormal,
    /// 失败后重试发起的连接
    ConnectingFail,
    /// 响应头已接受，正在接收数据
    Running,
    /// 连接未能建立
    Fail,
    Pause,
    Done,
}

impl ChunkStatus {
    pub fn is_connecting(&self) -> bool {
        matches!(self, ChunkStatus::ConnectingNormal | ChunkStatus::ConnectingFail)
    }

    /// 仍然持有（或即将持有）网络连接的状态
    pub fn is_active(&self) -> bool {
        self.is_connecting() || *self == ChunkStatus::Running
    }
}
