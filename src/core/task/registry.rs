//! 分片资源表：按分片索引保存连接与文件句柄
//!
//! 这些句柄不属于任务的持久化状态，暂停后会被关闭并在恢复时重新建立。
//! 写入只应在持有对应分片锁时进行；表自身的锁是叶子锁，持有期间不获取其他锁。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::transport::Connection;
use super::strategy::FileWriter;

pub const ATTR_CHANNEL: &str = "channel";
pub const ATTR_FILE_WRITERS: &str = "file_writers";

/// 资源表中的句柄
#[derive(Clone)]
pub enum Attr {
    Channel(Arc<dyn Connection>),
    FileWriters(Vec<Arc<dyn FileWriter>>),
}

impl std::fmt::Debug for Attr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attr::Channel(c) => write!(f, "Channel({})", c.id()),
            Attr::FileWriters(w) => write!(f, "FileWriters({})", w.len()),
        }
    }
}

type AttrMap = HashMap<&'static str, Attr>;

#[derive(Default)]
pub struct ResourceRegistry {
    attrs: Mutex<HashMap<usize, AttrMap>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<usize, AttrMap>> {
        self.attrs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 首次写入时创建分片的条目
    pub fn set_attr(&self, index: usize, key: &'static str, value: Attr) {
        self.table().entry(index).or_default().insert(key, value);
    }

    pub fn get_attr(&self, index: usize, key: &str) -> Option<Attr> {
        self.table().get(&index).and_then(|m| m.get(key)).cloned()
    }

    pub fn set_channel(&self, index: usize, channel: Arc<dyn Connection>) {
        self.set_attr(index, ATTR_CHANNEL, Attr::Channel(channel));
    }

    pub fn get_channel(&self, index: usize) -> Option<Arc<dyn Connection>> {
        match self.get_attr(index, ATTR_CHANNEL) {
            Some(Attr::Channel(c)) => Some(c),
            _ => None,
        }
    }

    pub fn set_file_writers(&self, index: usize, writers: Vec<Arc<dyn FileWriter>>) {
        self.set_attr(index, ATTR_FILE_WRITERS, Attr::FileWriters(writers));
    }

    pub fn get_file_writers(&self, index: usize) -> Option<Vec<Arc<dyn FileWriter>>> {
        match self.get_attr(index, ATTR_FILE_WRITERS) {
            Some(Attr::FileWriters(w)) => Some(w),
            _ => None,
        }
    }

    /// 删除分片的整个条目并交出其中的句柄
    pub fn remove(&self, index: usize) -> Option<HashMap<&'static str, Attr>> {
        self.table().remove(&index)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.table().contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::testing::{MockConnection, MemoryWriter};

    #[test]
    fn test_entry_created_lazily() {
        let registry = ResourceRegistry::new();
        assert!(registry.get_channel(0).is_none());
        assert!(!registry.contains(0));

        registry.set_channel(0, Arc::new(MockConnection::new()));
        assert!(registry.contains(0));
        assert!(registry.get_channel(0).is_some());
        assert!(registry.get_file_writers(0).is_none());
    }

    #[test]
    fn test_entries_are_per_chunk() {
        let registry = ResourceRegistry::new();
        let conn = Arc::new(MockConnection::new());
        let id = conn.id();
        registry.set_channel(1, conn);
        registry.set_file_writers(2, vec![Arc::new(MemoryWriter::default()) as Arc<dyn FileWriter>]);

        assert_eq!(registry.get_channel(1).map(|c| c.id()), Some(id));
        assert!(registry.get_channel(2).is_none());
        assert_eq!(registry.get_file_writers(2).map(|w| w.len()), Some(1));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_drops_whole_entry() {
        let registry = ResourceRegistry::new();
        registry.set_channel(3, Arc::new(MockConnection::new()));
        registry.set_file_writers(3, Vec::new());
        let removed = registry.remove(3).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.remove(3).is_none());
    }
}
