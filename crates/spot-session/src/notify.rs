//! 客户端通知总线
//!
//! 每个连接的客户端拥有一个有界通道，总线按目标投递：
//!
//! - [`Target::Client`]：单个客户端
//! - [`Target::Broadcast`]：全部客户端
//! - [`Target::Log`]：不投递，只写日志（服务端内部发起的操作）
//!
//! 投递使用 `try_send`：通道已满时丢弃该条通知（无背压），
//! 慢客户端不会阻塞主循环。

use std::collections::BTreeMap;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::RwLock;
use serde_json::Value;
use spot_protocol::{Notification, NotificationKind, Severity};
use tracing::{debug, info, trace, warn};

/// 客户端编号（最小可用的非负整数）
pub type ClientId = usize;

/// 每个客户端通道的默认容量
pub const DEFAULT_CLIENT_CAPACITY: usize = 256;

/// 通知目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Client(ClientId),
    Broadcast,
    Log,
}

/// 通知总线
#[derive(Debug)]
pub struct NotificationBus {
    clients: RwLock<BTreeMap<ClientId, Sender<Notification>>>,
    capacity: usize,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: RwLock::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// 注册新客户端
    ///
    /// 分配最小的空闲编号，并立即在其通道中放入 `socket_create` 通知。
    pub fn subscribe(&self) -> (ClientId, Receiver<Notification>) {
        let (tx, rx) = bounded(self.capacity);
        let mut clients = self.clients.write();
        let id = (0..=clients.len())
            .find(|i| !clients.contains_key(i))
            .unwrap_or(clients.len());
        let _ = tx.try_send(Notification::event(NotificationKind::SocketCreate, id));
        clients.insert(id, tx);
        info!("Client {} connected ({} total)", id, clients.len());
        (id, rx)
    }

    /// 注销客户端，返回是否存在
    pub fn unsubscribe(&self, id: ClientId) -> bool {
        let removed = self.clients.write().remove(&id).is_some();
        if removed {
            info!("Client {} disconnected", id);
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().keys().copied().collect()
    }

    /// 投递一条通知
    pub fn send(&self, target: Target, notification: Notification) {
        match target {
            Target::Client(id) => {
                let clients = self.clients.read();
                match clients.get(&id) {
                    Some(tx) => Self::deliver(id, tx, notification),
                    None => debug!(
                        "Dropping {} notification for unknown client {}",
                        notification.kind.as_str(),
                        id
                    ),
                }
            },
            Target::Broadcast => {
                let clients = self.clients.read();
                for (id, tx) in clients.iter() {
                    Self::deliver(*id, tx, notification.clone());
                }
            },
            Target::Log => match notification.text() {
                Some(text) => info!("[{}] {}", notification.kind.as_str(), text),
                None => info!("[{}] {}", notification.kind.as_str(), notification.payload),
            },
        }
    }

    fn deliver(id: ClientId, tx: &Sender<Notification>, notification: Notification) {
        match tx.try_send(notification) {
            Ok(()) => {},
            Err(TrySendError::Full(n)) => {
                warn!("Client {} channel full, dropping {} notification", id, n.kind.as_str());
            },
            Err(TrySendError::Disconnected(n)) => {
                trace!("Client {} receiver gone, dropping {}", id, n.kind.as_str());
            },
        }
    }

    /// 状态事件（无严重级别）
    pub fn event(&self, target: Target, kind: NotificationKind, payload: impl Into<Value>) {
        self.send(target, Notification::event(kind, payload));
    }

    pub fn message(&self, target: Target, severity: Severity, text: impl Into<String>) {
        self.send(target, Notification::message(severity, text));
    }

    pub fn info(&self, target: Target, text: impl Into<String>) {
        self.message(target, Severity::Info, text);
    }

    pub fn success(&self, target: Target, text: impl Into<String>) {
        self.message(target, Severity::Success, text);
    }

    pub fn warning(&self, target: Target, text: impl Into<String>) {
        self.message(target, Severity::Warning, text);
    }

    pub fn error(&self, target: Target, text: impl Into<String>) {
        self.message(target, Severity::Error, text);
    }
}
