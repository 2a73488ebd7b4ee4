//! 命令队列
//!
//! 多生产者（请求处理线程）追加，单消费者（主循环）执行后弹出。
//! 每条命令入队时分配递增序号，消费者只弹出自己执行过的那一条，
//! 即使期间队列被清空或重新填充也不会误删。

use std::collections::VecDeque;

use parking_lot::Mutex;
use spot_protocol::Command;

/// 带序号的队列项
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub seq: u64,
    pub command: Command,
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<QueuedCommand>,
    next_seq: u64,
}

/// 线程安全的 FIFO 命令队列
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<Inner>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加命令，返回分配的序号
    pub fn push(&self, command: Command) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.items.push_back(QueuedCommand { seq, command });
        seq
    }

    /// 队首命令（不弹出）
    pub fn front(&self) -> Option<QueuedCommand> {
        self.inner.lock().items.front().cloned()
    }

    /// 弹出序号为 `seq` 的命令，不存在时返回 `None`
    pub fn pop_if(&self, seq: u64) -> Option<Command> {
        let mut inner = self.inner.lock();
        let index = inner.items.iter().position(|item| item.seq == seq)?;
        inner.items.remove(index).map(|item| item.command)
    }

    /// 清空队列，返回被丢弃的命令数
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.items.len();
        inner.items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// 当前内容（按执行顺序）
    pub fn snapshot(&self) -> Vec<Command> {
        self.inner
            .lock()
            .items
            .iter()
            .map(|item| item.command.clone())
            .collect()
    }
}
