//! 发现与下载之间的生产者/消费者队列。
//!
//! 底层是一条无界 crossbeam 通道：`add` 发送，`complete()` 丢弃唯一的发送端，
//! `drain()` 克隆接收端阻塞读取，发送端关闭且通道取空后结束。多个消费者
//! 各自 `drain()` 时，每个条目只会交给其中一个。

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam_channel::{Receiver, Sender, unbounded};
use thiserror::Error;

use super::models::Post;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("post queue already completed, rejected {0}")]
pub struct QueueClosed(pub String);

#[derive(Debug)]
pub struct PostQueue {
    // None 表示已完成
    tx: RwLock<Option<Sender<Post>>>,
    rx: Receiver<Post>,
}

impl Default for PostQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PostQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx: RwLock::new(Some(tx)),
            rx,
        }
    }

    pub fn add(&self, post: Post) -> Result<(), QueueClosed> {
        match self.sender().as_ref() {
            Some(tx) => tx.send(post).map_err(|e| QueueClosed(e.into_inner().url)),
            None => Err(QueueClosed(post.url)),
        }
    }

    /// 幂等，不阻塞。
    pub fn complete(&self) {
        self.sender_mut().take();
    }

    pub fn is_completed(&self) -> bool {
        self.sender().is_none()
    }

    /// 尚未被取走的条目数。
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn drain(&self) -> Drain {
        Drain {
            rx: self.rx.clone(),
        }
    }

    fn sender(&self) -> RwLockReadGuard<'_, Option<Sender<Post>>> {
        self.tx.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender_mut(&self) -> RwLockWriteGuard<'_, Option<Sender<Post>>> {
        self.tx.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 单次遍历的阻塞迭代器。
#[derive(Debug)]
pub struct Drain {
    rx: Receiver<Post>,
}

impl Iterator for Drain {
    type Item = Post;

    fn next(&mut self) -> Option<Post> {
        self.rx.recv().ok()
    }
}

/// drop 时发出完成信号，保证生产方无论如何退出都会关闭队列。
pub(crate) struct CompleteOnDrop<'a>(pub(crate) &'a PostQueue);

impl Drop for CompleteOnDrop<'_> {
    fn drop(&mut self) {
        self.0.complete();
    }
}
