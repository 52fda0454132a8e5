// 该文件是 Beifeng （北风） 项目的一部分。
// src/pipeline/queue.rs - 有界阻塞队列
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct QueueState<T> {
  items: VecDeque<T>,
  closed: bool,
}

/// 有界阻塞队列
///
/// 队列满时 `push` 阻塞，队列空时 `take` 阻塞。调用 `set_no_more_input` 之后
/// 不再接受新元素，已有元素仍可取出，取空后 `take` 返回 `None`。
pub struct BlockQueue<T> {
  state: Mutex<QueueState<T>>,
  not_empty: Condvar,
  not_full: Condvar,
  capacity: usize,
}

impl<T> BlockQueue<T> {
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      state: Mutex::new(QueueState {
        items: VecDeque::with_capacity(capacity),
        closed: false,
      }),
      not_empty: Condvar::new(),
      not_full: Condvar::new(),
      capacity,
    }
  }

  fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 阻塞直到有空位，队列已关闭时原样交还元素
  pub fn push(&self, item: T) -> Result<(), T> {
    let mut state = self.lock();
    while !state.closed && state.items.len() >= self.capacity {
      state = self
        .not_full
        .wait(state)
        .unwrap_or_else(PoisonError::into_inner);
    }
    if state.closed {
      return Err(item);
    }
    state.items.push_back(item);
    drop(state);
    self.not_empty.notify_one();
    Ok(())
  }

  pub fn try_push(&self, item: T) -> Result<(), T> {
    let mut state = self.lock();
    if state.closed || state.items.len() >= self.capacity {
      return Err(item);
    }
    state.items.push_back(item);
    drop(state);
    self.not_empty.notify_one();
    Ok(())
  }

  /// 阻塞直到取得元素；队列关闭且为空时返回 `None`
  pub fn take(&self) -> Option<T> {
    let mut state = self.lock();
    loop {
      if let Some(item) = state.items.pop_front() {
        drop(state);
        self.not_full.notify_one();
        return Some(item);
      }
      if state.closed {
        return None;
      }
      state = self
        .not_empty
        .wait(state)
        .unwrap_or_else(PoisonError::into_inner);
    }
  }

  pub fn try_take(&self) -> Option<T> {
    let item = self.lock().items.pop_front();
    if item.is_some() {
      self.not_full.notify_one();
    }
    item
  }

  /// 关闭队列并唤醒所有等待者
  pub fn set_no_more_input(&self) {
    self.lock().closed = true;
    self.not_empty.notify_all();
    self.not_full.notify_all();
  }

  pub fn is_closed(&self) -> bool {
    self.lock().closed
  }

  pub fn len(&self) -> usize {
    self.lock().items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// 取走当前所有元素，不阻塞
  pub fn drain(&self) -> Vec<T> {
    let items: Vec<T> = self.lock().items.drain(..).collect();
    self.not_full.notify_all();
    items
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;
  use std::time::Duration;

  #[test]
  fn push_blocks_until_space() {
    let queue = Arc::new(BlockQueue::new(1));
    queue.push(1).unwrap();
    assert_eq!(queue.try_push(2), Err(2));

    let producer = {
      let queue = Arc::clone(&queue);
      thread::spawn(move || queue.push(2))
    };
    thread::sleep(Duration::from_millis(20));
    assert_eq!(queue.take(), Some(1));
    producer.join().unwrap().unwrap();
    assert_eq!(queue.take(), Some(2));
  }

  #[test]
  fn closed_queue_drains_then_ends() {
    let queue = BlockQueue::new(4);
    queue.push("a").unwrap();
    queue.set_no_more_input();
    assert_eq!(queue.push("b"), Err("b"));
    assert_eq!(queue.take(), Some("a"));
    assert_eq!(queue.take(), None);
  }

  #[test]
  fn close_wakes_blocked_consumer() {
    let queue = Arc::new(BlockQueue::<u32>::new(2));
    let consumer = {
      let queue = Arc::clone(&queue);
      thread::spawn(move || queue.take())
    };
    thread::sleep(Duration::from_millis(20));
    queue.set_no_more_input();
    assert_eq!(consumer.join().unwrap(), None);
  }
}
