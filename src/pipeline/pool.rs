// 该文件是 Beifeng （北风） 项目的一部分。
// src/pipeline/pool.rs - BlobBuffer 缓冲池
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

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};

use super::{BlockQueue, PipelineError};
use crate::blob::{BlobBuffer, ShapePolicy};

struct PoolShared {
  free: BlockQueue<BlobBuffer>,
  capacity: usize,
  checked_out: AtomicUsize,
  peak: AtomicUsize,
}

/// 固定数量的 BlobBuffer，借出时独占，归还时复位
#[derive(Clone)]
pub struct BlobPool {
  shared: Arc<PoolShared>,
}

impl BlobPool {
  pub fn new(capacity: usize, mut factory: impl FnMut() -> BlobBuffer) -> Self {
    let capacity = capacity.max(1);
    let free = BlockQueue::new(capacity);
    for _ in 0..capacity {
      let _ = free.push(factory());
    }
    debug!("缓冲池分配完成, 容量 {}", capacity);

    Self {
      shared: Arc::new(PoolShared {
        free,
        capacity,
        checked_out: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
      }),
    }
  }

  /// 阻塞直到取得一个空闲缓冲区
  pub fn acquire(&self) -> Result<PooledBlob, PipelineError> {
    let buffer = self.shared.free.take().ok_or(PipelineError::PoolClosed)?;
    Ok(self.checked_out(buffer))
  }

  pub fn try_acquire(&self) -> Option<PooledBlob> {
    self.shared.free.try_take().map(|b| self.checked_out(b))
  }

  fn checked_out(&self, buffer: BlobBuffer) -> PooledBlob {
    let now = self.shared.checked_out.fetch_add(1, Ordering::AcqRel) + 1;
    self.shared.peak.fetch_max(now, Ordering::AcqRel);
    PooledBlob {
      buffer,
      pool: Arc::clone(&self.shared),
    }
  }

  /// 关闭缓冲池并释放空闲缓冲区，仍被借出的缓冲区在归还时释放
  pub fn release_all(&self) {
    self.shared.free.set_no_more_input();
    let mut released = 0;
    for mut buffer in self.shared.free.drain() {
      buffer.release();
      released += 1;
    }
    info!(
      "缓冲池已关闭, 释放 {} 个缓冲区, 仍借出 {} 个",
      released,
      self.in_use()
    );
  }

  pub fn is_closed(&self) -> bool {
    self.shared.free.is_closed()
  }

  pub fn in_use(&self) -> usize {
    self.shared.checked_out.load(Ordering::Acquire)
  }

  pub fn peak_in_use(&self) -> usize {
    self.shared.peak.load(Ordering::Acquire)
  }

  pub fn capacity(&self) -> usize {
    self.shared.capacity
  }
}

/// 借出的缓冲区，离开作用域时归还缓冲池
pub struct PooledBlob {
  buffer: BlobBuffer,
  pool: Arc<PoolShared>,
}

impl Deref for PooledBlob {
  type Target = BlobBuffer;

  fn deref(&self) -> &BlobBuffer {
    &self.buffer
  }
}

impl DerefMut for PooledBlob {
  fn deref_mut(&mut self) -> &mut BlobBuffer {
    &mut self.buffer
  }
}

impl Drop for PooledBlob {
  fn drop(&mut self) {
    let empty = BlobBuffer::allocate(&[], &[], ShapePolicy::Dynamic);
    let mut buffer = std::mem::replace(&mut self.buffer, empty);
    buffer.wait_pending();
    buffer.reset();
    self.pool.checked_out.fetch_sub(1, Ordering::AcqRel);
    if let Err(mut buffer) = self.pool.free.push(buffer) {
      buffer.release();
    }
  }
}
