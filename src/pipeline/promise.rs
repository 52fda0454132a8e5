// 该文件是 Beifeng （北风） 项目的一部分。
// src/pipeline/promise.rs - 任务结果的 promise / future
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

use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::time::Duration;

use super::PipelineError;

type Outcome<T> = Result<T, PipelineError>;

/// 创建一对 promise / future
pub fn promise<T>() -> (Promise<T>, PackageFuture<T>) {
  let (tx, rx) = sync_channel(1);
  (Promise { tx: Some(tx) }, PackageFuture { rx })
}

/// 结果的写入端，只能写入一次；未写入就被丢弃时 future 得到 `Abandoned`
pub struct Promise<T> {
  tx: Option<SyncSender<Outcome<T>>>,
}

impl<T> Promise<T> {
  pub fn resolve(mut self, outcome: Outcome<T>) {
    if let Some(tx) = self.tx.take() {
      let _ = tx.send(outcome);
    }
  }

  pub fn fulfill(self, value: T) {
    self.resolve(Ok(value));
  }

  pub fn fail(self, err: PipelineError) {
    self.resolve(Err(err));
  }
}

impl<T> Drop for Promise<T> {
  fn drop(&mut self) {
    if let Some(tx) = self.tx.take() {
      let _ = tx.send(Err(PipelineError::Abandoned));
    }
  }
}

/// 调用方持有的结果读取端
pub struct PackageFuture<T> {
  rx: Receiver<Outcome<T>>,
}

impl<T> PackageFuture<T> {
  /// 阻塞直到任务完成或失败
  pub fn get(self) -> Outcome<T> {
    self.rx.recv().unwrap_or(Err(PipelineError::Abandoned))
  }

  /// 最多等待 `timeout`，超时后 future 仍然可以继续等待
  pub fn get_timeout(&self, timeout: Duration) -> Outcome<T> {
    match self.rx.recv_timeout(timeout) {
      Ok(outcome) => outcome,
      Err(RecvTimeoutError::Timeout) => Err(PipelineError::Timeout),
      Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Abandoned),
    }
  }
}
