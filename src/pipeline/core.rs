// 该文件是 Beifeng （北风） 项目的一部分。
// src/pipeline/core.rs - 流水线阶段与工作线程
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

//! 多阶段流水线。
//!
//! 每个阶段有一个有界入队和若干工作线程。工作线程从入队取出任务、执行阶段回调，
//! 再推入下一阶段的入队；最后一个阶段负责兑现任务的 promise。
//! 失败的任务跳过后续回调但仍然向下游传递，保证每个 future 恰好被兑现一次。

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use super::{
  BlockQueue, PackageFuture, PackageState, PipelineError, PipelineState, Promise, StageError,
  promise,
};

/// 任务携带的数据，最后一个阶段把它转换为结果
pub trait PackageBody: Send + 'static {
  type Output: Send + 'static;

  fn into_output(self) -> Result<Self::Output, PipelineError>;
}

pub struct WorkPackage<B: PackageBody> {
  id: u64,
  state: PackageState,
  failure: Option<PipelineError>,
  body: B,
  promise: Promise<B::Output>,
}

impl<B: PackageBody> WorkPackage<B> {
  fn new(id: u64, body: B, promise: Promise<B::Output>) -> Self {
    Self {
      id,
      state: PackageState::Created,
      failure: None,
      body,
      promise,
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn state(&self) -> PackageState {
    self.state
  }

  pub fn is_failed(&self) -> bool {
    self.state == PackageState::Failed
  }

  pub fn body(&self) -> &B {
    &self.body
  }

  fn fail(&mut self, err: PipelineError) {
    self.state = PackageState::Failed;
    self.failure = Some(err);
  }

  /// 兑现 promise；任务的数据（包括借出的缓冲区）先于结果释放
  fn finish(self) {
    let WorkPackage {
      id,
      failure,
      body,
      promise,
      ..
    } = self;
    match failure {
      Some(err) => {
        drop(body);
        debug!("任务 {} 失败: {}", id, err);
        promise.fail(err);
      }
      None => {
        let outcome = body.into_output();
        debug!("任务 {} 完成", id);
        promise.resolve(outcome);
      }
    }
  }
}

type StageFn<B> = dyn Fn(&mut B) -> Result<(), StageError> + Send + Sync;

/// 流水线的一个阶段
pub struct Stage<B> {
  name: String,
  state: PackageState,
  workers: usize,
  run: Arc<StageFn<B>>,
}

impl<B> Clone for Stage<B> {
  fn clone(&self) -> Self {
    Self {
      name: self.name.clone(),
      state: self.state,
      workers: self.workers,
      run: Arc::clone(&self.run),
    }
  }
}

impl<B> Stage<B> {
  pub fn new(
    name: impl Into<String>,
    state: PackageState,
    run: impl Fn(&mut B) -> Result<(), StageError> + Send + Sync + 'static,
  ) -> Self {
    Self {
      name: name.into(),
      state,
      workers: 1,
      run: Arc::new(run),
    }
  }

  pub fn workers(mut self, workers: usize) -> Self {
    self.workers = workers.max(1);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// 执行回调，把错误与崩溃都转换为 `PipelineError`
  fn invoke(&self, body: &mut B) -> Result<(), PipelineError> {
    match catch_unwind(AssertUnwindSafe(|| (self.run)(body))) {
      Ok(Ok(())) => Ok(()),
      Ok(Err(e)) => Err(PipelineError::StageFailed {
        stage: self.name.clone(),
        message: e.to_string(),
      }),
      Err(_) => Err(PipelineError::StagePanicked(self.name.clone())),
    }
  }
}

struct Running<B: PackageBody> {
  ingress: Arc<BlockQueue<WorkPackage<B>>>,
  workers: Vec<JoinHandle<()>>,
}

pub struct AsyncPipeline<B: PackageBody> {
  name: String,
  stages: Vec<Stage<B>>,
  queue_capacity: usize,
  running: Mutex<Option<Running<B>>>,
  next_id: AtomicU64,
}

impl<B: PackageBody> AsyncPipeline<B> {
  pub fn new(name: impl Into<String>, stages: Vec<Stage<B>>, queue_capacity: usize) -> Self {
    Self {
      name: name.into(),
      stages,
      queue_capacity: queue_capacity.max(1),
      running: Mutex::new(None),
      next_id: AtomicU64::new(0),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Option<Running<B>>> {
    self.running.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn stages(&self) -> &[Stage<B>] {
    &self.stages
  }

  pub fn state(&self) -> PipelineState {
    match self.lock().is_some() {
      true => PipelineState::Running,
      false => PipelineState::Stopped,
    }
  }

  /// 创建各阶段队列并启动工作线程
  pub fn init(&self) -> Result<(), PipelineError> {
    let mut running = self.lock();
    if running.is_some() {
      warn!("流水线 {} 已在运行", self.name);
      return Err(PipelineError::AlreadyRunning);
    }

    let queues: Vec<Arc<BlockQueue<WorkPackage<B>>>> = self
      .stages
      .iter()
      .map(|_| Arc::new(BlockQueue::new(self.queue_capacity)))
      .collect();

    let mut workers = Vec::new();
    for (idx, stage) in self.stages.iter().enumerate() {
      let alive = Arc::new(AtomicUsize::new(stage.workers));
      for worker in 0..stage.workers {
        let inbound = Arc::clone(&queues[idx]);
        let outbound = queues.get(idx + 1).cloned();
        let stage = stage.clone();
        let alive = Arc::clone(&alive);
        let spawned = std::thread::Builder::new()
          .name(format!("{}-{}-{}", self.name, stage.name, worker))
          .spawn(move || stage_worker(stage, inbound, outbound, alive));
        match spawned {
          Ok(handle) => workers.push(handle),
          Err(e) => {
            error!("流水线 {} 无法创建工作线程: {}", self.name, e);
            for queue in &queues {
              queue.set_no_more_input();
            }
            for handle in workers {
              let _ = handle.join();
            }
            return Err(PipelineError::Spawn(e.to_string()));
          }
        }
      }
    }

    let Some(ingress) = queues.first().cloned() else {
      return Err(PipelineError::InvalidConfig("流水线没有任何阶段".to_string()));
    };
    info!(
      "流水线 {} 启动, 阶段 {} 个, 工作线程 {} 个",
      self.name,
      self.stages.len(),
      workers.len()
    );
    *running = Some(Running { ingress, workers });
    Ok(())
  }

  /// 提交任务；入队已满时阻塞
  pub fn submit(&self, body: B) -> Result<PackageFuture<B::Output>, PipelineError> {
    let ingress = match self.lock().as_ref() {
      Some(running) => Arc::clone(&running.ingress),
      None => {
        error!("流水线 {} 未运行, 无法提交任务", self.name);
        return Err(PipelineError::NotRunning);
      }
    };

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (promise, future) = promise();
    let package = WorkPackage::new(id, body, promise);
    if ingress.push(package).is_err() {
      error!("流水线 {} 已停止接收任务", self.name);
      return Err(PipelineError::NotRunning);
    }
    debug!("任务 {} 已提交", id);
    Ok(future)
  }

  /// 停止接收新任务，等待在途任务全部完成后回收工作线程
  pub fn stop(&self) -> Result<(), PipelineError> {
    let Some(running) = self.lock().take() else {
      warn!("流水线 {} 未运行", self.name);
      return Err(PipelineError::NotRunning);
    };

    running.ingress.set_no_more_input();
    for handle in running.workers {
      if handle.join().is_err() {
        error!("流水线 {} 的工作线程异常退出", self.name);
      }
    }
    info!("流水线 {} 已停止", self.name);
    Ok(())
  }
}

impl<B: PackageBody> Drop for AsyncPipeline<B> {
  fn drop(&mut self) {
    if self.state() == PipelineState::Running {
      let _ = self.stop();
    }
  }
}

fn stage_worker<B: PackageBody>(
  stage: Stage<B>,
  inbound: Arc<BlockQueue<WorkPackage<B>>>,
  outbound: Option<Arc<BlockQueue<WorkPackage<B>>>>,
  alive: Arc<AtomicUsize>,
) {
  while let Some(mut package) = inbound.take() {
    if !package.is_failed() {
      package.state = stage.state;
      if let Err(err) = stage.invoke(&mut package.body) {
        error!("任务 {} 在阶段 {} 失败: {}", package.id, stage.name, err);
        package.fail(err);
      }
    }

    match &outbound {
      Some(next) => {
        if let Err(mut package) = next.push(package) {
          package.fail(PipelineError::NotRunning);
          package.finish();
        }
      }
      None => {
        if !package.is_failed() {
          package.state = PackageState::Completed;
        }
        package.finish();
      }
    }
  }

  // 本阶段最后一个退出的工作线程负责关闭下游队列
  if alive.fetch_sub(1, Ordering::AcqRel) == 1 {
    if let Some(next) = outbound {
      next.set_no_more_input();
    }
    debug!("阶段 {} 已结束", stage.name);
  }
}
