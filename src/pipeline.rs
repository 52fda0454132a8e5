// 该文件是 Beifeng （北风） 项目的一部分。
// src/pipeline.rs - 异步推理流水线
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

mod core;
mod pool;
mod promise;
mod queue;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::core::{AsyncPipeline, PackageBody, Stage, WorkPackage};
pub use self::pool::{BlobPool, PooledBlob};
pub use self::promise::{PackageFuture, Promise, promise};
pub use self::queue::BlockQueue;

/// 阶段回调返回的错误
pub type StageError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
  #[error("流水线已在运行")]
  AlreadyRunning,
  #[error("流水线未运行")]
  NotRunning,
  #[error("阶段 {stage} 执行失败: {message}")]
  StageFailed { stage: String, message: String },
  #[error("阶段 {0} 发生崩溃")]
  StagePanicked(String),
  #[error("任务在完成前被丢弃")]
  Abandoned,
  #[error("等待结果超时")]
  Timeout,
  #[error("缓冲池已关闭")]
  PoolClosed,
  #[error("无法创建工作线程: {0}")]
  Spawn(String),
  #[error("任务没有产生结果")]
  MissingOutput,
  #[error("流水线配置无效: {0}")]
  InvalidConfig(String),
}

/// 单个任务在流水线中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
  Created,
  PreProcessing,
  Inferring,
  PostProcessing,
  Completed,
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Stopped,
  Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// 每个阶段入队的容量
  pub queue_capacity: usize,
  /// 缓冲池中 BlobBuffer 的数量
  pub pool_size: usize,
  pub workers_per_stage: usize,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      queue_capacity: 5,
      pool_size: 5,
      workers_per_stage: 1,
    }
  }
}

impl PipelineConfig {
  pub fn from_json(text: &str) -> Result<Self, PipelineError> {
    let config: PipelineConfig =
      serde_json::from_str(text).map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), PipelineError> {
    if self.queue_capacity == 0 {
      return Err(PipelineError::InvalidConfig(
        "queue_capacity 必须大于 0".to_string(),
      ));
    }
    if self.pool_size == 0 {
      return Err(PipelineError::InvalidConfig("pool_size 必须大于 0".to_string()));
    }
    if self.workers_per_stage == 0 {
      return Err(PipelineError::InvalidConfig(
        "workers_per_stage 必须大于 0".to_string(),
      ));
    }
    Ok(())
  }
}
