// 该文件是 Beifeng （北风） 项目的一部分。
// src/model.rs - 模型外观与检测流水线
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

mod mobilesam;
mod rt_detr;
mod yolov8;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{error, info};

use crate::blob::{BlobBuffer, BlobError};
use crate::engine::{EngineError, InferenceEngine};
use crate::frame::ImageFrame;
use crate::pipeline::{
  AsyncPipeline, BlobPool, PackageBody, PackageFuture, PackageState, PipelineConfig,
  PipelineError, PipelineState, PooledBlob, Stage, StageError,
};
use crate::process::{BBox2D, ProcessError, TransformScale};

pub use self::mobilesam::{MobileSam, MobileSamBuilder, SamPackage, SamPrompt};
pub use self::rt_detr::{RtDetr, RtDetrBuilder};
pub use self::yolov8::{COCO_CLASSES, Yolov8, Yolov8Builder};

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("引擎错误: {0}")]
  Engine(#[from] EngineError),
  #[error("处理错误: {0}")]
  Process(#[from] ProcessError),
  #[error("缓冲区错误: {0}")]
  Blob(#[from] BlobError),
  #[error("流水线错误: {0}")]
  Pipeline(#[from] PipelineError),
  #[error("{model} 的引擎应有 {expected} 个张量, 实际为 {actual}")]
  BlobCountMismatch {
    model: String,
    expected: usize,
    actual: usize,
  },
  #[error("{model} 的引擎中没有张量 {name}")]
  MissingBlob { model: String, name: String },
  #[error("任务没有绑定缓冲区")]
  MissingBuffer,
  #[error("参数无效: {0}")]
  InvalidArgument(String),
}

/// 校验引擎的张量与模型期望的名称一致
pub(crate) fn check_blob_names(
  model: &str,
  engine: &dyn InferenceEngine,
  inputs: &[String],
  outputs: &[String],
) -> Result<(), ModelError> {
  let blobs = engine.alloc_blobs_buffer();
  let expected = inputs.len() + outputs.len();
  if blobs.size() != expected {
    error!(
      "{} 的引擎应有 {} 个张量, 实际为 {}",
      model,
      expected,
      blobs.size()
    );
    return Err(ModelError::BlobCountMismatch {
      model: model.to_string(),
      expected,
      actual: blobs.size(),
    });
  }
  for name in inputs.iter().chain(outputs) {
    if !blobs.contains(name) {
      error!("{} 的张量名称 {} 与引擎不匹配", model, name);
      return Err(ModelError::MissingBlob {
        model: model.to_string(),
        name: name.clone(),
      });
    }
  }
  Ok(())
}

/// 按名称读取一组 f32 输出张量并交给 `f`
pub(crate) fn with_f32_outputs<R>(
  blobs: &BlobBuffer,
  names: &[String],
  f: impl FnOnce(&[&[f32]]) -> Result<R, ModelError>,
) -> Result<R, ModelError> {
  let guards = names
    .iter()
    .map(|name| blobs.tensor(name))
    .collect::<Result<Vec<_>, _>>()?;
  let slices = guards
    .iter()
    .zip(names)
    .map(|(guard, name)| {
      guard.as_f32().ok_or_else(|| ProcessError::Layout {
        name: name.clone(),
        reason: "输出需要 f32 张量".to_string(),
      })
    })
    .collect::<Result<Vec<&[f32]>, _>>()?;
  f(&slices)
}

/// 一次检测调用在流水线中携带的数据
pub struct DetectionPackage {
  pub frame: ImageFrame,
  pub conf_threshold: f32,
  pub scale: TransformScale,
  pub blobs: Option<PooledBlob>,
  pub results: Vec<BBox2D>,
}

impl DetectionPackage {
  pub fn new(frame: ImageFrame, conf_threshold: f32) -> Self {
    Self {
      frame,
      conf_threshold,
      scale: TransformScale::default(),
      blobs: None,
      results: Vec::new(),
    }
  }

  pub fn blobs_mut(&mut self) -> Result<&mut BlobBuffer, ModelError> {
    self
      .blobs
      .as_deref_mut()
      .ok_or(ModelError::MissingBuffer)
  }
}

impl PackageBody for DetectionPackage {
  type Output = Vec<BBox2D>;

  fn into_output(self) -> Result<Self::Output, PipelineError> {
    let DetectionPackage { blobs, results, .. } = self;
    drop(blobs);
    Ok(results)
  }
}

/// 检测模型：负责把图像写入输入张量，以及把输出张量解码为检测框
pub trait DetectionModel: Send + Sync + 'static {
  fn name(&self) -> &str;

  fn engine(&self) -> &dyn InferenceEngine;

  fn preprocess(&self, package: &mut DetectionPackage) -> Result<(), ModelError>;

  fn postprocess(&self, package: &mut DetectionPackage) -> Result<(), ModelError>;
}

type PoolSlot = Arc<Mutex<Option<BlobPool>>>;

fn lock_slot<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
  slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stage_preprocess<M: DetectionModel>(
  model: &M,
  pool: &BlobPool,
  package: &mut DetectionPackage,
) -> Result<(), ModelError> {
  package.blobs = Some(pool.acquire()?);
  model.preprocess(package)?;
  model.engine().preprocess(package.blobs_mut()?)?;
  Ok(())
}

fn stage_inference<M: DetectionModel>(
  model: &M,
  package: &mut DetectionPackage,
) -> Result<(), ModelError> {
  model.engine().inference(package.blobs_mut()?)?;
  Ok(())
}

fn stage_postprocess<M: DetectionModel>(
  model: &M,
  package: &mut DetectionPackage,
) -> Result<(), ModelError> {
  model.engine().postprocess(package.blobs_mut()?)?;
  model.postprocess(package)
}

/// 检测模型的同步与异步调用入口
pub struct Detector<M: DetectionModel> {
  model: Arc<M>,
  config: PipelineConfig,
  sync_pool: BlobPool,
  async_pool: PoolSlot,
  pipeline: AsyncPipeline<DetectionPackage>,
}

impl<M: DetectionModel> Detector<M> {
  pub fn new(model: M) -> Result<Self, ModelError> {
    Self::with_config(model, PipelineConfig::default())
  }

  pub fn with_config(model: M, config: PipelineConfig) -> Result<Self, ModelError> {
    config.validate()?;
    let model = Arc::new(model);
    let async_pool: PoolSlot = Arc::new(Mutex::new(None));
    let sync_pool = BlobPool::new(1, || model.engine().alloc_blobs_buffer());

    let workers = config.workers_per_stage;
    let stages = vec![
      {
        let model = Arc::clone(&model);
        let slot = Arc::clone(&async_pool);
        Stage::new(
          "preprocess",
          PackageState::PreProcessing,
          move |package: &mut DetectionPackage| -> Result<(), StageError> {
            let pool = lock_slot(&slot).clone().ok_or(PipelineError::PoolClosed)?;
            Ok(stage_preprocess(model.as_ref(), &pool, package)?)
          },
        )
        .workers(workers)
      },
      {
        let model = Arc::clone(&model);
        Stage::new(
          "inference",
          PackageState::Inferring,
          move |package: &mut DetectionPackage| -> Result<(), StageError> {
            Ok(stage_inference(model.as_ref(), package)?)
          },
        )
        .workers(workers)
      },
      {
        let model = Arc::clone(&model);
        Stage::new(
          "postprocess",
          PackageState::PostProcessing,
          move |package: &mut DetectionPackage| -> Result<(), StageError> {
            Ok(stage_postprocess(model.as_ref(), package)?)
          },
        )
        .workers(workers)
      },
    ];
    let pipeline = AsyncPipeline::new(model.name().to_string(), stages, config.queue_capacity);

    Ok(Self {
      model,
      config,
      sync_pool,
      async_pool,
      pipeline,
    })
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  /// 在调用线程上完成一次检测
  pub fn detect(&self, frame: &ImageFrame, conf_threshold: f32) -> Result<Vec<BBox2D>, ModelError> {
    let mut package = DetectionPackage::new(frame.clone(), conf_threshold);
    stage_preprocess(self.model.as_ref(), &self.sync_pool, &mut package)?;
    stage_inference(self.model.as_ref(), &mut package)?;
    stage_postprocess(self.model.as_ref(), &mut package)?;
    Ok(package.into_output()?)
  }

  /// 启动流水线；缓冲池在首次启动或关闭之后重新分配
  pub fn init_pipeline(&self) -> Result<(), ModelError> {
    if self.pipeline.state() == PipelineState::Running {
      return Err(PipelineError::AlreadyRunning.into());
    }
    {
      let mut slot = lock_slot(&self.async_pool);
      if slot.is_none() {
        let engine = self.model.engine();
        *slot = Some(BlobPool::new(self.config.pool_size, || {
          engine.alloc_blobs_buffer()
        }));
      }
    }
    self.pipeline.init()?;
    info!("{} 流水线已启动", self.model.name());
    Ok(())
  }

  /// 提交一次检测，入队已满时阻塞
  pub fn detect_async(
    &self,
    frame: &ImageFrame,
    conf_threshold: f32,
  ) -> Result<PackageFuture<Vec<BBox2D>>, ModelError> {
    let package = DetectionPackage::new(frame.clone(), conf_threshold);
    Ok(self.pipeline.submit(package)?)
  }

  pub fn stop_pipeline(&self) -> Result<(), ModelError> {
    self.pipeline.stop()?;
    Ok(())
  }

  /// 停止流水线（如仍在运行）并释放缓冲池
  pub fn close_pipeline(&self) -> Result<(), ModelError> {
    if self.pipeline.state() == PipelineState::Running {
      self.pipeline.stop()?;
    }
    if let Some(pool) = lock_slot(&self.async_pool).take() {
      pool.release_all();
    }
    info!("{} 流水线已关闭", self.model.name());
    Ok(())
  }

  pub fn pipeline_state(&self) -> PipelineState {
    self.pipeline.state()
  }

  /// 当前异步缓冲池，用于观察占用情况
  pub fn pool(&self) -> Option<BlobPool> {
    lock_slot(&self.async_pool).clone()
  }
}
