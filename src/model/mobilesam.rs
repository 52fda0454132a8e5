// 该文件是 Beifeng （北风） 项目的一部分。
// src/model/mobilesam.rs - MobileSAM 分割模型
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

use std::sync::{Arc, Mutex};

use image::{GrayImage, Luma};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use super::{ModelError, lock_slot};
use crate::blob::{BlobBuffer, DataLocation, ShapePolicy};
use crate::engine::{InferenceEngine, TensorLayout};
use crate::frame::ImageFrame;
use crate::pipeline::{
  AsyncPipeline, BlobPool, PackageBody, PackageFuture, PackageState, PipelineConfig,
  PipelineError, PipelineState, PooledBlob, Stage, StageError,
};
use crate::process::{BBox2D, PreProcess, TransformScale};

const SAM_INPUT_SIZE: usize = 1024;
const SAM_LOW_RES_MASK: usize = 256;

/// 分割提示
#[derive(Debug, Clone, PartialEq)]
pub enum SamPrompt {
  /// 中心点形式的框，源图像坐标
  Boxes(Vec<BBox2D>),
  /// 源图像坐标的点，标签 1 为前景、0 为背景
  Points {
    points: Vec<(f32, f32)>,
    labels: Vec<i32>,
  },
}

impl SamPrompt {
  fn validate(&self) -> Result<(), ModelError> {
    match self {
      SamPrompt::Boxes(boxes) if boxes.is_empty() => {
        Err(ModelError::InvalidArgument("框提示不能为空".to_string()))
      }
      SamPrompt::Points { points, .. } if points.is_empty() => {
        Err(ModelError::InvalidArgument("点提示不能为空".to_string()))
      }
      SamPrompt::Points { points, labels } if points.len() != labels.len() => {
        Err(ModelError::InvalidArgument(format!(
          "点数量 {} 与标签数量 {} 不一致",
          points.len(),
          labels.len()
        )))
      }
      _ => Ok(()),
    }
  }

  fn kind(&self) -> &'static str {
    match self {
      SamPrompt::Boxes(_) => "box",
      SamPrompt::Points { .. } => "point",
    }
  }
}

/// 一次分割调用在流水线中携带的数据
///
/// 解码器缓冲区借用编码器的输出，因此先于编码器缓冲区归还。
pub struct SamPackage {
  pub frame: ImageFrame,
  pub prompt: SamPrompt,
  pub scale: TransformScale,
  pub decoder_blobs: Option<PooledBlob>,
  pub encoder_blobs: Option<PooledBlob>,
  pub mask: Option<GrayImage>,
}

impl SamPackage {
  pub fn new(frame: ImageFrame, prompt: SamPrompt) -> Self {
    Self {
      frame,
      prompt,
      scale: TransformScale::default(),
      decoder_blobs: None,
      encoder_blobs: None,
      mask: None,
    }
  }

  fn encoder_mut(&mut self) -> Result<&mut BlobBuffer, ModelError> {
    self
      .encoder_blobs
      .as_deref_mut()
      .ok_or(ModelError::MissingBuffer)
  }

  fn decoder_mut(&mut self) -> Result<&mut BlobBuffer, ModelError> {
    self
      .decoder_blobs
      .as_deref_mut()
      .ok_or(ModelError::MissingBuffer)
  }
}

impl PackageBody for SamPackage {
  type Output = GrayImage;

  fn into_output(self) -> Result<Self::Output, PipelineError> {
    let SamPackage {
      decoder_blobs,
      encoder_blobs,
      mask,
      ..
    } = self;
    drop(decoder_blobs);
    drop(encoder_blobs);
    mask.ok_or(PipelineError::MissingOutput)
  }
}

/// 编码器与两种解码器各自的缓冲池
#[derive(Clone)]
struct SamPools {
  encoder: BlobPool,
  box_decoder: Option<BlobPool>,
  point_decoder: Option<BlobPool>,
}

type PoolSlot = Arc<Mutex<Option<SamPools>>>;

struct SamInner {
  encoder: Box<dyn InferenceEngine>,
  box_decoder: Option<Box<dyn InferenceEngine>>,
  point_decoder: Option<Box<dyn InferenceEngine>>,
  pre: Box<dyn PreProcess>,
  encoder_names: Vec<String>,
  box_names: Vec<String>,
  point_names: Vec<String>,
}

impl SamInner {
  fn pools(&self, size: usize) -> SamPools {
    SamPools {
      encoder: BlobPool::new(size, || self.encoder.alloc_blobs_buffer()),
      box_decoder: self
        .box_decoder
        .as_ref()
        .map(|d| BlobPool::new(size, || d.alloc_blobs_buffer())),
      point_decoder: self
        .point_decoder
        .as_ref()
        .map(|d| BlobPool::new(size, || d.alloc_blobs_buffer())),
    }
  }

  /// 按提示类型选择解码器及其张量名称
  fn decoder(&self, prompt: &SamPrompt) -> Result<(&dyn InferenceEngine, &[String]), ModelError> {
    let (engine, names) = match prompt {
      SamPrompt::Boxes(_) => (&self.box_decoder, &self.box_names),
      SamPrompt::Points { .. } => (&self.point_decoder, &self.point_names),
    };
    match engine {
      Some(engine) => Ok((engine.as_ref(), names.as_slice())),
      None => {
        error!("MobileSAM 没有配置 {} 解码器", prompt.kind());
        Err(ModelError::InvalidArgument(format!(
          "没有配置 {} 解码器",
          prompt.kind()
        )))
      }
    }
  }

  fn image_preprocess(&self, pools: &SamPools, package: &mut SamPackage) -> Result<(), ModelError> {
    package.prompt.validate()?;
    self.decoder(&package.prompt)?;
    package.encoder_blobs = Some(pools.encoder.acquire()?);

    let frame = package.frame.clone();
    let blobs = package.encoder_mut()?;
    // 编码器输出留在设备端，交给解码器直接使用
    blobs.set_buffer_location(&self.encoder_names[1], DataLocation::Device)?;
    let scale = self.pre.preprocess(
      &frame,
      blobs,
      &self.encoder_names[0],
      SAM_INPUT_SIZE,
      SAM_INPUT_SIZE,
    )?;
    self.encoder.preprocess(blobs)?;
    package.scale.set(scale)?;
    Ok(())
  }

  fn image_encoder(&self, package: &mut SamPackage) -> Result<(), ModelError> {
    self.encoder.inference(package.encoder_mut()?)?;
    Ok(())
  }

  fn prompt_preprocess(&self, pools: &SamPools, package: &mut SamPackage) -> Result<(), ModelError> {
    self.encoder.postprocess(package.encoder_mut()?)?;

    let (decoder, names) = self.decoder(&package.prompt)?;
    let pool = match package.prompt {
      SamPrompt::Boxes(_) => pools.box_decoder.as_ref(),
      SamPrompt::Points { .. } => pools.point_decoder.as_ref(),
    }
    .ok_or(PipelineError::PoolClosed)?;
    package.decoder_blobs = Some(pool.acquire()?);

    let kind = package.prompt.kind();
    let features = &self.encoder_names[1];
    let encoder_layout = self.encoder.native_layout();
    let decoder_layout = decoder.native_layout();
    let view = {
      let encoder_blobs = package.encoder_mut()?;
      if encoder_layout != decoder_layout {
        warn!(
          "MobileSAM {} 解码器布局为 {:?}, 转换图像特征",
          kind,
          decoder_layout
        );
        transpose_features(encoder_blobs, features, encoder_layout, decoder_layout)?;
      }
      encoder_blobs.view(features)?
    };

    let scale = package.scale.get()?;
    let prompt = package.prompt.clone();
    let blobs = package.decoder_mut()?;
    blobs.borrow_from(&names[0], &view)?;

    let mask_names = match &prompt {
      SamPrompt::Boxes(boxes) => {
        let data: Vec<f32> = boxes
          .iter()
          .flat_map(|b| b.corners().map(|v| v * scale))
          .collect();
        write_prompt(blobs, &names[1], &[1, boxes.len(), 4], &data)?;
        &names[2..4]
      }
      SamPrompt::Points { points, labels } => {
        let coords: Vec<f32> = points
          .iter()
          .flat_map(|&(x, y)| [x * scale, y * scale])
          .collect();
        let labels: Vec<f32> = labels.iter().map(|&l| l as f32).collect();
        write_prompt(blobs, &names[1], &[1, points.len(), 2], &coords)?;
        write_prompt(blobs, &names[2], &[1, labels.len()], &labels)?;
        &names[3..5]
      }
    };
    fill_f32(blobs, &mask_names[0], |data| data.fill(0.0))?;
    fill_f32(blobs, &mask_names[1], |data| {
      if let Some(first) = data.first_mut() {
        *first = 1.0;
      }
    })?;

    decoder.preprocess(blobs)?;
    debug!("MobileSAM {} 提示已写入", kind);
    Ok(())
  }

  fn mask_decoder(&self, package: &mut SamPackage) -> Result<(), ModelError> {
    let (decoder, _) = self.decoder(&package.prompt)?;
    decoder.inference(package.decoder_mut()?)?;
    Ok(())
  }

  fn mask_postprocess(&self, package: &mut SamPackage) -> Result<(), ModelError> {
    let (decoder, names) = self.decoder(&package.prompt)?;
    let masks = &names[names.len() - 2];
    let scale = package.scale.get()?;
    let (src_h, src_w) = (package.frame.height(), package.frame.width());

    let blobs = package.decoder_mut()?;
    decoder.postprocess(blobs)?;
    let mask = {
      let tensor = blobs.tensor(masks)?;
      let Some(data) = tensor.as_f32() else {
        return Err(ModelError::InvalidArgument(format!("{} 需要 f32 张量", masks)));
      };
      let plane = SAM_LOW_RES_MASK * SAM_LOW_RES_MASK;
      if data.len() < plane {
        error!("掩码张量 {} 长度 {} 小于 {}", masks, data.len(), plane);
        return Err(ModelError::InvalidArgument(format!(
          "掩码张量 {} 长度不足",
          masks
        )));
      }
      mask_to_image(&data[..plane], scale, src_h, src_w)
    };
    package.mask = Some(mask);
    Ok(())
  }
}

/// 按提示数量调整张量形状并写入数据
///
/// 静态形状后端只接受与已有形状一致的提示数量。
fn write_prompt(
  blobs: &mut BlobBuffer,
  name: &str,
  dims: &[usize],
  values: &[f32],
) -> Result<(), ModelError> {
  match blobs.shape_policy() {
    ShapePolicy::Dynamic => blobs.set_shape(name, dims)?,
    ShapePolicy::Static => {
      let current = blobs.shape(name)?;
      if current != dims {
        error!(
          "静态张量 {} 的形状 {:?} 不能容纳提示 {:?}",
          name, current, dims
        );
        return Err(ModelError::InvalidArgument(format!(
          "静态张量 {} 的形状 {:?} 与提示 {:?} 不符",
          name, current, dims
        )));
      }
    }
  }
  let capacity = blobs.capacity(name)?;
  if values.len() > capacity {
    return Err(ModelError::InvalidArgument(format!(
      "提示数据 {} 超出张量 {} 的容量 {}",
      values.len(),
      name,
      capacity
    )));
  }
  fill_f32(blobs, name, |data| data[..values.len()].copy_from_slice(values))
}

fn fill_f32(blobs: &BlobBuffer, name: &str, f: impl FnOnce(&mut [f32])) -> Result<(), ModelError> {
  let mut tensor = blobs.tensor_mut(name)?;
  let Some(data) = tensor.as_f32_mut() else {
    return Err(ModelError::InvalidArgument(format!("{} 需要 f32 张量", name)));
  };
  f(data);
  Ok(())
}

/// 在编码器缓冲区中原地转换特征图布局
fn transpose_features(
  blobs: &mut BlobBuffer,
  name: &str,
  from: TensorLayout,
  to: TensorLayout,
) -> Result<(), ModelError> {
  let shape = blobs.shape(name)?.to_vec();
  let [n, d1, d2, d3] = shape[..] else {
    return Err(ModelError::InvalidArgument(format!(
      "特征张量 {} 应为 4 维, 实际为 {:?}",
      name, shape
    )));
  };
  let mut tensor = blobs.tensor_mut(name)?;
  let Some(data) = tensor.as_f32_mut() else {
    return Err(ModelError::InvalidArgument(format!("{} 需要 f32 张量", name)));
  };
  let data = &mut data[..n * d1 * d2 * d3];
  match (from, to) {
    (TensorLayout::Nchw, TensorLayout::Nhwc) => nchw_to_nhwc(data, n, d1, d2, d3),
    (TensorLayout::Nhwc, TensorLayout::Nchw) => nhwc_to_nchw(data, n, d1, d2, d3),
    _ => {}
  }
  Ok(())
}

pub(crate) fn nchw_to_nhwc(data: &mut [f32], n: usize, c: usize, h: usize, w: usize) {
  let src = data.to_vec();
  for ni in 0..n {
    let base = ni * c * h * w;
    for ci in 0..c {
      for hi in 0..h {
        for wi in 0..w {
          data[base + (hi * w + wi) * c + ci] = src[base + ci * h * w + hi * w + wi];
        }
      }
    }
  }
}

pub(crate) fn nhwc_to_nchw(data: &mut [f32], n: usize, h: usize, w: usize, c: usize) {
  let src = data.to_vec();
  for ni in 0..n {
    let base = ni * c * h * w;
    for ci in 0..c {
      for hi in 0..h {
        for wi in 0..w {
          data[base + ci * h * w + hi * w + wi] = src[base + (hi * w + wi) * c + ci];
        }
      }
    }
  }
}

/// 单通道 f32 双线性缩放，像素中心对齐
pub(crate) fn resize_bilinear(
  src: &[f32],
  src_h: usize,
  src_w: usize,
  dst_h: usize,
  dst_w: usize,
) -> Vec<f32> {
  let mut dst = vec![0.0; dst_h * dst_w];
  if src_h == 0 || src_w == 0 || dst_w == 0 {
    return dst;
  }
  let ratio_y = src_h as f32 / dst_h as f32;
  let ratio_x = src_w as f32 / dst_w as f32;
  dst.par_chunks_mut(dst_w).enumerate().for_each(|(y, row)| {
    let sy = ((y as f32 + 0.5) * ratio_y - 0.5).clamp(0.0, (src_h - 1) as f32);
    let y0 = sy.floor() as usize;
    let y1 = (y0 + 1).min(src_h - 1);
    let wy = sy - y0 as f32;
    for (x, value) in row.iter_mut().enumerate() {
      let sx = ((x as f32 + 0.5) * ratio_x - 0.5).clamp(0.0, (src_w - 1) as f32);
      let x0 = sx.floor() as usize;
      let x1 = (x0 + 1).min(src_w - 1);
      let wx = sx - x0 as f32;
      let top = src[y0 * src_w + x0] * (1.0 - wx) + src[y0 * src_w + x1] * wx;
      let bottom = src[y1 * src_w + x0] * (1.0 - wx) + src[y1 * src_w + x1] * wx;
      *value = top * (1.0 - wy) + bottom * wy;
    }
  });
  dst
}

/// 低分辨率掩码 -> 输入分辨率 -> 裁掉填充 -> 源分辨率 -> 二值化
///
/// 前景像素为 255、背景为 0，可以直接作为灰度图保存；需要 0/1 掩码时除以 255。
pub(crate) fn mask_to_image(low_res: &[f32], scale: f32, src_h: usize, src_w: usize) -> GrayImage {
  let full = resize_bilinear(
    low_res,
    SAM_LOW_RES_MASK,
    SAM_LOW_RES_MASK,
    SAM_INPUT_SIZE,
    SAM_INPUT_SIZE,
  );
  let crop_h = ((src_h as f32 * scale) as usize).clamp(1, SAM_INPUT_SIZE);
  let crop_w = ((src_w as f32 * scale) as usize).clamp(1, SAM_INPUT_SIZE);
  let cropped: Vec<f32> = full
    .chunks_exact(SAM_INPUT_SIZE)
    .take(crop_h)
    .flat_map(|row| row[..crop_w].iter().copied())
    .collect();
  let resized = resize_bilinear(&cropped, crop_h, crop_w, src_h, src_w);
  GrayImage::from_fn(src_w as u32, src_h as u32, |x, y| {
    let v = resized[y as usize * src_w + x as usize];
    Luma([if v > 0.0 { 255 } else { 0 }])
  })
}

/// MobileSAM：图像编码器加上点或框提示的掩码解码器
pub struct MobileSam {
  inner: Arc<SamInner>,
  config: PipelineConfig,
  sync_pools: SamPools,
  async_pools: PoolSlot,
  pipeline: AsyncPipeline<SamPackage>,
}

fn stage<F>(name: &str, state: PackageState, workers: usize, run: F) -> Stage<SamPackage>
where
  F: Fn(&mut SamPackage) -> Result<(), ModelError> + Send + Sync + 'static,
{
  Stage::new(name, state, move |package: &mut SamPackage| -> Result<(), StageError> {
    Ok(run(package)?)
  })
  .workers(workers)
}

fn current_pools(slot: &PoolSlot) -> Result<SamPools, ModelError> {
  Ok(lock_slot(slot).clone().ok_or(PipelineError::PoolClosed)?)
}

impl MobileSam {
  fn new(inner: SamInner, config: PipelineConfig) -> Result<Self, ModelError> {
    config.validate()?;
    let inner = Arc::new(inner);
    let sync_pools = inner.pools(1);
    let async_pools: PoolSlot = Arc::new(Mutex::new(None));
    let workers = config.workers_per_stage;

    let stages = vec![
      {
        let (inner, slot) = (Arc::clone(&inner), Arc::clone(&async_pools));
        stage("image_preprocess", PackageState::PreProcessing, workers, move |p| {
          inner.image_preprocess(&current_pools(&slot)?, p)
        })
      },
      {
        let inner = Arc::clone(&inner);
        stage("image_encoder", PackageState::Inferring, workers, move |p| {
          inner.image_encoder(p)
        })
      },
      {
        let (inner, slot) = (Arc::clone(&inner), Arc::clone(&async_pools));
        stage("prompt_preprocess", PackageState::PreProcessing, workers, move |p| {
          inner.prompt_preprocess(&current_pools(&slot)?, p)
        })
      },
      {
        let inner = Arc::clone(&inner);
        stage("mask_decoder", PackageState::Inferring, workers, move |p| {
          inner.mask_decoder(p)
        })
      },
      {
        let inner = Arc::clone(&inner);
        stage("mask_postprocess", PackageState::PostProcessing, workers, move |p| {
          inner.mask_postprocess(p)
        })
      },
    ];
    let pipeline = AsyncPipeline::new("mobilesam", stages, config.queue_capacity);

    Ok(Self {
      inner,
      config,
      sync_pools,
      async_pools,
      pipeline,
    })
  }

  pub fn has_box_decoder(&self) -> bool {
    self.inner.box_decoder.is_some()
  }

  pub fn has_point_decoder(&self) -> bool {
    self.inner.point_decoder.is_some()
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  /// 在调用线程上完成一次分割
  pub fn generate_mask(&self, frame: &ImageFrame, prompt: SamPrompt) -> Result<GrayImage, ModelError> {
    let mut package = SamPackage::new(frame.clone(), prompt);
    let pools = &self.sync_pools;
    self.inner.image_preprocess(pools, &mut package)?;
    self.inner.image_encoder(&mut package)?;
    self.inner.prompt_preprocess(pools, &mut package)?;
    self.inner.mask_decoder(&mut package)?;
    self.inner.mask_postprocess(&mut package)?;
    Ok(package.into_output()?)
  }

  pub fn init_pipeline(&self) -> Result<(), ModelError> {
    if self.pipeline.state() == PipelineState::Running {
      return Err(PipelineError::AlreadyRunning.into());
    }
    {
      let mut slot = lock_slot(&self.async_pools);
      if slot.is_none() {
        *slot = Some(self.inner.pools(self.config.pool_size));
      }
    }
    self.pipeline.init()?;
    info!("MobileSAM 流水线已启动");
    Ok(())
  }

  pub fn generate_mask_async(
    &self,
    frame: &ImageFrame,
    prompt: SamPrompt,
  ) -> Result<PackageFuture<GrayImage>, ModelError> {
    Ok(self.pipeline.submit(SamPackage::new(frame.clone(), prompt))?)
  }

  pub fn stop_pipeline(&self) -> Result<(), ModelError> {
    self.pipeline.stop()?;
    Ok(())
  }

  pub fn close_pipeline(&self) -> Result<(), ModelError> {
    if self.pipeline.state() == PipelineState::Running {
      self.pipeline.stop()?;
    }
    if let Some(pools) = lock_slot(&self.async_pools).take() {
      pools.encoder.release_all();
      for pool in [pools.box_decoder, pools.point_decoder].into_iter().flatten() {
        pool.release_all();
      }
    }
    info!("MobileSAM 流水线已关闭");
    Ok(())
  }

  pub fn pipeline_state(&self) -> PipelineState {
    self.pipeline.state()
  }
}

fn owned_names(names: &[&str]) -> Vec<String> {
  names.iter().map(|s| s.to_string()).collect()
}

pub struct MobileSamBuilder {
  encoder: Box<dyn InferenceEngine>,
  pre: Box<dyn PreProcess>,
  box_decoder: Option<Box<dyn InferenceEngine>>,
  point_decoder: Option<Box<dyn InferenceEngine>>,
  encoder_names: Vec<String>,
  box_names: Vec<String>,
  point_names: Vec<String>,
  config: PipelineConfig,
}

impl MobileSamBuilder {
  pub fn new(encoder: Box<dyn InferenceEngine>, pre: Box<dyn PreProcess>) -> Self {
    Self {
      encoder,
      pre,
      box_decoder: None,
      point_decoder: None,
      encoder_names: owned_names(&["images", "features"]),
      box_names: owned_names(&[
        "image_embeddings",
        "boxes",
        "mask_input",
        "has_mask_input",
        "masks",
        "scores",
      ]),
      point_names: owned_names(&[
        "image_embeddings",
        "point_coords",
        "point_labels",
        "mask_input",
        "has_mask_input",
        "masks",
        "scores",
      ]),
      config: PipelineConfig::default(),
    }
  }

  pub fn box_decoder(mut self, decoder: Box<dyn InferenceEngine>) -> Self {
    self.box_decoder = Some(decoder);
    self
  }

  pub fn point_decoder(mut self, decoder: Box<dyn InferenceEngine>) -> Self {
    self.point_decoder = Some(decoder);
    self
  }

  /// 图像输入与特征输出
  pub fn encoder_names<S: AsRef<str>>(mut self, names: &[S]) -> Self {
    self.encoder_names = names.iter().map(|n| n.as_ref().to_string()).collect();
    self
  }

  /// 特征、框、mask_input、has_mask_input、masks、scores
  pub fn box_decoder_names<S: AsRef<str>>(mut self, names: &[S]) -> Self {
    self.box_names = names.iter().map(|n| n.as_ref().to_string()).collect();
    self
  }

  /// 特征、点坐标、点标签、mask_input、has_mask_input、masks、scores
  pub fn point_decoder_names<S: AsRef<str>>(mut self, names: &[S]) -> Self {
    self.point_names = names.iter().map(|n| n.as_ref().to_string()).collect();
    self
  }

  pub fn config(mut self, config: PipelineConfig) -> Self {
    self.config = config;
    self
  }

  pub fn build(self) -> Result<MobileSam, ModelError> {
    if self.box_decoder.is_none() && self.point_decoder.is_none() {
      return Err(ModelError::InvalidArgument(
        "至少需要一个点解码器或框解码器".to_string(),
      ));
    }
    if self.encoder_names.len() != 2 || self.box_names.len() != 6 || self.point_names.len() != 7 {
      return Err(ModelError::InvalidArgument(
        "MobileSAM 张量名称数量不正确".to_string(),
      ));
    }
    check_engine_names("image_encoder", self.encoder.as_ref(), &self.encoder_names)?;
    if let Some(decoder) = &self.box_decoder {
      check_engine_names("box_decoder", decoder.as_ref(), &self.box_names)?;
    }
    if let Some(decoder) = &self.point_decoder {
      check_engine_names("point_decoder", decoder.as_ref(), &self.point_names)?;
    }
    info!(
      "MobileSAM 模型就绪: 编码器 {}, 框解码器 {}, 点解码器 {}",
      self.encoder.name(),
      self.box_decoder.is_some(),
      self.point_decoder.is_some()
    );

    MobileSam::new(
      SamInner {
        encoder: self.encoder,
        box_decoder: self.box_decoder,
        point_decoder: self.point_decoder,
        pre: self.pre,
        encoder_names: self.encoder_names,
        box_names: self.box_names,
        point_names: self.point_names,
      },
      self.config,
    )
  }
}

/// 名称按引擎的输入、输出顺序排列
fn check_engine_names(
  model: &str,
  engine: &dyn InferenceEngine,
  names: &[String],
) -> Result<(), ModelError> {
  let inputs = engine.input_specs().len().min(names.len());
  super::check_blob_names(model, engine, &names[..inputs], &names[inputs..])
}
