// 该文件是 Beifeng （北风） 项目的一部分。
// src/model/rt_detr.rs - RT-DETR 检测模型
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

use tracing::{debug, error, info};

use super::{DetectionModel, DetectionPackage, ModelError, check_blob_names, with_f32_outputs};
use crate::engine::InferenceEngine;
use crate::process::{BBox2D, PreProcess, ProcessError};

const RT_DETR_INPUT_SIZE: usize = 640;

/// 按分数筛选 RT-DETR 的候选框
///
/// 输出依次为类别 `[1, N]`、角点形式的框 `[1, N, 4]` 与分数 `[1, N]`，
/// 网络本身已去重，因此不做 NMS。
pub fn decode_rt_detr(
  labels: &[f32],
  boxes: &[f32],
  scores: &[f32],
  conf_threshold: f32,
  scale: f32,
) -> Result<Vec<BBox2D>, ProcessError> {
  let candidates = scores.len();
  if labels.len() < candidates || boxes.len() < candidates * 4 {
    error!(
      "RT-DETR 输出长度不一致: labels {}, boxes {}, scores {}",
      labels.len(),
      boxes.len(),
      candidates
    );
    return Err(ProcessError::OutputTooShort {
      expected: candidates * 4,
      actual: boxes.len().min(labels.len() * 4),
    });
  }

  let results = scores
    .iter()
    .enumerate()
    .filter(|&(_, &score)| score >= conf_threshold)
    .map(|(i, &score)| {
      let b = &boxes[i * 4..i * 4 + 4];
      BBox2D::from_corners(b[0], b[1], b[2], b[3], score, labels[i].max(0.0) as u32).unscale(scale)
    })
    .collect();
  Ok(results)
}

pub struct RtDetr {
  engine: Box<dyn InferenceEngine>,
  pre: Box<dyn PreProcess>,
  input_height: usize,
  input_width: usize,
  num_classes: usize,
  input_names: Vec<String>,
  output_names: Vec<String>,
}

impl RtDetr {
  pub fn input_size(&self) -> (usize, usize) {
    (self.input_height, self.input_width)
  }

  pub fn num_classes(&self) -> usize {
    self.num_classes
  }
}

impl DetectionModel for RtDetr {
  fn name(&self) -> &str {
    "rt-detr"
  }

  fn engine(&self) -> &dyn InferenceEngine {
    self.engine.as_ref()
  }

  fn preprocess(&self, package: &mut DetectionPackage) -> Result<(), ModelError> {
    let frame = package.frame.clone();
    let blobs = package.blobs_mut()?;
    let scale = self.pre.preprocess(
      &frame,
      blobs,
      &self.input_names[0],
      self.input_height,
      self.input_width,
    )?;
    package.scale.set(scale)?;
    Ok(())
  }

  fn postprocess(&self, package: &mut DetectionPackage) -> Result<(), ModelError> {
    let scale = package.scale.get()?;
    let threshold = package.conf_threshold;
    let blobs = package.blobs_mut()?;
    let results = with_f32_outputs(blobs, &self.output_names, |outputs| {
      let [labels, boxes, scores] = outputs else {
        return Err(
          ProcessError::OutputCount {
            expected: 3,
            actual: outputs.len(),
          }
          .into(),
        );
      };
      Ok(decode_rt_detr(labels, boxes, scores, threshold, scale)?)
    })?;
    debug!("rt-detr 检测到 {} 个目标", results.len());
    package.results = results;
    Ok(())
  }
}

pub struct RtDetrBuilder {
  engine: Box<dyn InferenceEngine>,
  pre: Box<dyn PreProcess>,
  input_height: usize,
  input_width: usize,
  num_classes: usize,
  input_names: Vec<String>,
  output_names: Vec<String>,
}

impl RtDetrBuilder {
  pub fn new(engine: Box<dyn InferenceEngine>, pre: Box<dyn PreProcess>) -> Self {
    Self {
      engine,
      pre,
      input_height: RT_DETR_INPUT_SIZE,
      input_width: RT_DETR_INPUT_SIZE,
      num_classes: 80,
      input_names: vec!["images".to_string()],
      output_names: ["labels", "boxes", "scores"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
  }

  pub fn input_size(mut self, height: usize, width: usize) -> Self {
    self.input_height = height;
    self.input_width = width;
    self
  }

  pub fn num_classes(mut self, num_classes: usize) -> Self {
    self.num_classes = num_classes;
    self
  }

  pub fn input_names<S: AsRef<str>>(mut self, names: &[S]) -> Self {
    self.input_names = names.iter().map(|n| n.as_ref().to_string()).collect();
    self
  }

  /// 顺序为 labels、boxes、scores
  pub fn output_names<S: AsRef<str>>(mut self, names: &[S]) -> Self {
    self.output_names = names.iter().map(|n| n.as_ref().to_string()).collect();
    self
  }

  pub fn build(self) -> Result<RtDetr, ModelError> {
    if self.input_height == 0 || self.input_width == 0 {
      return Err(ModelError::InvalidArgument("输入尺寸不能为 0".to_string()));
    }
    if self.input_names.len() != 1 || self.output_names.len() != 3 {
      return Err(ModelError::InvalidArgument(
        "RT-DETR 需要 1 个输入与 3 个输出".to_string(),
      ));
    }
    check_blob_names(
      "rt-detr",
      self.engine.as_ref(),
      &self.input_names,
      &self.output_names,
    )?;
    info!(
      "rt-detr 模型就绪: 引擎 {}, 输入 {}x{}",
      self.engine.name(),
      self.input_width,
      self.input_height
    );

    Ok(RtDetr {
      engine: self.engine,
      pre: self.pre,
      input_height: self.input_height,
      input_width: self.input_width,
      num_classes: self.num_classes,
      input_names: self.input_names,
      output_names: self.output_names,
    })
  }
}
