// 该文件是 Beifeng （北风） 项目的一部分。
// src/model/yolov8.rs - YOLOv8 检测模型
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
use crate::process::{PostProcess, PreProcess};

const YOLOV8_INPUT_SIZE: usize = 640;
const YOLOV8_STRIDES: [usize; 3] = [8, 16, 32];

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// YOLOv8 检测模型
///
/// 引擎、前处理与后处理都由调用方提供，模型只负责按名称把它们串起来。
pub struct Yolov8 {
  engine: Box<dyn InferenceEngine>,
  pre: Box<dyn PreProcess>,
  post: Box<dyn PostProcess>,
  input_height: usize,
  input_width: usize,
  num_classes: usize,
  input_names: Vec<String>,
  output_names: Vec<String>,
  strides: Vec<usize>,
}

impl Yolov8 {
  pub fn input_size(&self) -> (usize, usize) {
    (self.input_height, self.input_width)
  }

  pub fn num_classes(&self) -> usize {
    self.num_classes
  }

  pub fn strides(&self) -> &[usize] {
    &self.strides
  }

  pub fn input_names(&self) -> &[String] {
    &self.input_names
  }

  pub fn output_names(&self) -> &[String] {
    &self.output_names
  }
}

impl DetectionModel for Yolov8 {
  fn name(&self) -> &str {
    "yolov8"
  }

  fn engine(&self) -> &dyn InferenceEngine {
    self.engine.as_ref()
  }

  fn preprocess(&self, package: &mut DetectionPackage) -> Result<(), ModelError> {
    let (h, w) = (self.input_height, self.input_width);
    let frame = package.frame.clone();
    let blobs = package.blobs_mut()?;
    let scale = self.pre.preprocess(&frame, blobs, &self.input_names[0], h, w)?;
    package.scale.set(scale)?;
    Ok(())
  }

  fn postprocess(&self, package: &mut DetectionPackage) -> Result<(), ModelError> {
    let scale = package.scale.get()?;
    let threshold = package.conf_threshold;
    let blobs = package.blobs_mut()?;
    let results = with_f32_outputs(blobs, &self.output_names, |outputs| {
      Ok(self.post.postprocess(outputs, threshold, scale)?)
    })?;
    debug!("yolov8 检测到 {} 个目标", results.len());
    package.results = results;
    Ok(())
  }
}

pub struct Yolov8Builder {
  engine: Box<dyn InferenceEngine>,
  pre: Box<dyn PreProcess>,
  post: Box<dyn PostProcess>,
  input_height: usize,
  input_width: usize,
  num_classes: usize,
  input_names: Vec<String>,
  output_names: Vec<String>,
  strides: Vec<usize>,
}

impl Yolov8Builder {
  pub fn new(
    engine: Box<dyn InferenceEngine>,
    pre: Box<dyn PreProcess>,
    post: Box<dyn PostProcess>,
  ) -> Self {
    Self {
      engine,
      pre,
      post,
      input_height: YOLOV8_INPUT_SIZE,
      input_width: YOLOV8_INPUT_SIZE,
      num_classes: COCO_CLASSES.len(),
      input_names: vec!["images".to_string()],
      output_names: vec!["output0".to_string()],
      strides: YOLOV8_STRIDES.to_vec(),
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

  pub fn output_names<S: AsRef<str>>(mut self, names: &[S]) -> Self {
    self.output_names = names.iter().map(|n| n.as_ref().to_string()).collect();
    self
  }

  pub fn strides(mut self, strides: &[usize]) -> Self {
    self.strides = strides.to_vec();
    self
  }

  pub fn build(self) -> Result<Yolov8, ModelError> {
    if self.input_height == 0 || self.input_width == 0 {
      return Err(ModelError::InvalidArgument("输入尺寸不能为 0".to_string()));
    }
    if self.input_names.is_empty() || self.output_names.is_empty() {
      return Err(ModelError::InvalidArgument(
        "至少需要一个输入与一个输出名称".to_string(),
      ));
    }
    for &s in &self.strides {
      if s == 0 || self.input_height % s != 0 || self.input_width % s != 0 {
        error!(
          "输入尺寸 {}x{} 不能被步长 {} 整除",
          self.input_width, self.input_height, s
        );
        return Err(ModelError::InvalidArgument(format!(
          "输入尺寸 {}x{} 不能被步长 {} 整除",
          self.input_width, self.input_height, s
        )));
      }
    }
    check_blob_names(
      "yolov8",
      self.engine.as_ref(),
      &self.input_names,
      &self.output_names,
    )?;
    // 后处理必须按同样的类别数与候选框数解码
    let anchors: usize = self
      .strides
      .iter()
      .map(|s| (self.input_height / s) * (self.input_width / s))
      .sum();
    if self.post.num_classes() != self.num_classes || self.post.anchor_count() != anchors {
      error!(
        "yolov8 后处理配置不一致: {} 类 {} 个候选框, 模型为 {} 类 {} 个候选框",
        self.post.num_classes(),
        self.post.anchor_count(),
        self.num_classes,
        anchors
      );
      return Err(ModelError::InvalidArgument(format!(
        "后处理按 {} 类 {} 个候选框解码, 模型为 {} 类 {} 个候选框",
        self.post.num_classes(),
        self.post.anchor_count(),
        self.num_classes,
        anchors
      )));
    }
    info!(
      "yolov8 模型就绪: 引擎 {}, 输入 {}x{}, {} 类",
      self.engine.name(),
      self.input_width,
      self.input_height,
      self.num_classes
    );

    Ok(Yolov8 {
      engine: self.engine,
      pre: self.pre,
      post: self.post,
      input_height: self.input_height,
      input_width: self.input_width,
      num_classes: self.num_classes,
      input_names: self.input_names,
      output_names: self.output_names,
      strides: self.strides,
    })
  }
}
