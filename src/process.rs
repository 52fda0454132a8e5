// 该文件是 Beifeng （北风） 项目的一部分。
// src/process.rs - 前处理与后处理
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

mod device_preprocess;
mod postprocess;
mod preprocess;

use serde::Serialize;
use thiserror::Error;

use crate::blob::BlobError;

pub use self::device_preprocess::DevicePreProcess;
pub use self::postprocess::{PostProcess, Yolov8Divide, Yolov8Origin, Yolov8Transpose, nms};
pub use self::preprocess::{HostPreProcess, Letterbox, PreProcess, letterbox};

/// 非极大值抑制使用的 IoU 阈值
pub const NMS_IOU_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("缓冲区错误: {0}")]
  Blob(#[from] BlobError),
  #[error("张量 {name} 的布局不符合要求: {reason}")]
  Layout { name: String, reason: String },
  #[error("输出数量不符: 期望 {expected}, 实际 {actual}")]
  OutputCount { expected: usize, actual: usize },
  #[error("输出长度不足: 期望至少 {expected}, 实际 {actual}")]
  OutputTooShort { expected: usize, actual: usize },
  #[error("源图像尺寸 {width}x{height} 超出上限 {max_width}x{max_height}")]
  SourceTooLarge {
    width: usize,
    height: usize,
    max_width: usize,
    max_height: usize,
  },
  #[error("参数无效: {0}")]
  InvalidArgument(String),
  #[error("变换比例已设置")]
  ScaleAlreadySet,
  #[error("变换比例尚未设置")]
  ScaleUnset,
}

/// 检测框，中心点形式
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BBox2D {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
  pub conf: f32,
  pub cls: u32,
}

impl BBox2D {
  /// 由左上角与右下角坐标构造
  pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32, conf: f32, cls: u32) -> Self {
    Self {
      x: (x0 + x1) / 2.0,
      y: (y0 + y1) / 2.0,
      w: x1 - x0,
      h: y1 - y0,
      conf,
      cls,
    }
  }

  /// (x0, y0, x1, y1)
  pub fn corners(&self) -> [f32; 4] {
    [
      self.x - self.w / 2.0,
      self.y - self.h / 2.0,
      self.x + self.w / 2.0,
      self.y + self.h / 2.0,
    ]
  }

  pub fn area(&self) -> f32 {
    self.w.max(0.0) * self.h.max(0.0)
  }

  pub fn intersection(&self, other: &BBox2D) -> f32 {
    let [ax0, ay0, ax1, ay1] = self.corners();
    let [bx0, by0, bx1, by1] = other.corners();
    let w = (ax1.min(bx1) - ax0.max(bx0)).max(0.0);
    let h = (ay1.min(by1) - ay0.max(by0)).max(0.0);
    w * h
  }

  /// 交集除以并集面积
  pub fn iou(&self, other: &BBox2D) -> f32 {
    let inter = self.intersection(other);
    let union = self.area() + other.area() - inter;
    if union <= 0.0 {
      return 0.0;
    }
    inter / union
  }

  /// 坐标除以前处理比例，映射回源图像
  pub fn unscale(self, scale: f32) -> Self {
    Self {
      x: self.x / scale,
      y: self.y / scale,
      w: self.w / scale,
      h: self.h / scale,
      ..self
    }
  }
}

/// 前处理写入、后处理读取的缩放比例，只能写入一次
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransformScale(Option<f32>);

impl TransformScale {
  pub fn set(&mut self, scale: f32) -> Result<(), ProcessError> {
    if self.0.is_some() {
      return Err(ProcessError::ScaleAlreadySet);
    }
    self.0 = Some(scale);
    Ok(())
  }

  pub fn get(&self) -> Result<f32, ProcessError> {
    self.0.ok_or(ProcessError::ScaleUnset)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn iou_uses_union_area() {
    let a = BBox2D::from_corners(0.0, 0.0, 10.0, 10.0, 0.9, 0);
    let b = BBox2D::from_corners(5.0, 0.0, 15.0, 10.0, 0.8, 0);
    // 交集 50, 并集 150
    assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    assert_eq!(a.iou(&a), 1.0);
  }

  #[test]
  fn unscale_round_trips_through_scale() {
    let src = BBox2D::from_corners(100.0, 40.0, 300.0, 240.0, 0.5, 1);
    let scale = 0.5;
    let model_space = BBox2D {
      x: src.x * scale,
      y: src.y * scale,
      w: src.w * scale,
      h: src.h * scale,
      ..src
    };
    let back = model_space.unscale(scale);
    for (a, b) in back.corners().iter().zip(src.corners()) {
      assert!((a - b).abs() < 1e-3);
    }
  }

  #[test]
  fn scale_is_write_once() {
    let mut scale = TransformScale::default();
    assert!(matches!(scale.get(), Err(ProcessError::ScaleUnset)));
    scale.set(0.5).unwrap();
    assert!(matches!(scale.set(1.0), Err(ProcessError::ScaleAlreadySet)));
    assert_eq!(scale.get().unwrap(), 0.5);
  }
}
