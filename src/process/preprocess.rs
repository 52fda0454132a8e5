// 该文件是 Beifeng （北风） 项目的一部分。
// src/process/preprocess.rs - 主机端 letterbox 前处理
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

use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::{debug, error, warn};

use super::ProcessError;
use crate::blob::{BlobBuffer, DataLocation};
use crate::frame::ImageFrame;

/// 把图像写入模型输入张量，返回缩放比例
pub trait PreProcess: Send + Sync {
  fn preprocess(
    &self,
    frame: &ImageFrame,
    blobs: &mut BlobBuffer,
    blob_name: &str,
    dst_height: usize,
    dst_width: usize,
  ) -> Result<f32, ProcessError>;
}

/// letterbox 的几何参数：图像等比缩放后贴在左上角
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub fit_width: usize,
  pub fit_height: usize,
}

pub fn letterbox(src_height: usize, src_width: usize, dst_height: usize, dst_width: usize) -> Letterbox {
  let s_h = dst_height as f32 / src_height as f32;
  let s_w = dst_width as f32 / src_width as f32;
  let scale = s_h.min(s_w);
  let fit = |src: usize, dst: usize| ((src as f32 * scale).round() as usize).clamp(1, dst);
  Letterbox {
    scale,
    fit_width: fit(src_width, dst_width),
    fit_height: fit(src_height, dst_height),
  }
}

pub(crate) fn check_destination(
  blobs: &BlobBuffer,
  blob_name: &str,
  dst_height: usize,
  dst_width: usize,
) -> Result<(), ProcessError> {
  if dst_height == 0 || dst_width == 0 {
    return Err(ProcessError::InvalidArgument(format!(
      "目标尺寸无效: {}x{}",
      dst_width, dst_height
    )));
  }
  let required = 3 * dst_height * dst_width;
  let capacity = blobs.capacity(blob_name)?;
  if capacity < required {
    error!(
      "张量 {} 容量 {} 不足以容纳 {}x{}x3",
      blob_name, capacity, dst_height, dst_width
    );
    return Err(ProcessError::Layout {
      name: blob_name.to_string(),
      reason: format!("容量 {} 小于 {}", capacity, required),
    });
  }
  Ok(())
}

/// 主机端前处理
///
/// `planar` 为真时输出 CHW，否则输出 HWC；`normalize` 为真时输出
/// `(v - mean) / std` 的 f32，否则输出原始 u8。输出通道顺序总是 RGB，
/// `mean` 与 `std` 按输出通道索引。
#[derive(Debug, Clone, PartialEq)]
pub struct HostPreProcess {
  mean: [f32; 3],
  std: [f32; 3],
  planar: bool,
  normalize: bool,
}

impl Default for HostPreProcess {
  fn default() -> Self {
    Self {
      mean: [0.0; 3],
      std: [255.0; 3],
      planar: true,
      normalize: true,
    }
  }
}

impl HostPreProcess {
  pub fn new(
    mean: [f32; 3],
    std: [f32; 3],
    planar: bool,
    normalize: bool,
  ) -> Result<Self, ProcessError> {
    if std.iter().any(|&s| s == 0.0) {
      return Err(ProcessError::InvalidArgument("std 不能为 0".to_string()));
    }
    Ok(Self {
      mean,
      std,
      planar,
      normalize,
    })
  }

  /// 原始 u8 输出，NPU 模型常用
  pub fn raw(planar: bool) -> Self {
    Self {
      planar,
      normalize: false,
      ..Self::default()
    }
  }

  fn index(&self, c: usize, y: usize, x: usize, h: usize, w: usize) -> usize {
    match self.planar {
      true => c * h * w + y * w + x,
      false => (y * w + x) * 3 + c,
    }
  }
}

impl PreProcess for HostPreProcess {
  fn preprocess(
    &self,
    frame: &ImageFrame,
    blobs: &mut BlobBuffer,
    blob_name: &str,
    dst_height: usize,
    dst_width: usize,
  ) -> Result<f32, ProcessError> {
    blobs.set_buffer_location(blob_name, DataLocation::Host)?;
    check_destination(blobs, blob_name, dst_height, dst_width)?;
    if frame.location() == DataLocation::Device {
      warn!("主机前处理收到设备端图像, 按主机内存读取");
    }

    let lb = letterbox(frame.height(), frame.width(), dst_height, dst_width);
    debug!(
      "letterbox: {}x{} -> {}x{}, 比例 {}",
      frame.width(),
      frame.height(),
      lb.fit_width,
      lb.fit_height,
      lb.scale
    );

    let resized = imageops::resize(
      &frame.to_image_buffer(),
      lb.fit_width as u32,
      lb.fit_height as u32,
      FilterType::Triangle,
    );
    let mut canvas = RgbImage::new(dst_width as u32, dst_height as u32);
    imageops::replace(&mut canvas, &resized, 0, 0);

    let order = frame.rgb_channel_order();
    let mut tensor = blobs.tensor_mut(blob_name)?;
    if self.normalize {
      let Some(dst) = tensor.as_f32_mut() else {
        return Err(ProcessError::Layout {
          name: blob_name.to_string(),
          reason: "归一化输出需要 f32 张量".to_string(),
        });
      };
      for (x, y, pixel) in canvas.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for (c, &src) in order.iter().enumerate() {
          dst[self.index(c, y, x, dst_height, dst_width)] =
            (pixel.0[src] as f32 - self.mean[c]) / self.std[c];
        }
      }
    } else {
      let Some(dst) = tensor.as_u8_mut() else {
        return Err(ProcessError::Layout {
          name: blob_name.to_string(),
          reason: "原始字节输出需要 u8 张量".to_string(),
        });
      };
      for (x, y, pixel) in canvas.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for (c, &src) in order.iter().enumerate() {
          dst[self.index(c, y, x, dst_height, dst_width)] = pixel.0[src];
        }
      }
    }

    Ok(lb.scale)
  }
}
