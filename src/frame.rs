// 该文件是 Beifeng （北风） 项目的一部分。
// src/frame.rs - 输入图像帧定义
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

use std::sync::Arc;

use image::RgbImage;
use thiserror::Error;

use crate::blob::DataLocation;

const FRAME_CHANNELS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("图像尺寸无效: {width}x{height}")]
  InvalidSize { width: usize, height: usize },
}

/// 像素通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
  #[default]
  Bgr,
  Rgb,
}

/// 一帧交错存储（HWC）的 8 位三通道图像
///
/// 数据以 `Arc` 共享，克隆帧不会复制像素。
#[derive(Debug, Clone)]
pub struct ImageFrame {
  data: Arc<[u8]>,
  width: usize,
  height: usize,
  format: PixelFormat,
  location: DataLocation,
}

impl ImageFrame {
  pub fn new(
    data: Vec<u8>,
    width: usize,
    height: usize,
    format: PixelFormat,
  ) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidSize { width, height });
    }
    let expected = FRAME_CHANNELS * width * height;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into(),
      width,
      height,
      format,
      location: DataLocation::Host,
    })
  }

  /// 标记图像数据所在位置（例如已经上传到设备端的帧）
  pub fn with_location(mut self, location: DataLocation) -> Self {
    self.location = location;
    self
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn channels(&self) -> usize {
    FRAME_CHANNELS
  }

  pub fn format(&self) -> PixelFormat {
    self.format
  }

  pub fn location(&self) -> DataLocation {
    self.location
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  /// 按输出顺序 (R, G, B) 给出源像素中对应通道的下标
  pub fn rgb_channel_order(&self) -> [usize; 3] {
    match self.format {
      PixelFormat::Bgr => [2, 1, 0],
      PixelFormat::Rgb => [0, 1, 2],
    }
  }

  /// 复制为 `image` 的缓冲区，通道顺序保持不变
  pub fn to_image_buffer(&self) -> RgbImage {
    let mut image = RgbImage::new(self.width as u32, self.height as u32);
    image.copy_from_slice(&self.data);
    image
  }
}

impl From<RgbImage> for ImageFrame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw().into(),
      width: width as usize,
      height: height as usize,
      format: PixelFormat::Rgb,
      location: DataLocation::Host,
    }
  }
}
