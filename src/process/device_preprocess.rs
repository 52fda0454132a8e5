// 该文件是 Beifeng （北风） 项目的一部分。
// src/process/device_preprocess.rs - 设备端并行前处理
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

use std::sync::{Mutex, PoisonError};

use rayon::prelude::*;
use tracing::{debug, error};

use super::preprocess::{check_destination, letterbox};
use super::{PreProcess, ProcessError};
use crate::blob::{BlobBuffer, DataLocation};
use crate::frame::ImageFrame;

const DEFAULT_MAX_SOURCE: usize = 1920;

/// 数据并行的前处理内核，输出常驻设备端的 CHW f32 张量
///
/// 源图像先拷入预分配的暂存区，暂存区按最大源尺寸分配一次，
/// 超出上限的图像直接拒绝。
pub struct DevicePreProcess {
  mean: [f32; 3],
  std: [f32; 3],
  max_height: usize,
  max_width: usize,
  staging: Mutex<Vec<u8>>,
}

impl DevicePreProcess {
  pub fn new(mean: [f32; 3], std: [f32; 3]) -> Result<Self, ProcessError> {
    Self::with_max_source(mean, std, DEFAULT_MAX_SOURCE, DEFAULT_MAX_SOURCE)
  }

  pub fn with_max_source(
    mean: [f32; 3],
    std: [f32; 3],
    max_height: usize,
    max_width: usize,
  ) -> Result<Self, ProcessError> {
    if std.iter().any(|&s| s == 0.0) {
      return Err(ProcessError::InvalidArgument("std 不能为 0".to_string()));
    }
    if max_height == 0 || max_width == 0 {
      return Err(ProcessError::InvalidArgument("最大源尺寸不能为 0".to_string()));
    }
    debug!("预分配前处理暂存区 {}x{}x3", max_width, max_height);
    Ok(Self {
      mean,
      std,
      max_height,
      max_width,
      staging: Mutex::new(vec![0; max_height * max_width * 3]),
    })
  }
}

impl PreProcess for DevicePreProcess {
  fn preprocess(
    &self,
    frame: &ImageFrame,
    blobs: &mut BlobBuffer,
    blob_name: &str,
    dst_height: usize,
    dst_width: usize,
  ) -> Result<f32, ProcessError> {
    let (src_h, src_w) = (frame.height(), frame.width());
    if src_h > self.max_height || src_w > self.max_width {
      error!(
        "源图像 {}x{} 超出暂存区 {}x{}",
        src_w, src_h, self.max_width, self.max_height
      );
      return Err(ProcessError::SourceTooLarge {
        width: src_w,
        height: src_h,
        max_width: self.max_width,
        max_height: self.max_height,
      });
    }
    blobs.set_buffer_location(blob_name, DataLocation::Host)?;
    check_destination(blobs, blob_name, dst_height, dst_width)?;

    let lb = letterbox(src_h, src_w, dst_height, dst_width);
    let order = frame.rgb_channel_order();
    let pad = [
      -self.mean[0] / self.std[0],
      -self.mean[1] / self.std[1],
      -self.mean[2] / self.std[2],
    ];
    let ratio_x = src_w as f32 / lb.fit_width as f32;
    let ratio_y = src_h as f32 / lb.fit_height as f32;

    let mut staging = self.staging.lock().unwrap_or_else(PoisonError::into_inner);
    let src = &mut staging[..src_h * src_w * 3];
    src.copy_from_slice(frame.as_bytes());
    let src: &[u8] = src;

    {
      let mut tensor = blobs.tensor_mut(blob_name)?;
      let Some(dst) = tensor.as_f32_mut() else {
        return Err(ProcessError::Layout {
          name: blob_name.to_string(),
          reason: "设备前处理输出需要 f32 张量".to_string(),
        });
      };

      dst[..3 * dst_height * dst_width]
        .par_chunks_mut(dst_width)
        .enumerate()
        .for_each(|(row, out)| {
          let c = row / dst_height;
          let y = row % dst_height;
          if y >= lb.fit_height {
            out.fill(pad[c]);
            return;
          }
          let channel = order[c];
          let sy = ((y as f32 + 0.5) * ratio_y - 0.5).clamp(0.0, (src_h - 1) as f32);
          let y0 = sy.floor() as usize;
          let y1 = (y0 + 1).min(src_h - 1);
          let wy = sy - y0 as f32;
          for (x, value) in out.iter_mut().enumerate() {
            if x >= lb.fit_width {
              *value = pad[c];
              continue;
            }
            let sx = ((x as f32 + 0.5) * ratio_x - 0.5).clamp(0.0, (src_w - 1) as f32);
            let x0 = sx.floor() as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let wx = sx - x0 as f32;
            let at = |yy: usize, xx: usize| src[(yy * src_w + xx) * 3 + channel] as f32;
            let top = at(y0, x0) * (1.0 - wx) + at(y0, x1) * wx;
            let bottom = at(y1, x0) * (1.0 - wx) + at(y1, x1) * wx;
            let v = top * (1.0 - wy) + bottom * wy;
            *value = (v - self.mean[c]) / self.std[c];
          }
        });
    }

    blobs.set_buffer_location(blob_name, DataLocation::Device)?;
    Ok(lb.scale)
  }
}
