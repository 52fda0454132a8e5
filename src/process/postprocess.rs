// 该文件是 Beifeng （北风） 项目的一部分。
// src/process/postprocess.rs - YOLOv8 检测头后处理
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

use tracing::{debug, error};

use super::{BBox2D, NMS_IOU_THRESHOLD, ProcessError};

const DFL_BINS: usize = 16;
const DFL_CHANNELS: usize = 4 * DFL_BINS;

/// 把网络输出解码为检测框
pub trait PostProcess: Send + Sync {
  /// `outputs` 按模型输出名称的顺序排列
  fn postprocess(
    &self,
    outputs: &[&[f32]],
    conf_threshold: f32,
    scale: f32,
  ) -> Result<Vec<BBox2D>, ProcessError>;

  /// 解码器按多少个类别读取分数
  fn num_classes(&self) -> usize;

  /// 所有检测层的候选框总数
  fn anchor_count(&self) -> usize;
}

/// 校验下采样步长并计算候选框总数
fn anchor_count(input_height: usize, input_width: usize, strides: &[usize]) -> Result<usize, ProcessError> {
  if strides.is_empty() {
    return Err(ProcessError::InvalidArgument("下采样步长不能为空".to_string()));
  }
  let mut total = 0;
  for &s in strides {
    if s == 0 || input_height % s != 0 || input_width % s != 0 {
      error!(
        "输入尺寸 {}x{} 不能被步长 {} 整除",
        input_width, input_height, s
      );
      return Err(ProcessError::InvalidArgument(format!(
        "输入尺寸 {}x{} 不能被步长 {} 整除",
        input_width, input_height, s
      )));
    }
    total += (input_height / s) * (input_width / s);
  }
  Ok(total)
}

fn expect_len(data: &[f32], expected: usize) -> Result<(), ProcessError> {
  if data.len() < expected {
    error!("输出长度 {} 小于期望 {}", data.len(), expected);
    return Err(ProcessError::OutputTooShort {
      expected,
      actual: data.len(),
    });
  }
  Ok(())
}

fn expect_count(outputs: &[&[f32]], expected: usize) -> Result<(), ProcessError> {
  if outputs.len() != expected {
    error!("输出张量数量 {} 与期望 {} 不符", outputs.len(), expected);
    return Err(ProcessError::OutputCount {
      expected,
      actual: outputs.len(),
    });
  }
  Ok(())
}

/// 贪心非极大值抑制，IoU 分母为并集面积
pub fn nms(mut candidates: Vec<BBox2D>) -> Vec<BBox2D> {
  candidates.sort_by(|a, b| b.conf.total_cmp(&a.conf));
  let mut kept: Vec<BBox2D> = Vec::with_capacity(candidates.len());
  for candidate in candidates {
    if kept
      .iter()
      .all(|picked| candidate.iou(picked) <= NMS_IOU_THRESHOLD)
    {
      kept.push(candidate);
    }
  }
  kept
}

/// 输出形状 `[4 + cls, N]`
#[derive(Debug, Clone)]
pub struct Yolov8Origin {
  num_classes: usize,
  anchors: usize,
}

impl Yolov8Origin {
  pub fn new(
    input_height: usize,
    input_width: usize,
    num_classes: usize,
    strides: &[usize],
  ) -> Result<Self, ProcessError> {
    Ok(Self {
      num_classes,
      anchors: anchor_count(input_height, input_width, strides)?,
    })
  }
}

impl PostProcess for Yolov8Origin {
  fn postprocess(
    &self,
    outputs: &[&[f32]],
    conf_threshold: f32,
    scale: f32,
  ) -> Result<Vec<BBox2D>, ProcessError> {
    expect_count(outputs, 1)?;
    let data = outputs[0];
    let n = self.anchors;
    expect_len(data, (4 + self.num_classes) * n)?;

    let mut candidates = Vec::new();
    for i in 0..n {
      let mut conf = 0.0;
      let mut cls = 0;
      for j in 0..self.num_classes {
        let v = data[(4 + j) * n + i];
        if v > conf {
          conf = v;
          cls = j;
        }
      }
      if conf >= conf_threshold {
        let candidate = BBox2D {
          x: data[i],
          y: data[n + i],
          w: data[2 * n + i],
          h: data[3 * n + i],
          conf,
          cls: cls as u32,
        };
        candidates.push(candidate.unscale(scale));
      }
    }
    debug!("候选框 {} 个", candidates.len());
    Ok(nms(candidates))
  }

  fn num_classes(&self) -> usize {
    self.num_classes
  }

  fn anchor_count(&self) -> usize {
    self.anchors
  }
}

/// 输出形状 `[N, 4 + cls]`
#[derive(Debug, Clone)]
pub struct Yolov8Transpose {
  num_classes: usize,
  anchors: usize,
}

impl Yolov8Transpose {
  pub fn new(
    input_height: usize,
    input_width: usize,
    num_classes: usize,
    strides: &[usize],
  ) -> Result<Self, ProcessError> {
    Ok(Self {
      num_classes,
      anchors: anchor_count(input_height, input_width, strides)?,
    })
  }
}

impl PostProcess for Yolov8Transpose {
  fn postprocess(
    &self,
    outputs: &[&[f32]],
    conf_threshold: f32,
    scale: f32,
  ) -> Result<Vec<BBox2D>, ProcessError> {
    expect_count(outputs, 1)?;
    let data = outputs[0];
    let stride = 4 + self.num_classes;
    expect_len(data, stride * self.anchors)?;

    let candidates: Vec<BBox2D> = data
      .chunks_exact(stride)
      .take(self.anchors)
      .filter_map(|row| {
        let (cls, conf) = row[4..]
          .iter()
          .enumerate()
          .fold((0, 0.0f32), |(bc, bv), (c, &v)| if v > bv { (c, v) } else { (bc, bv) });
        (conf >= conf_threshold).then(|| {
          BBox2D {
            x: row[0],
            y: row[1],
            w: row[2],
            h: row[3],
            conf,
            cls: cls as u32,
          }
          .unscale(scale)
        })
      })
      .collect();
    debug!("候选框 {} 个", candidates.len());
    Ok(nms(candidates))
  }

  fn num_classes(&self) -> usize {
    self.num_classes
  }

  fn anchor_count(&self) -> usize {
    self.anchors
  }
}

/// 按检测层拆分的输出：每层依次为 DFL 回归 (64 通道)、各类别分数、类别最大分数
#[derive(Debug, Clone)]
pub struct Yolov8Divide {
  num_classes: usize,
  anchors: usize,
  input_height: usize,
  input_width: usize,
  strides: Vec<usize>,
}

impl Yolov8Divide {
  pub fn new(
    input_height: usize,
    input_width: usize,
    num_classes: usize,
    strides: &[usize],
  ) -> Result<Self, ProcessError> {
    let anchors = anchor_count(input_height, input_width, strides)?;
    Ok(Self {
      num_classes,
      anchors,
      input_height,
      input_width,
      strides: strides.to_vec(),
    })
  }

  /// 每层输出张量数量
  pub const TENSORS_PER_LEVEL: usize = 3;
}

/// 16 个 bin 上 softmax 后的期望
fn dfl_expectation(logits: &[f32]) -> f32 {
  let max = logits.iter().copied().fold(f32::MIN, f32::max);
  let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
  let sum: f32 = exps.iter().sum();
  exps
    .iter()
    .enumerate()
    .map(|(i, &e)| e / sum * i as f32)
    .sum()
}

impl PostProcess for Yolov8Divide {
  fn postprocess(
    &self,
    outputs: &[&[f32]],
    conf_threshold: f32,
    scale: f32,
  ) -> Result<Vec<BBox2D>, ProcessError> {
    expect_count(outputs, self.strides.len() * Self::TENSORS_PER_LEVEL)?;

    let mut candidates = Vec::new();
    let mut logits = [0.0f32; DFL_BINS];
    for (level, &stride) in self.strides.iter().enumerate() {
      let (l_h, l_w) = (self.input_height / stride, self.input_width / stride);
      let plane = l_h * l_w;
      let base = level * Self::TENSORS_PER_LEVEL;
      let (boxes, scores, reduced) = (outputs[base], outputs[base + 1], outputs[base + 2]);
      expect_len(boxes, DFL_CHANNELS * plane)?;
      expect_len(scores, self.num_classes * plane)?;
      expect_len(reduced, plane)?;

      for r in 0..l_h {
        for c in 0..l_w {
          let cell = r * l_w + c;
          if reduced[cell] < conf_threshold {
            continue;
          }

          let mut conf = 0.0;
          let mut cls = 0;
          for j in 0..self.num_classes {
            let v = scores[cell + plane * j];
            if v > conf_threshold && v > conf {
              conf = v;
              cls = j;
            }
          }
          if conf <= conf_threshold {
            continue;
          }

          let mut dist = [0.0f32; 4];
          for (side, d) in dist.iter_mut().enumerate() {
            for (bin, logit) in logits.iter_mut().enumerate() {
              *logit = boxes[cell + plane * (side * DFL_BINS + bin)];
            }
            *d = dfl_expectation(&logits);
          }

          let s = stride as f32;
          let (cx, cy) = (c as f32 + 0.5, r as f32 + 0.5);
          let x1 = (cx - dist[0]) * s;
          let y1 = (cy - dist[1]) * s;
          let x2 = (cx + dist[2]) * s;
          let y2 = (cy + dist[3]) * s;
          candidates.push(BBox2D::from_corners(x1, y1, x2, y2, conf, cls as u32).unscale(scale));
        }
      }
    }
    debug!("候选框 {} 个", candidates.len());
    Ok(nms(candidates))
  }

  fn num_classes(&self) -> usize {
    self.num_classes
  }

  fn anchor_count(&self) -> usize {
    self.anchors
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const STRIDES: [usize; 3] = [8, 16, 32];

  #[test]
  fn strides_must_divide_input() {
    assert!(Yolov8Origin::new(640, 640, 80, &STRIDES).is_ok());
    assert!(Yolov8Origin::new(640, 600, 80, &STRIDES).is_err());
    assert!(Yolov8Divide::new(100, 640, 80, &STRIDES).is_err());
    assert!(Yolov8Transpose::new(640, 640, 80, &[]).is_err());
  }

  #[test]
  fn nms_suppresses_heavy_overlap_only() {
    let a = BBox2D::from_corners(0.0, 0.0, 10.0, 10.0, 0.9, 0);
    // IoU 0.9
    let b = BBox2D::from_corners(0.0, 0.0, 10.0, 9.0, 0.8, 0);
    // IoU 1/3
    let c = BBox2D::from_corners(5.0, 0.0, 15.0, 10.0, 0.7, 1);
    let kept = nms(vec![c, b, a]);
    assert_eq!(kept, vec![a, c]);
  }

  #[test]
  fn nms_measures_overlap_around_box_centers() {
    let a = BBox2D {
      x: 50.0,
      y: 50.0,
      w: 40.0,
      h: 40.0,
      conf: 0.9,
      cls: 0,
    };
    let b = BBox2D {
      x: 45.0,
      w: 30.0,
      conf: 0.8,
      ..a
    };
    // 以中心展开时 b 落在 a 内部，IoU 为 0.75
    assert_eq!(a.iou(&b), 0.75);
    assert_eq!(nms(vec![b, a]), vec![a]);

    // 把 (x, y) 当作左上角时 IoU 只有 5/9，两个框都会保留
    let a_tl = BBox2D::from_corners(50.0, 50.0, 90.0, 90.0, 0.9, 0);
    let b_tl = BBox2D::from_corners(45.0, 50.0, 75.0, 90.0, 0.8, 0);
    assert!((a_tl.iou(&b_tl) - 5.0 / 9.0).abs() < 1e-6);
    assert_eq!(nms(vec![a_tl, b_tl]).len(), 2);
  }

  #[test]
  fn stride_32_peak_decodes_to_cell_center() {
    let post = Yolov8Origin::new(640, 640, 80, &STRIDES).unwrap();
    let n = 8400;
    let mut data = vec![0.001f32; (4 + 80) * n];
    // stride 32 层从 80*80 + 40*40 开始，格子 (10, 10)
    let idx = 6400 + 1600 + 10 * 20 + 10;
    data[idx] = 10.5 * 32.0;
    data[n + idx] = 10.5 * 32.0;
    data[2 * n + idx] = 64.0;
    data[3 * n + idx] = 48.0;
    data[(4 + 3) * n + idx] = 0.9;

    let boxes = post.postprocess(&[&data], 0.4, 1.0).unwrap();
    assert_eq!(boxes.len(), 1);
    let b = boxes[0];
    assert_eq!(b.cls, 3);
    assert!((b.conf - 0.9).abs() < 1e-6);
    assert!((b.x - 336.0).abs() < 1e-4);
    assert!((b.y - 336.0).abs() < 1e-4);
  }

  #[test]
  fn transpose_layout_matches_origin() {
    let n = 8400;
    let classes = 2;
    let origin = Yolov8Origin::new(640, 640, classes, &STRIDES).unwrap();
    let transpose = Yolov8Transpose::new(640, 640, classes, &STRIDES).unwrap();

    let mut planar = vec![0.0f32; (4 + classes) * n];
    let mut rows = vec![0.0f32; (4 + classes) * n];
    for (i, values) in [(17usize, [100.0, 120.0, 30.0, 40.0, 0.2, 0.8]), (5000, [400.0, 300.0, 50.0, 50.0, 0.6, 0.1])] {
      for (k, v) in values.iter().enumerate() {
        planar[k * n + i] = *v;
        rows[i * (4 + classes) + k] = *v;
      }
    }

    let a = origin.postprocess(&[&planar], 0.5, 2.0).unwrap();
    let b = transpose.postprocess(&[&rows], 0.5, 2.0).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 2);
    assert_eq!(a[0].cls, 1);
    assert_eq!(a[0].x, 50.0);
  }

  #[test]
  fn divide_decodes_dfl_and_gates_on_reduced_score() {
    let post = Yolov8Divide::new(64, 64, 2, &[32]).unwrap();
    let plane = 2 * 2;
    let mut boxes = vec![0.0f32; DFL_CHANNELS * plane];
    let mut scores = vec![0.0f32; 2 * plane];
    let mut reduced = vec![0.0f32; plane];

    // 格子 (r=1, c=0)，四条边的分布都集中在 bin 1
    let cell = 2;
    for side in 0..4 {
      boxes[cell + plane * (side * DFL_BINS + 1)] = 50.0;
    }
    scores[cell + plane] = 0.7;
    reduced[cell] = 0.7;
    // 另一个格子分数高但被 reduced 门限过滤
    scores[3] = 0.9;

    let out = post.postprocess(&[&boxes, &scores, &reduced], 0.5, 1.0).unwrap();
    assert_eq!(out.len(), 1);
    let b = out[0];
    assert_eq!(b.cls, 1);
    // 中心 (0.5, 1.5) * 32, 每边距离 1 * 32
    assert!((b.x - 16.0).abs() < 1e-3);
    assert!((b.y - 48.0).abs() < 1e-3);
    assert!((b.w - 64.0).abs() < 1e-3);
    assert!((b.h - 64.0).abs() < 1e-3);
  }

  #[test]
  fn divide_checks_tensor_count() {
    let post = Yolov8Divide::new(64, 64, 2, &[32]).unwrap();
    let data = vec![0.0f32; 256];
    assert!(matches!(
      post.postprocess(&[&data], 0.5, 1.0),
      Err(ProcessError::OutputCount { expected: 3, actual: 1 })
    ));
  }
}
