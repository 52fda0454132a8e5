// 该文件是 Beifeng （北风） 项目的一部分。
// src/bin/simple_detect.rs - NPU 上的 YOLOv8 检测示例
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

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use url::Url;

use beifeng::{
  FromUrl,
  engine::{NpuEngineBuilder, RknpuRuntime},
  frame::ImageFrame,
  model::{COCO_CLASSES, Detector, Yolov8Builder},
  pipeline::PipelineConfig,
  process::{BBox2D, HostPreProcess, Yolov8Divide},
};

const INPUT_SIZE: usize = 640;
const STRIDES: [usize; 3] = [8, 16, 32];

/// Beifeng 检测示例参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，例如 npu:///path/to/yolov8.rknn?contexts=3
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图片
  #[arg(long, value_name = "IMAGE")]
  pub input: PathBuf,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,
  /// 额外通过流水线提交的次数，0 表示只做同步检测
  #[arg(long, default_value = "0", value_name = "COUNT")]
  pub repeat: usize,
  /// 流水线配置 (JSON)
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
}

#[derive(Serialize)]
struct Detection<'a> {
  label: &'a str,
  #[serde(flatten)]
  bbox: BBox2D,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("模型地址: {}", args.model);
  info!("输入图片: {}", args.input.display());

  let config = match &args.config {
    Some(path) => PipelineConfig::from_json(&std::fs::read_to_string(path)?)?,
    None => PipelineConfig::default(),
  };

  // 每层输出依次为 DFL 回归、类别分数、类别分数之和
  let mut engine = NpuEngineBuilder::<RknpuRuntime>::from_url(&args.model)?
    .shape("input0", &[1, INPUT_SIZE, INPUT_SIZE, 3]);
  let classes = COCO_CLASSES.len();
  let mut output_names = Vec::new();
  for (level, stride) in STRIDES.iter().enumerate() {
    let grid = INPUT_SIZE / stride;
    for (i, channels) in [64, classes, 1].into_iter().enumerate() {
      let name = format!("output{}", level * 3 + i);
      engine = engine.shape(&name, &[1, channels, grid, grid]);
      output_names.push(name);
    }
  }
  let engine = engine.build()?;

  let model = Yolov8Builder::new(
    Box::new(engine),
    Box::new(HostPreProcess::raw(false)),
    Box::new(Yolov8Divide::new(INPUT_SIZE, INPUT_SIZE, classes, &STRIDES)?),
  )
  .input_names(&["input0"])
  .output_names(&output_names)
  .build()?;
  let detector = Detector::with_config(model, config)?;

  let image = image::open(&args.input)
    .with_context(|| format!("无法读取图片 {}", args.input.display()))?
    .to_rgb8();
  let frame = ImageFrame::from(image);

  info!("开始推理...");
  let now = std::time::Instant::now();
  let boxes = detector.detect(&frame, args.confidence)?;
  info!("推理完成，耗时: {:.2?}", now.elapsed());

  let detections: Vec<Detection> = boxes
    .iter()
    .map(|b| Detection {
      label: COCO_CLASSES.get(b.cls as usize).copied().unwrap_or("unknown"),
      bbox: *b,
    })
    .collect();
  println!("{}", serde_json::to_string_pretty(&detections)?);

  if args.repeat > 0 {
    detector.init_pipeline()?;
    let now = std::time::Instant::now();
    let futures = (0..args.repeat)
      .map(|_| detector.detect_async(&frame, args.confidence))
      .collect::<Result<Vec<_>, _>>()?;
    let mut total = 0;
    for future in futures {
      total += future.get()?.len();
    }
    let elapsed = now.elapsed();
    info!(
      "流水线完成 {} 次推理，共 {} 个目标，平均耗时: {:.2?}",
      args.repeat,
      total,
      elapsed / args.repeat as u32
    );
    detector.close_pipeline()?;
  }

  Ok(())
}
