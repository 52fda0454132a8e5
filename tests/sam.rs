// 该文件是 Beifeng （北风） 项目的一部分。
// tests/sam.rs - MobileSAM 编码器与解码器衔接的集成测试
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

mod common;

use std::sync::{Arc, Mutex};

use beifeng::blob::DataLocation;
use beifeng::engine::{InferenceEngine, TensorMut, TensorRef};
use beifeng::model::{MobileSam, MobileSamBuilder, ModelError, SamPrompt};
use beifeng::process::{BBox2D, HostPreProcess};

use common::{MockBackend, cpu_engine, f32_desc, input, npu_engine, output, solid_frame};

const MASK: usize = 256;
// 特征图 C=2, H=2, W=3
const FEATURES_NCHW: [i64; 4] = [1, 2, 2, 3];

#[derive(Default, Debug)]
struct Seen {
  embeddings: Vec<f32>,
  embedding_location: Option<DataLocation>,
  prompt: Vec<f32>,
  prompt_shape: Vec<usize>,
  labels: Vec<f32>,
  has_mask: f32,
  mask_input_sum: f32,
}

type Recorder = Arc<Mutex<Seen>>;

fn encoder() -> Box<dyn InferenceEngine> {
  let backend = MockBackend::new(
    vec![f32_desc("images", &[1, 3, 1024, 1024])],
    vec![f32_desc("features", &FEATURES_NCHW)],
    |_, outputs: &mut [TensorMut<'_>]| {
      assert_eq!(outputs[0].location, DataLocation::Device);
      for (i, v) in output(outputs, "features").iter_mut().enumerate() {
        *v = i as f32;
      }
      Ok(())
    },
  );
  Box::new(cpu_engine(backend))
}

fn write_left_half_mask(outputs: &mut [TensorMut<'_>]) {
  for (i, v) in output(outputs, "masks").iter_mut().enumerate() {
    *v = if i % MASK < MASK / 2 { 3.0 } else { -3.0 };
  }
}

fn record_common(seen: &mut Seen, inputs: &[TensorRef<'_>]) {
  let embeddings = inputs.iter().find(|t| t.name == "image_embeddings").unwrap();
  seen.embedding_location = Some(embeddings.location);
  seen.embeddings = input(inputs, "image_embeddings").to_vec();
  seen.has_mask = input(inputs, "has_mask_input")[0];
  seen.mask_input_sum = input(inputs, "mask_input").iter().sum();
}

/// CPU 框解码器，布局与编码器一致
fn box_decoder(recorder: Recorder) -> Box<dyn InferenceEngine> {
  let backend = MockBackend::new(
    vec![
      f32_desc("image_embeddings", &FEATURES_NCHW),
      f32_desc("boxes", &[1, -1, 4]),
      f32_desc("mask_input", &[1, 1, MASK as i64, MASK as i64]),
      f32_desc("has_mask_input", &[1]),
    ],
    vec![
      f32_desc("masks", &[1, 1, MASK as i64, MASK as i64]),
      f32_desc("scores", &[1, 1]),
    ],
    move |inputs, outputs| {
      let mut seen = recorder.lock().unwrap();
      record_common(&mut seen, inputs);
      let boxes = inputs.iter().find(|t| t.name == "boxes").unwrap();
      seen.prompt_shape = boxes.shape.to_vec();
      let n: usize = boxes.shape.iter().product();
      seen.prompt = input(inputs, "boxes")[..n].to_vec();
      write_left_half_mask(outputs);
      Ok(())
    },
  );
  Box::new(common::cpu_engine_with_shapes(backend, &[("boxes", &[1, 4, 4])]))
}

/// NPU 点解码器，特征按 NHWC 读取，点数固定为 2
fn point_decoder(recorder: Recorder) -> Box<dyn InferenceEngine> {
  let backend = MockBackend::new(
    vec![
      f32_desc("image_embeddings", &[1, 2, 3, 2]),
      f32_desc("point_coords", &[1, 2, 2]),
      f32_desc("point_labels", &[1, 2]),
      f32_desc("mask_input", &[1, 1, MASK as i64, MASK as i64]),
      f32_desc("has_mask_input", &[1]),
    ],
    vec![
      f32_desc("masks", &[1, 1, MASK as i64, MASK as i64]),
      f32_desc("scores", &[1, 1]),
    ],
    move |inputs, outputs| {
      let mut seen = recorder.lock().unwrap();
      record_common(&mut seen, inputs);
      let coords = inputs.iter().find(|t| t.name == "point_coords").unwrap();
      seen.prompt_shape = coords.shape.to_vec();
      seen.prompt = input(inputs, "point_coords").to_vec();
      seen.labels = input(inputs, "point_labels").to_vec();
      write_left_half_mask(outputs);
      Ok(())
    },
  );
  Box::new(npu_engine(backend, 1))
}

fn sam(boxes: Option<&Recorder>, points: Option<&Recorder>) -> Result<MobileSam, ModelError> {
  let mut builder = MobileSamBuilder::new(encoder(), Box::new(HostPreProcess::default()));
  if let Some(recorder) = boxes {
    builder = builder.box_decoder(box_decoder(Arc::clone(recorder)));
  }
  if let Some(recorder) = points {
    builder = builder.point_decoder(point_decoder(Arc::clone(recorder)));
  }
  builder.build()
}

fn assert_left_half(mask: &image::GrayImage) {
  // 源图 512x256，比例 2
  assert_eq!(mask.dimensions(), (512, 256));
  assert_eq!(mask.get_pixel(20, 100).0[0], 255);
  assert_eq!(mask.get_pixel(490, 100).0[0], 0);
  assert!(mask.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
}

#[test]
fn box_prompt_reads_encoder_features_in_place() {
  let recorder = Recorder::default();
  let model = sam(Some(&recorder), None).unwrap();
  let prompt = SamPrompt::Boxes(vec![BBox2D::from_corners(10.0, 20.0, 110.0, 220.0, 1.0, 0)]);
  let mask = model.generate_mask(&solid_frame(512, 256), prompt).unwrap();
  assert_left_half(&mask);

  let seen = recorder.lock().unwrap();
  // 同一布局，不做转换，直接读取编码器的设备端输出
  let expected: Vec<f32> = (0..12).map(|v| v as f32).collect();
  assert_eq!(seen.embeddings, expected);
  assert_eq!(seen.embedding_location, Some(DataLocation::Device));
  assert_eq!(seen.prompt_shape, vec![1, 1, 4]);
  assert_eq!(seen.prompt, vec![20.0, 40.0, 220.0, 440.0]);
  assert_eq!(seen.has_mask, 1.0);
  assert_eq!(seen.mask_input_sum, 0.0);
}

#[test]
fn point_prompt_transposes_features_for_npu_decoder() {
  let recorder = Recorder::default();
  let model = sam(None, Some(&recorder)).unwrap();
  let prompt = SamPrompt::Points {
    points: vec![(5.0, 6.0), (7.0, 8.0)],
    labels: vec![1, 0],
  };
  let mask = model.generate_mask(&solid_frame(512, 256), prompt).unwrap();
  assert_left_half(&mask);

  let seen = recorder.lock().unwrap();
  let (c, h, w) = (2, 2, 3);
  let mut expected = Vec::new();
  for hi in 0..h {
    for wi in 0..w {
      for ci in 0..c {
        expected.push((ci * h * w + hi * w + wi) as f32);
      }
    }
  }
  assert_eq!(seen.embeddings, expected);
  assert_eq!(seen.prompt_shape, vec![1, 2, 2]);
  assert_eq!(seen.prompt, vec![10.0, 12.0, 14.0, 16.0]);
  assert_eq!(seen.labels, vec![1.0, 0.0]);
  assert_eq!(seen.has_mask, 1.0);
}

#[test]
fn static_decoder_rejects_other_point_counts() {
  let recorder = Recorder::default();
  let model = sam(None, Some(&recorder)).unwrap();
  let prompt = SamPrompt::Points {
    points: vec![(5.0, 6.0)],
    labels: vec![1],
  };
  assert!(matches!(
    model.generate_mask(&solid_frame(64, 64), prompt),
    Err(ModelError::InvalidArgument(_))
  ));
  assert!(recorder.lock().unwrap().embeddings.is_empty());
}

#[test]
fn prompt_must_match_a_decoder() {
  assert!(matches!(sam(None, None), Err(ModelError::InvalidArgument(_))));

  let recorder = Recorder::default();
  let model = sam(None, Some(&recorder)).unwrap();
  assert!(model.has_point_decoder());
  assert!(!model.has_box_decoder());
  let boxes = SamPrompt::Boxes(vec![BBox2D::from_corners(0.0, 0.0, 4.0, 4.0, 1.0, 0)]);
  assert!(model.generate_mask(&solid_frame(64, 64), boxes).is_err());

  let uneven = SamPrompt::Points {
    points: vec![(1.0, 1.0), (2.0, 2.0)],
    labels: vec![1],
  };
  assert!(matches!(
    model.generate_mask(&solid_frame(64, 64), uneven),
    Err(ModelError::InvalidArgument(_))
  ));
}

#[test]
fn async_masks_resolve() {
  let boxes = Recorder::default();
  let points = Recorder::default();
  let model = sam(Some(&boxes), Some(&points)).unwrap();
  model.init_pipeline().unwrap();

  let frame = solid_frame(512, 256);
  let futures: Vec<_> = (0..6)
    .map(|i| {
      let prompt = if i % 2 == 0 {
        SamPrompt::Boxes(vec![BBox2D::from_corners(10.0, 20.0, 110.0, 220.0, 1.0, 0)])
      } else {
        SamPrompt::Points {
          points: vec![(5.0, 6.0), (7.0, 8.0)],
          labels: vec![1, 0],
        }
      };
      model.generate_mask_async(&frame, prompt).unwrap()
    })
    .collect();
  for future in futures {
    assert_left_half(&future.get().unwrap());
  }
  model.close_pipeline().unwrap();
}
