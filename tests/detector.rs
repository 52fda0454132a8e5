// 该文件是 Beifeng （北风） 项目的一部分。
// tests/detector.rs - 检测模型与异步流水线的集成测试
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

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use beifeng::engine::{EngineError, InferenceEngine, TensorMut};
use beifeng::model::{Detector, ModelError, RtDetrBuilder, Yolov8, Yolov8Builder};
use beifeng::pipeline::{PipelineConfig, PipelineError, PipelineState};
use beifeng::process::{HostPreProcess, Yolov8Origin};

use common::{MockBackend, cpu_engine, f32_desc, npu_engine, output, solid_frame};

const INPUT: usize = 64;
const CLASSES: usize = 4;
// 64x64 输入、步长 32，共 4 个候选
const ANCHORS: usize = 4;

/// 在第 3 个候选 (网格 (1, 1)) 上输出一个类别 2 的框
fn write_one_box(outputs: &mut [TensorMut<'_>]) -> Result<(), EngineError> {
  let data = output(outputs, "output0");
  data.fill(0.0);
  let i = 3;
  data[i] = 48.0;
  data[ANCHORS + i] = 48.0;
  data[2 * ANCHORS + i] = 20.0;
  data[3 * ANCHORS + i] = 20.0;
  data[(4 + 2) * ANCHORS + i] = 0.9;
  Ok(())
}

fn yolo_backend() -> MockBackend {
  MockBackend::new(
    vec![f32_desc("images", &[1, 3, INPUT as i64, INPUT as i64])],
    vec![f32_desc("output0", &[1, (4 + CLASSES) as i64, ANCHORS as i64])],
    |_, outputs| write_one_box(outputs),
  )
}

fn yolov8(engine: Box<dyn InferenceEngine>) -> Result<Yolov8, ModelError> {
  Yolov8Builder::new(
    engine,
    Box::new(HostPreProcess::default()),
    Box::new(Yolov8Origin::new(INPUT, INPUT, CLASSES, &[32]).unwrap()),
  )
  .input_size(INPUT, INPUT)
  .num_classes(CLASSES)
  .strides(&[32])
  .build()
}

#[test]
fn sync_detect_maps_boxes_to_source_image() {
  let detector = Detector::new(yolov8(Box::new(cpu_engine(yolo_backend()))).unwrap()).unwrap();
  // 128x128 缩放到 64x64，比例 0.5
  let boxes = detector.detect(&solid_frame(128, 128), 0.4).unwrap();
  assert_eq!(boxes.len(), 1);
  let b = boxes[0];
  assert_eq!(b.cls, 2);
  assert!((b.conf - 0.9).abs() < 1e-6);
  assert_eq!((b.x, b.y, b.w, b.h), (96.0, 96.0, 40.0, 40.0));

  assert!(detector.detect(&solid_frame(128, 128), 0.95).unwrap().is_empty());
}

#[test]
fn async_detect_resolves_every_future() {
  let backend = yolo_backend().with_delay(Duration::from_millis(2));
  let stats = backend.stats.clone();
  let config = PipelineConfig {
    queue_capacity: 2,
    pool_size: 3,
    workers_per_stage: 2,
  };
  let detector =
    Detector::with_config(yolov8(Box::new(cpu_engine(backend))).unwrap(), config).unwrap();
  detector.init_pipeline().unwrap();
  assert_eq!(detector.pipeline_state(), PipelineState::Running);

  let frame = solid_frame(64, 64);
  let futures: Vec<_> = (0..24)
    .map(|_| detector.detect_async(&frame, 0.4).unwrap())
    .collect();
  for future in futures {
    let boxes = future.get().unwrap();
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0].x, 48.0);
  }

  let pool = detector.pool().unwrap();
  assert!(pool.peak_in_use() <= 3);
  assert_eq!(pool.in_use(), 0);
  assert_eq!(stats.calls.load(Ordering::SeqCst), 24);

  detector.stop_pipeline().unwrap();
  assert_eq!(detector.pipeline_state(), PipelineState::Stopped);
}

#[test]
fn stop_drains_submitted_packages() {
  let backend = yolo_backend().with_delay(Duration::from_millis(5));
  let detector = Detector::new(yolov8(Box::new(cpu_engine(backend))).unwrap()).unwrap();
  detector.init_pipeline().unwrap();
  let frame = solid_frame(64, 64);
  let futures: Vec<_> = (0..8)
    .map(|_| detector.detect_async(&frame, 0.4).unwrap())
    .collect();
  detector.stop_pipeline().unwrap();
  for future in futures {
    assert!(future.get().is_ok());
  }
}

#[test]
fn engine_failure_fails_only_that_package() {
  let backend = MockBackend::new(
    vec![f32_desc("images", &[1, 3, INPUT as i64, INPUT as i64])],
    vec![f32_desc("output0", &[1, (4 + CLASSES) as i64, ANCHORS as i64])],
    |_, _| Err(EngineError::Execution("硬件超时".to_string())),
  );
  let detector = Detector::new(yolov8(Box::new(cpu_engine(backend))).unwrap()).unwrap();

  assert!(matches!(
    detector.detect(&solid_frame(64, 64), 0.4),
    Err(ModelError::Engine(EngineError::Execution(_)))
  ));

  detector.init_pipeline().unwrap();
  let err = detector
    .detect_async(&solid_frame(64, 64), 0.4)
    .unwrap()
    .get()
    .unwrap_err();
  match err {
    PipelineError::StageFailed { stage, .. } => assert_eq!(stage, "inference"),
    other => panic!("unexpected error: {other:?}"),
  }
  // 失败的任务归还了缓冲区
  assert_eq!(detector.pool().unwrap().in_use(), 0);
  detector.close_pipeline().unwrap();
}

#[test]
fn panicking_backend_leaves_the_buffer_usable() {
  let calls = Arc::new(AtomicUsize::new(0));
  let seen = Arc::clone(&calls);
  let backend = MockBackend::new(
    vec![f32_desc("images", &[1, 3, INPUT as i64, INPUT as i64])],
    vec![f32_desc("output0", &[1, (4 + CLASSES) as i64, ANCHORS as i64])],
    move |_, outputs| {
      if seen.fetch_add(1, Ordering::SeqCst) == 0 {
        output(outputs, "output0")[0] = f32::NAN;
        panic!("后端在写输出时崩溃");
      }
      write_one_box(outputs)
    },
  );
  let config = PipelineConfig {
    queue_capacity: 1,
    pool_size: 1,
    workers_per_stage: 1,
  };
  let detector =
    Detector::with_config(yolov8(Box::new(cpu_engine(backend))).unwrap(), config).unwrap();
  detector.init_pipeline().unwrap();

  let frame = solid_frame(64, 64);
  let err = detector.detect_async(&frame, 0.4).unwrap().get().unwrap_err();
  assert_eq!(err, PipelineError::StagePanicked("inference".to_string()));

  // 同一个缓冲区被复用
  for _ in 0..3 {
    let boxes = detector.detect_async(&frame, 0.4).unwrap().get().unwrap();
    assert_eq!(boxes.len(), 1);
  }
  assert_eq!(calls.load(Ordering::SeqCst), 4);
  detector.close_pipeline().unwrap();
}

#[test]
fn pipeline_lifecycle_guards() {
  let detector = Detector::new(yolov8(Box::new(cpu_engine(yolo_backend()))).unwrap()).unwrap();
  assert!(detector.detect_async(&solid_frame(64, 64), 0.4).is_err());
  assert!(detector.stop_pipeline().is_err());

  detector.init_pipeline().unwrap();
  assert!(matches!(
    detector.init_pipeline(),
    Err(ModelError::Pipeline(PipelineError::AlreadyRunning))
  ));
  detector.close_pipeline().unwrap();
  assert!(detector.pool().is_none());

  // 关闭后重新启动会得到新的缓冲池
  detector.init_pipeline().unwrap();
  let boxes = detector
    .detect_async(&solid_frame(64, 64), 0.4)
    .unwrap()
    .get()
    .unwrap();
  assert_eq!(boxes.len(), 1);
  assert!(detector.pool().is_some());
  detector.close_pipeline().unwrap();
}

#[test]
fn blob_names_are_checked_at_construction() {
  let err = Yolov8Builder::new(
    Box::new(cpu_engine(yolo_backend())),
    Box::new(HostPreProcess::default()),
    Box::new(Yolov8Origin::new(INPUT, INPUT, CLASSES, &[32]).unwrap()),
  )
  .input_size(INPUT, INPUT)
  .strides(&[32])
  .output_names(&["logits"])
  .build();
  assert!(matches!(err, Err(ModelError::MissingBlob { ref name, .. }) if name == "logits"));

  let extra = MockBackend::new(
    vec![f32_desc("images", &[1, 3, INPUT as i64, INPUT as i64])],
    vec![
      f32_desc("output0", &[1, (4 + CLASSES) as i64, ANCHORS as i64]),
      f32_desc("output1", &[1, 1]),
    ],
    |_, _| Ok(()),
  );
  assert!(matches!(
    yolov8(Box::new(cpu_engine(extra))),
    Err(ModelError::BlobCountMismatch {
      expected: 2,
      actual: 3,
      ..
    })
  ));

  let err = Yolov8Builder::new(
    Box::new(cpu_engine(yolo_backend())),
    Box::new(HostPreProcess::default()),
    Box::new(Yolov8Origin::new(INPUT, INPUT, CLASSES, &[32]).unwrap()),
  )
  .input_size(INPUT, INPUT)
  .strides(&[24])
  .build();
  assert!(matches!(err, Err(ModelError::InvalidArgument(_))));
}

#[test]
fn decoder_must_match_model_classes_and_strides() {
  let build = |classes: usize, strides: &[usize]| {
    Yolov8Builder::new(
      Box::new(cpu_engine(yolo_backend())),
      Box::new(HostPreProcess::default()),
      Box::new(Yolov8Origin::new(INPUT, INPUT, CLASSES, &[32]).unwrap()),
    )
    .input_size(INPUT, INPUT)
    .num_classes(classes)
    .strides(strides)
    .build()
  };
  assert!(build(CLASSES, &[32]).is_ok());
  assert!(matches!(build(80, &[32]), Err(ModelError::InvalidArgument(_))));
  assert!(matches!(build(CLASSES, &[16, 32]), Err(ModelError::InvalidArgument(_))));
}

#[test]
fn npu_contexts_bound_concurrency() {
  let backend = yolo_backend().with_delay(Duration::from_millis(10));
  let stats = backend.stats.clone();
  let config = PipelineConfig {
    queue_capacity: 4,
    pool_size: 4,
    workers_per_stage: 3,
  };
  let detector =
    Detector::with_config(yolov8(Box::new(npu_engine(backend, 2))).unwrap(), config).unwrap();
  detector.init_pipeline().unwrap();

  let frame = solid_frame(64, 64);
  let futures: Vec<_> = (0..12)
    .map(|_| detector.detect_async(&frame, 0.4).unwrap())
    .collect();
  for future in futures {
    assert_eq!(future.get().unwrap().len(), 1);
  }
  detector.close_pipeline().unwrap();

  assert_eq!(stats.calls.load(Ordering::SeqCst), 12);
  assert!(stats.peak.load(Ordering::SeqCst) <= 2);
}

#[test]
fn npu_buffers_refuse_shape_changes() {
  let engine = npu_engine(yolo_backend(), 1);
  let mut blobs = engine.alloc_blobs_buffer();
  assert!(blobs.set_shape("images", &[1, 3, 32, 32]).is_err());
  assert_eq!(blobs.shape("images").unwrap(), &[1, 3, INPUT, INPUT]);
}

#[test]
fn rt_detr_filters_by_score() {
  let backend = MockBackend::new(
    vec![f32_desc("images", &[1, 3, INPUT as i64, INPUT as i64])],
    vec![
      f32_desc("labels", &[1, 3]),
      f32_desc("boxes", &[1, 3, 4]),
      f32_desc("scores", &[1, 3]),
    ],
    |_, outputs| {
      output(outputs, "labels").copy_from_slice(&[1.0, 4.0, 0.0]);
      output(outputs, "boxes").copy_from_slice(&[
        0.0, 0.0, 10.0, 10.0, //
        8.0, 8.0, 24.0, 40.0, //
        1.0, 1.0, 2.0, 2.0,
      ]);
      output(outputs, "scores").copy_from_slice(&[0.2, 0.8, 0.1]);
      Ok(())
    },
  );
  let model = RtDetrBuilder::new(Box::new(cpu_engine(backend)), Box::new(HostPreProcess::default()))
    .input_size(INPUT, INPUT)
    .build()
    .unwrap();
  let detector = Detector::new(model).unwrap();
  // 32x32 放大到 64x64，比例 2
  let boxes = detector.detect(&solid_frame(32, 32), 0.5).unwrap();
  assert_eq!(boxes.len(), 1);
  assert_eq!(boxes[0].cls, 4);
  assert_eq!((boxes[0].x, boxes[0].y, boxes[0].w, boxes[0].h), (8.0, 12.0, 8.0, 16.0));
}
