// 该文件是 Beifeng （北风） 项目的一部分。
// tests/common/mod.rs - 集成测试共用的模拟后端
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

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use beifeng::blob::ElementType;
use beifeng::engine::{
  CpuRuntimeEngine, EngineError, ModelIo, NpuEngine, NpuRuntime, Session, SessionOptions,
  TensorDesc, TensorMut, TensorRef,
};
use beifeng::frame::{ImageFrame, PixelFormat};

pub type RunFn =
  dyn Fn(&[TensorRef<'_>], &mut [TensorMut<'_>]) -> Result<(), EngineError> + Send + Sync;

pub fn f32_desc(name: &str, dims: &[i64]) -> TensorDesc {
  TensorDesc::new(name, dims.to_vec(), ElementType::F32)
}

/// 统计调用次数与最大并发数
#[derive(Default)]
pub struct CallStats {
  pub calls: AtomicUsize,
  active: AtomicUsize,
  pub peak: AtomicUsize,
}

impl CallStats {
  fn enter(&self) {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
  }

  fn leave(&self) {
    self.active.fetch_sub(1, Ordering::SeqCst);
  }
}

/// 按给定闭包执行的模拟后端，CPU 会话与 NPU 上下文共用
#[derive(Clone)]
pub struct MockBackend {
  io: ModelIo,
  run: Arc<RunFn>,
  delay: Duration,
  pub stats: Arc<CallStats>,
}

impl MockBackend {
  pub fn new(
    inputs: Vec<TensorDesc>,
    outputs: Vec<TensorDesc>,
    run: impl Fn(&[TensorRef<'_>], &mut [TensorMut<'_>]) -> Result<(), EngineError>
    + Send
    + Sync
    + 'static,
  ) -> Self {
    Self {
      io: ModelIo { inputs, outputs },
      run: Arc::new(run),
      delay: Duration::ZERO,
      stats: Arc::new(CallStats::default()),
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  fn execute(
    &self,
    inputs: &[TensorRef<'_>],
    outputs: &mut [TensorMut<'_>],
  ) -> Result<(), EngineError> {
    self.stats.enter();
    if !self.delay.is_zero() {
      std::thread::sleep(self.delay);
    }
    let result = (self.run)(inputs, outputs);
    self.stats.leave();
    result
  }
}

impl Session for MockBackend {
  fn load(_model: &[u8], _options: &SessionOptions) -> Result<Self, EngineError> {
    Err(EngineError::ModelInvalid("模拟会话不能从文件加载".to_string()))
  }

  fn model_io(&self) -> ModelIo {
    self.io.clone()
  }

  fn run(&self, inputs: &[TensorRef<'_>], outputs: &mut [TensorMut<'_>]) -> Result<(), EngineError> {
    self.execute(inputs, outputs)
  }
}

impl NpuRuntime for MockBackend {
  fn load(_model: &[u8]) -> Result<Self, EngineError> {
    Err(EngineError::ModelInvalid("模拟上下文不能从文件加载".to_string()))
  }

  fn model_io(&self) -> Result<ModelIo, EngineError> {
    Ok(self.io.clone())
  }

  fn run(&self, inputs: &[TensorRef<'_>], outputs: &mut [TensorMut<'_>]) -> Result<(), EngineError> {
    self.execute(inputs, outputs)
  }
}

pub fn cpu_engine(backend: MockBackend) -> CpuRuntimeEngine<MockBackend> {
  cpu_engine_with_shapes(backend, &[])
}

pub fn cpu_engine_with_shapes(
  backend: MockBackend,
  shapes: &[(&str, &[usize])],
) -> CpuRuntimeEngine<MockBackend> {
  let shapes: HashMap<String, Vec<usize>> = shapes
    .iter()
    .map(|(name, dims)| (name.to_string(), dims.to_vec()))
    .collect();
  CpuRuntimeEngine::from_session("mock-cpu", backend, &shapes).unwrap()
}

/// 每个上下文共享同一个闭包与统计
pub fn npu_engine(backend: MockBackend, contexts: usize) -> NpuEngine<MockBackend> {
  let contexts = (0..contexts).map(|_| backend.clone()).collect();
  NpuEngine::from_contexts("mock-npu", contexts, &HashMap::new(), &HashMap::new()).unwrap()
}

pub fn solid_frame(width: usize, height: usize) -> ImageFrame {
  ImageFrame::new(vec![128; width * height * 3], width, height, PixelFormat::Bgr).unwrap()
}

pub fn output<'a, 'b>(outputs: &'a mut [TensorMut<'b>], name: &str) -> &'a mut [f32] {
  let tensor = outputs.iter_mut().find(|t| t.name == name).unwrap();
  tensor.data.as_f32_mut().unwrap()
}

pub fn input<'a>(inputs: &'a [TensorRef<'_>], name: &str) -> &'a [f32] {
  let tensor = inputs.iter().find(|t| t.name == name).unwrap();
  tensor.data.as_f32().unwrap()
}
