// 该文件是 Beifeng （北风） 项目的一部分。
// src/engine/npu.rs - NPU 推理引擎
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

//! NPU 引擎持有固定数量的硬件上下文，通过有界队列借出。
//!
//! `inference` 只在取得上下文之前阻塞，真正的硬件调用交给后台线程，
//! 线程句柄挂在缓冲区上，由下一阶段的 `postprocess` 回收。

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use url::Url;

use super::{
  Bindings, EngineError, EngineKind, InferenceEngine, ModelIo, TensorLayout, TensorMut, TensorRef,
  check_override_names, parse_count_query, parse_shape_query, read_model, resolve_specs,
};
use crate::blob::{BlobBuffer, DataLocation, ElementType, ShapePolicy, TensorSpec};
use crate::pipeline::BlockQueue;
use crate::{FromUrl, FromUrlWithScheme};

const NPU_SCHEME: &str = "npu";
const DEFAULT_CONTEXTS: usize = 1;

/// 单个 NPU 硬件上下文
pub trait NpuRuntime: Send + Sync + 'static {
  fn load(model: &[u8]) -> Result<Self, EngineError>
  where
    Self: Sized;

  fn model_io(&self) -> Result<ModelIo, EngineError>;

  fn run(&self, inputs: &[TensorRef<'_>], outputs: &mut [TensorMut<'_>])
  -> Result<(), EngineError>;
}

pub struct NpuEngine<R: NpuRuntime> {
  contexts: Arc<Vec<R>>,
  slots: Arc<BlockQueue<usize>>,
  name: String,
  inputs: Vec<TensorSpec>,
  outputs: Vec<TensorSpec>,
}

impl<R: NpuRuntime> NpuEngine<R> {
  /// 用已创建的上下文构造引擎，输入输出描述取自第一个上下文
  pub fn from_contexts(
    name: impl Into<String>,
    contexts: Vec<R>,
    shapes: &HashMap<String, Vec<usize>>,
    input_types: &HashMap<String, ElementType>,
  ) -> Result<Self, EngineError> {
    let name = name.into();
    let Some(first) = contexts.first() else {
      return Err(EngineError::ContextInit("至少需要一个推理上下文".to_string()));
    };

    let mut io = first.model_io()?;
    check_override_names(&io, shapes)?;
    for (blob, dtype) in input_types {
      match io.inputs.iter_mut().find(|d| &d.name == blob) {
        Some(desc) => desc.dtype = *dtype,
        None => {
          error!("类型覆盖中的输入张量 {} 不存在", blob);
          return Err(EngineError::incompatible(blob, "模型中没有该输入"));
        }
      }
    }
    // NPU 输出统一反量化为 f32
    for desc in io.outputs.iter_mut() {
      desc.dtype = ElementType::F32;
    }

    let inputs = resolve_specs(&io.inputs, shapes, ShapePolicy::Static)?;
    let outputs = resolve_specs(&io.outputs, shapes, ShapePolicy::Static)?;
    for spec in inputs.iter().chain(&outputs) {
      debug!(
        "{}: 张量 {} 形状 {:?} 类型 {:?}",
        name, spec.name, spec.shape, spec.dtype
      );
    }

    let slots = BlockQueue::new(contexts.len());
    for idx in 0..contexts.len() {
      let _ = slots.push(idx);
    }
    info!(
      "NPU 引擎 {} 初始化完成, 上下文 {} 个",
      name,
      contexts.len()
    );

    Ok(Self {
      contexts: Arc::new(contexts),
      slots: Arc::new(slots),
      name,
      inputs,
      outputs,
    })
  }

  pub fn context_count(&self) -> usize {
    self.contexts.len()
  }

  /// 当前空闲的上下文数量
  pub fn idle_contexts(&self) -> usize {
    self.slots.len()
  }
}

impl<R: NpuRuntime> InferenceEngine for NpuEngine<R> {
  fn kind(&self) -> EngineKind {
    EngineKind::Npu
  }

  fn name(&self) -> &str {
    &self.name
  }

  fn native_layout(&self) -> TensorLayout {
    TensorLayout::Nhwc
  }

  fn input_specs(&self) -> &[TensorSpec] {
    &self.inputs
  }

  fn output_specs(&self) -> &[TensorSpec] {
    &self.outputs
  }

  fn alloc_blobs_buffer(&self) -> BlobBuffer {
    BlobBuffer::allocate(&self.inputs, &self.outputs, ShapePolicy::Static)
  }

  fn preprocess(&self, blobs: &mut BlobBuffer) -> Result<(), EngineError> {
    let bindings = Bindings::collect(blobs, &self.inputs, &self.outputs)?;
    for bound in bindings.inputs() {
      if bound.location == DataLocation::Device {
        warn!(
          "{}: 输入张量 {} 标记在设备端, NPU 直接读取共享内存",
          self.name, bound.name
        );
      }
    }
    blobs.set_bindings(bindings);
    Ok(())
  }

  fn inference(&self, blobs: &mut BlobBuffer) -> Result<(), EngineError> {
    let bindings = match blobs.take_bindings() {
      Some(bindings) => bindings,
      None => Bindings::collect(blobs, &self.inputs, &self.outputs)?,
    };

    let Some(idx) = self.slots.take() else {
      error!("{}: 上下文队列已关闭", self.name);
      return Err(EngineError::Execution("上下文队列已关闭".to_string()));
    };
    debug!("{}: 使用上下文 {}", self.name, idx);

    let contexts = Arc::clone(&self.contexts);
    let slots = Arc::clone(&self.slots);
    let spawned = std::thread::Builder::new()
      .name(format!("npu-ctx-{}", idx))
      .spawn(move || {
        let result = bindings
          .with_tensors(|inputs, outputs| contexts[idx].run(inputs, outputs))
          .and_then(|r| r);
        let _ = slots.push(idx);
        result
      });

    match spawned {
      Ok(handle) => {
        blobs.set_pending(handle);
        Ok(())
      }
      Err(e) => {
        let _ = self.slots.push(idx);
        error!("{}: 无法创建推理线程: {}", self.name, e);
        Err(EngineError::Execution(format!("无法创建推理线程: {}", e)))
      }
    }
  }

  fn postprocess(&self, blobs: &mut BlobBuffer) -> Result<(), EngineError> {
    let Some(handle) = blobs.take_pending() else {
      error!("{}: 没有待回收的推理任务", self.name);
      return Err(EngineError::Execution("没有待回收的推理任务".to_string()));
    };
    match handle.join() {
      Ok(result) => result.inspect_err(|e| error!("{}: 推理失败: {}", self.name, e)),
      Err(_) => {
        error!("{}: 推理线程异常退出", self.name);
        Err(EngineError::Execution("推理线程异常退出".to_string()))
      }
    }
  }
}

impl<R: NpuRuntime> Drop for NpuEngine<R> {
  fn drop(&mut self) {
    // 收回全部上下文，等待仍在后台执行的推理
    for _ in 0..self.contexts.len() {
      if self.slots.take().is_none() {
        break;
      }
    }
    self.slots.set_no_more_input();
    debug!("{}: 上下文已全部回收", self.name);
  }
}

pub struct NpuEngineBuilder<R> {
  model_path: String,
  contexts: usize,
  shapes: HashMap<String, Vec<usize>>,
  input_types: HashMap<String, ElementType>,
  _runtime: PhantomData<fn() -> R>,
}

impl<R: NpuRuntime> FromUrl for NpuEngineBuilder<R> {
  type Error = EngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != NPU_SCHEME {
      return Err(EngineError::ModelPath(format!(
        "模型路径必须使用 {} 方案",
        NPU_SCHEME
      )));
    }
    if url.path().is_empty() {
      return Err(EngineError::ModelPath("模型路径为空".to_string()));
    }

    Ok(NpuEngineBuilder {
      model_path: url.path().to_string(),
      contexts: parse_count_query(url, "contexts")?.unwrap_or(DEFAULT_CONTEXTS),
      shapes: parse_shape_query(url)?,
      input_types: HashMap::new(),
      _runtime: PhantomData,
    })
  }
}

impl<R: NpuRuntime> FromUrlWithScheme for NpuEngineBuilder<R> {
  const SCHEME: &'static str = NPU_SCHEME;
}

impl<R: NpuRuntime> NpuEngineBuilder<R> {
  pub fn contexts(mut self, contexts: usize) -> Self {
    self.contexts = contexts.max(1);
    self
  }

  pub fn shape(mut self, name: &str, dims: &[usize]) -> Self {
    self.shapes.insert(name.to_string(), dims.to_vec());
    self
  }

  /// 指定输入张量的元素类型，例如把输入改为 f32
  pub fn input_type(mut self, name: &str, dtype: ElementType) -> Self {
    self.input_types.insert(name.to_string(), dtype);
    self
  }

  pub fn build(self) -> Result<NpuEngine<R>, EngineError> {
    let model = read_model(&self.model_path)?;
    info!("创建 {} 个 NPU 推理上下文", self.contexts);
    let contexts = (0..self.contexts)
      .map(|_| R::load(&model))
      .collect::<Result<Vec<_>, _>>()?;
    NpuEngine::from_contexts(self.model_path, contexts, &self.shapes, &self.input_types)
  }
}
