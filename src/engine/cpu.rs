// 该文件是 Beifeng （北风） 项目的一部分。
// src/engine/cpu.rs - CPU 运行时推理引擎
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

use std::collections::HashMap;
use std::marker::PhantomData;

use tracing::{debug, error, info};
use url::Url;

use super::{
  Bindings, EngineError, EngineKind, InferenceEngine, Session, SessionOptions, TensorLayout,
  bind_session_tensors, check_override_names, parse_count_query, parse_shape_query, read_model,
  resolve_specs,
};
use crate::blob::{BlobBuffer, ShapePolicy, TensorSpec};
use crate::{FromUrl, FromUrlWithScheme};

const CPU_SCHEME: &str = "cpu";

/// 基于会话式 CPU 运行时的引擎，支持动态形状
pub struct CpuRuntimeEngine<S: Session> {
  session: S,
  name: String,
  inputs: Vec<TensorSpec>,
  outputs: Vec<TensorSpec>,
}

impl<S: Session> CpuRuntimeEngine<S> {
  pub fn from_session(
    name: impl Into<String>,
    session: S,
    shapes: &HashMap<String, Vec<usize>>,
  ) -> Result<Self, EngineError> {
    let name = name.into();
    let io = session.model_io();
    check_override_names(&io, shapes)?;
    let inputs = resolve_specs(&io.inputs, shapes, ShapePolicy::Dynamic)?;
    let outputs = resolve_specs(&io.outputs, shapes, ShapePolicy::Dynamic)?;
    for spec in inputs.iter().chain(&outputs) {
      debug!("{}: 张量 {} 形状 {:?}", name, spec.name, spec.shape);
    }
    info!(
      "CPU 引擎 {} 初始化完成, 输入 {} 个, 输出 {} 个",
      name,
      inputs.len(),
      outputs.len()
    );

    Ok(Self {
      session,
      name,
      inputs,
      outputs,
    })
  }

  pub fn session(&self) -> &S {
    &self.session
  }
}

impl<S: Session> InferenceEngine for CpuRuntimeEngine<S> {
  fn kind(&self) -> EngineKind {
    EngineKind::Cpu
  }

  fn name(&self) -> &str {
    &self.name
  }

  fn native_layout(&self) -> TensorLayout {
    TensorLayout::Nchw
  }

  fn input_specs(&self) -> &[TensorSpec] {
    &self.inputs
  }

  fn output_specs(&self) -> &[TensorSpec] {
    &self.outputs
  }

  fn alloc_blobs_buffer(&self) -> BlobBuffer {
    BlobBuffer::allocate(&self.inputs, &self.outputs, ShapePolicy::Dynamic)
  }

  fn preprocess(&self, blobs: &mut BlobBuffer) -> Result<(), EngineError> {
    bind_session_tensors(&self.name, blobs, &self.inputs, &self.outputs, false)
  }

  fn inference(&self, blobs: &mut BlobBuffer) -> Result<(), EngineError> {
    let bindings = match blobs.take_bindings() {
      Some(bindings) => bindings,
      None => Bindings::collect(blobs, &self.inputs, &self.outputs)?,
    };
    bindings
      .with_tensors(|inputs, outputs| self.session.run(inputs, outputs))?
      .inspect_err(|e| error!("{}: 推理失败: {}", self.name, e))
  }

  fn postprocess(&self, _blobs: &mut BlobBuffer) -> Result<(), EngineError> {
    Ok(())
  }
}

pub struct CpuEngineBuilder<S> {
  model_path: String,
  options: SessionOptions,
  shapes: HashMap<String, Vec<usize>>,
  _session: PhantomData<fn() -> S>,
}

impl<S: Session> FromUrl for CpuEngineBuilder<S> {
  type Error = EngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != CPU_SCHEME {
      return Err(EngineError::ModelPath(format!(
        "模型路径必须使用 {} 方案",
        CPU_SCHEME
      )));
    }
    if url.path().is_empty() {
      return Err(EngineError::ModelPath("模型路径为空".to_string()));
    }

    let mut options = SessionOptions::default();
    if let Some(threads) = parse_count_query(url, "threads")? {
      options.threads = threads;
    }

    Ok(CpuEngineBuilder {
      model_path: url.path().to_string(),
      options,
      shapes: parse_shape_query(url)?,
      _session: PhantomData,
    })
  }
}

impl<S: Session> FromUrlWithScheme for CpuEngineBuilder<S> {
  const SCHEME: &'static str = CPU_SCHEME;
}

impl<S: Session> CpuEngineBuilder<S> {
  pub fn threads(mut self, threads: usize) -> Self {
    self.options.threads = threads.max(1);
    self
  }

  pub fn shape(mut self, name: &str, dims: &[usize]) -> Self {
    self.shapes.insert(name.to_string(), dims.to_vec());
    self
  }

  pub fn build(self) -> Result<CpuRuntimeEngine<S>, EngineError> {
    let model = read_model(&self.model_path)?;
    info!("创建 CPU 推理会话, 线程数 {}", self.options.threads);
    let session = S::load(&model, &self.options)?;
    CpuRuntimeEngine::from_session(self.model_path, session, &self.shapes)
  }
}
