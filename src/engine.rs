// 该文件是 Beifeng （北风） 项目的一部分。
// src/engine.rs - 推理引擎抽象
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

//! 推理引擎。
//!
//! 三种硬件后端（GPU / CPU / NPU）共用 [`InferenceEngine`] 接口，
//! 流水线按 `preprocess -> inference -> postprocess` 三个阶段调用它们。

mod cpu;
mod gpu;
mod npu;
#[cfg(feature = "rknpu")]
mod rknpu_runtime;

use std::collections::HashMap;

use thiserror::Error;
use tracing::{error, warn};

use crate::blob::{
  BlobBuffer, BlobError, BoundTensor, DataLocation, ElementType, ShapePolicy, TensorData,
  TensorSpec,
};

pub use cpu::{CpuEngineBuilder, CpuRuntimeEngine};
pub use gpu::{GpuEngine, GpuEngineBuilder};
pub use npu::{NpuEngine, NpuEngineBuilder, NpuRuntime};
#[cfg(feature = "rknpu")]
pub use rknpu_runtime::RknpuRuntime;

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("推理上下文初始化失败: {0}")]
  ContextInit(String),
  #[error("张量 {name} 的形状不兼容: {reason}")]
  ShapeIncompatible { name: String, reason: String },
  #[error("推理执行失败: {0}")]
  Execution(String),
  #[error("缓冲区错误: {0}")]
  Blob(#[from] BlobError),
  #[error("模型路径错误: {0}")]
  ModelPath(String),
  #[error("参数无效: {0}")]
  InvalidArgument(String),
}

impl EngineError {
  pub fn incompatible(name: &str, reason: impl Into<String>) -> Self {
    EngineError::ShapeIncompatible {
      name: name.to_string(),
      reason: reason.into(),
    }
  }
}

/// 硬件后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
  Gpu,
  Cpu,
  Npu,
}

/// 引擎期望的特征图内存布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
  Nchw,
  Nhwc,
}

/// 模型自报的张量描述，负数维度表示动态，空维度表示模型未给出形状
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
  pub name: String,
  pub dims: Vec<i64>,
  pub dtype: ElementType,
}

impl TensorDesc {
  pub fn new(name: impl Into<String>, dims: Vec<i64>, dtype: ElementType) -> Self {
    Self {
      name: name.into(),
      dims,
      dtype,
    }
  }

  pub fn is_dynamic(&self) -> bool {
    self.dims.is_empty() || self.dims.iter().any(|&d| d < 0)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelIo {
  pub inputs: Vec<TensorDesc>,
  pub outputs: Vec<TensorDesc>,
}

/// 按形状覆盖表把模型自报的描述解析为具体的张量规格
///
/// 未给出覆盖的动态张量无法分配，视为构造错误。
pub fn resolve_specs(
  descs: &[TensorDesc],
  overrides: &HashMap<String, Vec<usize>>,
  policy: ShapePolicy,
) -> Result<Vec<TensorSpec>, EngineError> {
  descs
    .iter()
    .map(|desc| match overrides.get(&desc.name) {
      Some(shape) => {
        if !desc.dims.is_empty() {
          if desc.dims.len() != shape.len() {
            error!(
              "张量 {} 的维度数不一致: 模型 {:?}, 指定 {:?}",
              desc.name, desc.dims, shape
            );
            return Err(EngineError::incompatible(
              &desc.name,
              format!("维度数应为 {}, 指定为 {}", desc.dims.len(), shape.len()),
            ));
          }
          let fixed_mismatch = desc
            .dims
            .iter()
            .zip(shape)
            .any(|(&d, &s)| d >= 0 && d as usize != s);
          if fixed_mismatch && policy == ShapePolicy::Static {
            error!(
              "张量 {} 的形状与模型不一致: 模型 {:?}, 指定 {:?}",
              desc.name, desc.dims, shape
            );
            return Err(EngineError::incompatible(
              &desc.name,
              format!("模型形状为 {:?}", desc.dims),
            ));
          }
        }
        if shape.iter().any(|&s| s == 0) {
          return Err(EngineError::incompatible(&desc.name, "维度不能为 0"));
        }
        Ok(TensorSpec::new(desc.name.clone(), shape.clone(), desc.dtype))
      }
      None => {
        if desc.is_dynamic() {
          error!("张量 {} 为动态形状 {:?}, 需要显式指定", desc.name, desc.dims);
          return Err(EngineError::incompatible(&desc.name, "动态形状需要显式指定"));
        }
        let shape = desc.dims.iter().map(|&d| d as usize).collect();
        Ok(TensorSpec::new(desc.name.clone(), shape, desc.dtype))
      }
    })
    .collect()
}

/// 校验形状覆盖表中的名称都属于模型
pub(crate) fn check_override_names(
  io: &ModelIo,
  overrides: &HashMap<String, Vec<usize>>,
) -> Result<(), EngineError> {
  for name in overrides.keys() {
    let known = io
      .inputs
      .iter()
      .chain(&io.outputs)
      .any(|desc| &desc.name == name);
    if !known {
      error!("形状覆盖中的张量 {} 不存在于模型中", name);
      return Err(EngineError::incompatible(name, "模型中没有该张量"));
    }
  }
  Ok(())
}

/// 传给后端的只读输入张量
#[derive(Debug)]
pub struct TensorRef<'a> {
  pub name: &'a str,
  pub shape: &'a [usize],
  pub location: DataLocation,
  pub data: &'a TensorData,
}

/// 传给后端的可写输出张量
#[derive(Debug)]
pub struct TensorMut<'a> {
  pub name: &'a str,
  pub shape: &'a [usize],
  pub location: DataLocation,
  pub data: &'a mut TensorData,
}

/// 一次推理调用绑定的全部张量
pub(crate) struct Bindings {
  inputs: Vec<BoundTensor>,
  outputs: Vec<BoundTensor>,
}

impl Bindings {
  pub(crate) fn collect(
    blobs: &BlobBuffer,
    inputs: &[TensorSpec],
    outputs: &[TensorSpec],
  ) -> Result<Self, BlobError> {
    let inputs = inputs
      .iter()
      .map(|spec| blobs.bind(&spec.name))
      .collect::<Result<Vec<_>, _>>()?;
    let outputs = outputs
      .iter()
      .map(|spec| blobs.bind(&spec.name))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Self { inputs, outputs })
  }

  pub(crate) fn inputs(&self) -> &[BoundTensor] {
    &self.inputs
  }

  /// 锁住所有绑定的存储并交给 `f`
  pub(crate) fn with_tensors<R>(
    &self,
    f: impl FnOnce(&[TensorRef<'_>], &mut [TensorMut<'_>]) -> R,
  ) -> Result<R, EngineError> {
    let in_guards = self
      .inputs
      .iter()
      .map(|b| {
        b.storage
          .read()
          .map_err(|_| BlobError::Poisoned(b.name.clone()))
      })
      .collect::<Result<Vec<_>, _>>()?;
    let mut out_guards = self
      .outputs
      .iter()
      .map(|b| {
        b.storage
          .write()
          .map_err(|_| BlobError::Poisoned(b.name.clone()))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let inputs: Vec<TensorRef<'_>> = self
      .inputs
      .iter()
      .zip(&in_guards)
      .map(|(b, g)| TensorRef {
        name: &b.name,
        shape: &b.shape,
        location: b.location,
        data: g,
      })
      .collect();
    let mut outputs: Vec<TensorMut<'_>> = self
      .outputs
      .iter()
      .zip(out_guards.iter_mut())
      .map(|(b, g)| TensorMut {
        name: &b.name,
        shape: &b.shape,
        location: b.location,
        data: &mut **g,
      })
      .collect();

    Ok(f(&inputs, &mut outputs))
  }
}

/// 会话式后端（CPU 运行时、GPU 引擎）的能力接口
pub trait Session: Send + Sync {
  /// 从序列化的模型数据创建会话
  fn load(model: &[u8], options: &SessionOptions) -> Result<Self, EngineError>
  where
    Self: Sized;

  fn model_io(&self) -> ModelIo;

  fn run(&self, inputs: &[TensorRef<'_>], outputs: &mut [TensorMut<'_>])
  -> Result<(), EngineError>;

  /// 等待已提交的工作完成，同步执行的后端无需实现
  fn synchronize(&self) -> Result<(), EngineError> {
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
  pub threads: usize,
}

impl Default for SessionOptions {
  fn default() -> Self {
    Self { threads: 1 }
  }
}

/// 推理引擎的公共契约
pub trait InferenceEngine: Send + Sync {
  fn kind(&self) -> EngineKind;

  fn name(&self) -> &str;

  /// 特征图类张量在该后端上的内存布局
  fn native_layout(&self) -> TensorLayout;

  fn input_specs(&self) -> &[TensorSpec];

  fn output_specs(&self) -> &[TensorSpec];

  fn alloc_blobs_buffer(&self) -> BlobBuffer;

  /// 为缓冲区中的张量建立后端描述
  fn preprocess(&self, blobs: &mut BlobBuffer) -> Result<(), EngineError>;

  /// 提交推理，可能只是把工作交给后台
  fn inference(&self, blobs: &mut BlobBuffer) -> Result<(), EngineError>;

  /// 等待并回收 `inference` 提交的工作
  fn postprocess(&self, blobs: &mut BlobBuffer) -> Result<(), EngineError>;

  fn sync_infer(&self, blobs: &mut BlobBuffer) -> Result<(), EngineError> {
    self.preprocess(blobs)?;
    self.inference(blobs)?;
    self.postprocess(blobs)
  }

  fn blob_names(&self) -> Vec<&str> {
    self
      .input_specs()
      .iter()
      .chain(self.output_specs())
      .map(|s| s.name.as_str())
      .collect()
  }
}

/// 会话式后端共用的张量绑定逻辑
pub(crate) fn bind_session_tensors(
  engine: &str,
  blobs: &mut BlobBuffer,
  inputs: &[TensorSpec],
  outputs: &[TensorSpec],
  accepts_device: bool,
) -> Result<(), EngineError> {
  let bindings = Bindings::collect(blobs, inputs, outputs)?;
  if !accepts_device {
    for bound in bindings.inputs() {
      if bound.location == DataLocation::Device {
        warn!(
          "{}: 输入张量 {} 位于设备端, 按主机内存处理",
          engine, bound.name
        );
      }
    }
  }
  blobs.set_bindings(bindings);
  Ok(())
}

/// 从 URL 查询参数中读取形状覆盖，格式为 `shape.<name>=1x3x640x640`
pub(crate) fn parse_shape_query(url: &url::Url) -> Result<HashMap<String, Vec<usize>>, EngineError> {
  let mut shapes = HashMap::new();
  for (key, value) in url.query_pairs() {
    let Some(name) = key.strip_prefix("shape.") else {
      continue;
    };
    let dims = value
      .split('x')
      .map(|d| d.trim().parse::<usize>())
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| EngineError::InvalidArgument(format!("形状 {} 无法解析: {}", value, e)))?;
    shapes.insert(name.to_string(), dims);
  }
  Ok(shapes)
}

pub(crate) fn parse_count_query(
  url: &url::Url,
  key: &str,
) -> Result<Option<usize>, EngineError> {
  match url.query_pairs().find(|(k, _)| k == key) {
    Some((_, v)) => {
      let n = v
        .parse::<usize>()
        .map_err(|e| EngineError::InvalidArgument(format!("{} 参数无效: {}", key, e)))?;
      if n == 0 {
        return Err(EngineError::InvalidArgument(format!("{} 必须大于 0", key)));
      }
      Ok(Some(n))
    }
    None => Ok(None),
  }
}

pub(crate) fn read_model(path: &str) -> Result<Vec<u8>, EngineError> {
  tracing::info!("加载模型文件: {}", path);
  let data = std::fs::read(path)?;
  tracing::debug!(
    "模型文件大小: {:.2} MB",
    data.len() as f64 / (1024.0 * 1024.0)
  );
  Ok(data)
}
