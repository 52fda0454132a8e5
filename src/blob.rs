// 该文件是 Beifeng （北风） 项目的一部分。
// src/blob.rs - 推理张量缓冲区
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

//! 一次推理调用所需的全部命名张量。
//!
//! 每个张量有两层记录：
//! - 内层：缓冲区自己持有的分配，构造后不再改变；
//! - 外层：调用方可见的绑定（存储 + 位置），可以被重定向到别的缓冲区的存储上，
//!   用于编码器输出到解码器输入的零拷贝交接。
//!
//! 借用关系通过 [`BlobView`] 显式表达。借用方必须在出借方被复用之前解除借用，
//! 流水线在缓冲区归还缓冲池时调用 [`BlobBuffer::reset`] 完成这一点。

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{error, warn};

use crate::engine::{Bindings, EngineError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlobError {
  #[error("未知的张量名称: {0}")]
  UnknownBlob(String),
  #[error("张量 {name} 的维度数不可改变: 原始 {expected}, 请求 {actual}")]
  RankMismatch {
    name: String,
    expected: usize,
    actual: usize,
  },
  #[error("张量 {name} 的形状 {shape:?} 超出已分配容量 {capacity}")]
  ExceedsCapacity {
    name: String,
    shape: Vec<usize>,
    capacity: usize,
  },
  #[error("当前后端不支持动态形状 (张量 {0})")]
  DynamicShapeUnsupported(String),
  #[error("张量 {name} 的数据类型不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  TypeMismatch {
    name: String,
    expected: ElementType,
    actual: ElementType,
  },
  #[error("张量 {name} 的元素数量不匹配: 期望 {expected}, 实际 {actual}")]
  SizeMismatch {
    name: String,
    expected: usize,
    actual: usize,
  },
  #[error("缓冲区已释放")]
  Released,
  #[error("张量 {0} 的锁已失效")]
  Poisoned(String),
}

/// 张量数据所在的内存位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataLocation {
  #[default]
  Host,
  Device,
  Unknown,
}

/// 张量元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
  F32,
  U8,
}

impl ElementType {
  pub fn byte_size(&self) -> usize {
    match self {
      ElementType::F32 => 4,
      ElementType::U8 => 1,
    }
  }
}

/// 张量的实际存储
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
  F32(Vec<f32>),
  U8(Vec<u8>),
}

impl TensorData {
  pub fn zeros(dtype: ElementType, len: usize) -> Self {
    match dtype {
      ElementType::F32 => TensorData::F32(vec![0.0; len]),
      ElementType::U8 => TensorData::U8(vec![0; len]),
    }
  }

  pub fn len(&self) -> usize {
    match self {
      TensorData::F32(v) => v.len(),
      TensorData::U8(v) => v.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn element_type(&self) -> ElementType {
    match self {
      TensorData::F32(_) => ElementType::F32,
      TensorData::U8(_) => ElementType::U8,
    }
  }

  pub fn as_f32(&self) -> Option<&[f32]> {
    match self {
      TensorData::F32(v) => Some(v),
      TensorData::U8(_) => None,
    }
  }

  pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
    match self {
      TensorData::F32(v) => Some(v),
      TensorData::U8(_) => None,
    }
  }

  pub fn as_u8(&self) -> Option<&[u8]> {
    match self {
      TensorData::U8(v) => Some(v),
      TensorData::F32(_) => None,
    }
  }

  pub fn as_u8_mut(&mut self) -> Option<&mut [u8]> {
    match self {
      TensorData::U8(v) => Some(v),
      TensorData::F32(_) => None,
    }
  }
}

pub(crate) type SharedStorage = Arc<RwLock<TensorData>>;

/// 模型解析后的张量描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
  pub name: String,
  pub shape: Vec<usize>,
  pub dtype: ElementType,
}

impl TensorSpec {
  pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: ElementType) -> Self {
    Self {
      name: name.into(),
      shape,
      dtype,
    }
  }

  pub fn element_count(&self) -> usize {
    self.shape.iter().product()
  }
}

/// 缓冲区是否允许修改形状中的具体数值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapePolicy {
  Dynamic,
  Static,
}

/// 对另一个缓冲区中某个张量存储的借用视图
#[derive(Debug, Clone)]
pub struct BlobView {
  storage: SharedStorage,
  location: DataLocation,
  dtype: ElementType,
  len: usize,
}

impl BlobView {
  pub fn location(&self) -> DataLocation {
    self.location
  }

  pub fn element_type(&self) -> ElementType {
    self.dtype
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }
}

#[derive(Debug)]
struct Binding {
  storage: SharedStorage,
  location: DataLocation,
  borrowed: bool,
}

#[derive(Debug)]
struct TensorSlot {
  dtype: ElementType,
  capacity: usize,
  shape: Vec<usize>,
  inner: SharedStorage,
  outer: Binding,
}

impl TensorSlot {
  fn own_binding(&self, location: DataLocation) -> Binding {
    Binding {
      storage: Arc::clone(&self.inner),
      location,
      borrowed: false,
    }
  }
}

/// 已绑定的张量快照，可以脱离缓冲区移动到其它线程上执行
pub(crate) struct BoundTensor {
  pub name: String,
  pub shape: Vec<usize>,
  pub location: DataLocation,
  pub storage: SharedStorage,
}

/// 后台推理任务的句柄
pub(crate) type PendingInference = JoinHandle<Result<(), EngineError>>;

pub struct BlobBuffer {
  slots: HashMap<String, TensorSlot>,
  inputs: Vec<String>,
  outputs: Vec<String>,
  policy: ShapePolicy,
  released: bool,
  bindings: Option<Bindings>,
  pending: Option<PendingInference>,
}

impl std::fmt::Debug for BlobBuffer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BlobBuffer")
      .field("inputs", &self.inputs)
      .field("outputs", &self.outputs)
      .field("policy", &self.policy)
      .field("released", &self.released)
      .field("pending", &self.pending.is_some())
      .finish()
  }
}

impl BlobBuffer {
  /// 按张量描述分配缓冲区，所有张量初始都位于 HOST
  pub fn allocate(inputs: &[TensorSpec], outputs: &[TensorSpec], policy: ShapePolicy) -> Self {
    let mut slots = HashMap::with_capacity(inputs.len() + outputs.len());
    for spec in inputs.iter().chain(outputs) {
      let capacity = spec.element_count();
      let inner = Arc::new(RwLock::new(TensorData::zeros(spec.dtype, capacity)));
      let outer = Binding {
        storage: Arc::clone(&inner),
        location: DataLocation::Host,
        borrowed: false,
      };
      slots.insert(
        spec.name.clone(),
        TensorSlot {
          dtype: spec.dtype,
          capacity,
          shape: spec.shape.clone(),
          inner,
          outer,
        },
      );
    }

    Self {
      slots,
      inputs: inputs.iter().map(|s| s.name.clone()).collect(),
      outputs: outputs.iter().map(|s| s.name.clone()).collect(),
      policy,
      released: false,
      bindings: None,
      pending: None,
    }
  }

  /// 张量数量
  pub fn size(&self) -> usize {
    self.slots.len()
  }

  pub fn input_names(&self) -> &[String] {
    &self.inputs
  }

  pub fn output_names(&self) -> &[String] {
    &self.outputs
  }

  pub fn contains(&self, name: &str) -> bool {
    self.slots.contains_key(name)
  }

  pub fn shape_policy(&self) -> ShapePolicy {
    self.policy
  }

  fn slot(&self, name: &str, op: &str) -> Result<&TensorSlot, BlobError> {
    if self.released {
      error!("`{}` 访问已释放的缓冲区", op);
      return Err(BlobError::Released);
    }
    self.slots.get(name).ok_or_else(|| {
      error!("`{}` 得到无效的张量名称: {}", op, name);
      BlobError::UnknownBlob(name.to_string())
    })
  }

  fn slot_mut(&mut self, name: &str, op: &str) -> Result<&mut TensorSlot, BlobError> {
    if self.released {
      error!("`{}` 访问已释放的缓冲区", op);
      return Err(BlobError::Released);
    }
    self.slots.get_mut(name).ok_or_else(|| {
      error!("`{}` 得到无效的张量名称: {}", op, name);
      BlobError::UnknownBlob(name.to_string())
    })
  }

  /// 调用方可见的张量位置
  pub fn location(&self, name: &str) -> Result<DataLocation, BlobError> {
    Ok(self.slot(name, "location")?.outer.location)
  }

  /// 外层绑定是否借用了其它缓冲区的存储
  pub fn is_borrowed(&self, name: &str) -> Result<bool, BlobError> {
    Ok(self.slot(name, "is_borrowed")?.outer.borrowed)
  }

  /// 把外层绑定指回自身的分配并标记位置，不触碰实际分配
  pub fn set_buffer_location(
    &mut self,
    name: &str,
    location: DataLocation,
  ) -> Result<(), BlobError> {
    let slot = self.slot_mut(name, "set_buffer_location")?;
    slot.outer = slot.own_binding(location);
    Ok(())
  }

  /// 为另一个缓冲区（或另一个引擎）借出该张量的存储
  pub fn view(&self, name: &str) -> Result<BlobView, BlobError> {
    let slot = self.slot(name, "view")?;
    Ok(BlobView {
      storage: Arc::clone(&slot.outer.storage),
      location: slot.outer.location,
      dtype: slot.dtype,
      len: slot.capacity,
    })
  }

  /// 零拷贝重定向：让该张量的外层绑定指向 `view` 的存储
  ///
  /// 元素类型与数量必须完全一致，布局不同时应先显式复制再借用。
  pub fn borrow_from(&mut self, name: &str, view: &BlobView) -> Result<(), BlobError> {
    let slot = self.slot_mut(name, "borrow_from")?;
    if slot.dtype != view.dtype {
      error!(
        "`borrow_from` 张量 {} 类型不一致: {:?} vs {:?}",
        name, slot.dtype, view.dtype
      );
      return Err(BlobError::TypeMismatch {
        name: name.to_string(),
        expected: slot.dtype,
        actual: view.dtype,
      });
    }
    if slot.capacity != view.len {
      error!(
        "`borrow_from` 张量 {} 元素数量不一致: {} vs {}",
        name, slot.capacity, view.len
      );
      return Err(BlobError::SizeMismatch {
        name: name.to_string(),
        expected: slot.capacity,
        actual: view.len,
      });
    }
    slot.outer = Binding {
      storage: Arc::clone(&view.storage),
      location: view.location,
      borrowed: true,
    };
    Ok(())
  }

  pub fn shape(&self, name: &str) -> Result<&[usize], BlobError> {
    Ok(&self.slot(name, "shape")?.shape)
  }

  /// 修改张量形状中的具体数值，维度数不可改变
  pub fn set_shape(&mut self, name: &str, dims: &[usize]) -> Result<(), BlobError> {
    let policy = self.policy;
    let slot = self.slot_mut(name, "set_shape")?;
    if policy == ShapePolicy::Static {
      warn!("`set_shape` 当前后端不支持动态形状 (张量 {})", name);
      return Err(BlobError::DynamicShapeUnsupported(name.to_string()));
    }
    if slot.shape.len() != dims.len() {
      error!(
        "`set_shape` 张量 {} 的形状无效: 请求 {:?}, 原始 {:?}",
        name, dims, slot.shape
      );
      return Err(BlobError::RankMismatch {
        name: name.to_string(),
        expected: slot.shape.len(),
        actual: dims.len(),
      });
    }
    let count: usize = dims.iter().product();
    if count > slot.capacity {
      error!(
        "`set_shape` 张量 {} 的形状 {:?} 超出容量 {}",
        name, dims, slot.capacity
      );
      return Err(BlobError::ExceedsCapacity {
        name: name.to_string(),
        shape: dims.to_vec(),
        capacity: slot.capacity,
      });
    }
    slot.shape = dims.to_vec();
    Ok(())
  }

  pub fn element_type(&self, name: &str) -> Result<ElementType, BlobError> {
    Ok(self.slot(name, "element_type")?.dtype)
  }

  /// 已分配的元素容量
  pub fn capacity(&self, name: &str) -> Result<usize, BlobError> {
    Ok(self.slot(name, "capacity")?.capacity)
  }

  /// 读取外层绑定指向的数据
  pub fn tensor(&self, name: &str) -> Result<RwLockReadGuard<'_, TensorData>, BlobError> {
    let slot = self.slot(name, "tensor")?;
    slot
      .outer
      .storage
      .read()
      .map_err(|_| BlobError::Poisoned(name.to_string()))
  }

  /// 写入外层绑定指向的数据
  pub fn tensor_mut(&self, name: &str) -> Result<RwLockWriteGuard<'_, TensorData>, BlobError> {
    let slot = self.slot(name, "tensor_mut")?;
    slot
      .outer
      .storage
      .write()
      .map_err(|_| BlobError::Poisoned(name.to_string()))
  }

  pub(crate) fn bind(&self, name: &str) -> Result<BoundTensor, BlobError> {
    let slot = self.slot(name, "bind")?;
    Ok(BoundTensor {
      name: name.to_string(),
      shape: slot.shape.clone(),
      location: slot.outer.location,
      storage: Arc::clone(&slot.outer.storage),
    })
  }

  pub(crate) fn set_bindings(&mut self, bindings: Bindings) {
    self.bindings = Some(bindings);
  }

  pub(crate) fn take_bindings(&mut self) -> Option<Bindings> {
    self.bindings.take()
  }

  pub(crate) fn set_pending(&mut self, handle: PendingInference) {
    if let Some(previous) = self.pending.replace(handle) {
      warn!("缓冲区上仍有未回收的异步推理任务，先行等待");
      match previous.join() {
        Ok(Err(e)) => warn!("被覆盖的后台推理失败: {}", e),
        Err(_) => error!("后台推理线程异常退出"),
        Ok(Ok(())) => {}
      }
    }
  }

  pub(crate) fn take_pending(&mut self) -> Option<PendingInference> {
    self.pending.take()
  }

  pub fn has_pending(&self) -> bool {
    self.pending.is_some()
  }

  /// 等待尚未回收的后台推理结束，结果被丢弃
  pub fn wait_pending(&mut self) {
    if let Some(handle) = self.pending.take() {
      if handle.join().is_err() {
        error!("后台推理线程异常退出");
      }
    }
  }

  /// 所有外层绑定指回自身分配并回到 HOST，不释放内存
  ///
  /// 写入途中崩溃留下的锁中毒标记也在这里清除，数据由下一次预处理覆盖。
  pub fn reset(&mut self) {
    self.bindings = None;
    for (name, slot) in self.slots.iter_mut() {
      if slot.inner.is_poisoned() {
        warn!("张量 {} 的锁在写入时崩溃, 复位时清除", name);
        slot.inner.clear_poison();
      }
      slot.outer = slot.own_binding(DataLocation::Host);
    }
  }

  /// 释放全部分配，可重复调用
  pub fn release(&mut self) {
    if self.released {
      return;
    }
    self.wait_pending();
    self.bindings = None;
    self.slots.clear();
    self.released = true;
  }

  pub fn is_released(&self) -> bool {
    self.released
  }
}

impl Drop for BlobBuffer {
  fn drop(&mut self) {
    self.wait_pending();
  }
}
