// 该文件是 Beifeng （北风） 项目的一部分。
// src/engine/rknpu_runtime.rs - RKNPU 硬件上下文
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

use std::sync::Mutex;

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};

use super::{EngineError, ModelIo, NpuRuntime, TensorDesc, TensorMut, TensorRef};
use crate::blob::ElementType;

/// `rknpu` 上下文，一次只允许一个调用者
///
/// 运行时只报告输入输出的数量，张量名称按 `input{i}` / `output{i}` 生成，
/// 形状需要在构造引擎时显式给出。
pub struct RknpuRuntime {
  context: Mutex<Context>,
  num_inputs: u32,
  num_outputs: u32,
}

impl From<rknpu::Error> for EngineError {
  fn from(err: rknpu::Error) -> Self {
    EngineError::Execution(format!("RKNN 错误: {}", err))
  }
}

impl NpuRuntime for RknpuRuntime {
  fn load(model: &[u8]) -> Result<Self, EngineError> {
    info!("创建 RKNN 推理上下文");
    let context = Context::new(model, InitFlags::default())
      .map_err(|e| EngineError::ContextInit(e.to_string()))?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!(" 查询 SDK 版本失败: {}", e);
        return Err(EngineError::ModelInvalid(format!("无法查询 SDK 版本: {}", e)));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| EngineError::ModelInvalid(format!("无法获取输入数量: {}", e)))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| EngineError::ModelInvalid(format!("无法获取输出数量: {}", e)))?;
    debug!("模型输入数量: {}", num_inputs);
    debug!("模型输出数量: {}", num_outputs);

    Ok(Self {
      context: Mutex::new(context),
      num_inputs,
      num_outputs,
    })
  }

  fn model_io(&self) -> Result<ModelIo, EngineError> {
    Ok(ModelIo {
      inputs: (0..self.num_inputs)
        .map(|i| TensorDesc::new(format!("input{}", i), Vec::new(), ElementType::U8))
        .collect(),
      outputs: (0..self.num_outputs)
        .map(|i| TensorDesc::new(format!("output{}", i), Vec::new(), ElementType::F32))
        .collect(),
    })
  }

  fn run(
    &self,
    inputs: &[TensorRef<'_>],
    outputs: &mut [TensorMut<'_>],
  ) -> Result<(), EngineError> {
    let context = self
      .context
      .lock()
      .map_err(|_| EngineError::Execution("RKNN 上下文锁已失效".to_string()))?;

    for (idx, input) in inputs.iter().enumerate() {
      let Some(bytes) = input.data.as_u8() else {
        error!("输入张量 {} 不是 u8 类型, 当前运行时只接受 u8 输入", input.name);
        return Err(EngineError::InvalidArgument(format!(
          "输入张量 {} 的类型不受支持",
          input.name
        )));
      };
      debug!("设置模型输入 {}", input.name);
      context.set_input(idx as u32, bytes, TensorFormat::NHWC, TensorType::UInt8)?;
    }

    debug!("执行模型推理");
    context.run()?;

    let output = context.get_outputs()?;
    for (idx, tensor) in outputs.iter_mut().enumerate() {
      let data = output.get_f32(idx)?;
      let Some(dst) = tensor.data.as_f32_mut() else {
        return Err(EngineError::InvalidArgument(format!(
          "输出张量 {} 不是 f32 类型",
          tensor.name
        )));
      };
      if data.len() != dst.len() {
        error!(
          "输出张量 {} 大小不匹配: 运行时 {}, 缓冲区 {}",
          tensor.name,
          data.len(),
          dst.len()
        );
        return Err(EngineError::incompatible(tensor.name, "输出大小与缓冲区不一致"));
      }
      dst.copy_from_slice(data);
    }
    Ok(())
  }
}
