// 该文件是 Beifeng （北风） 项目的一部分。
// src/engine/gpu.rs - GPU 推理引擎
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

use tracing::{error, info};
use url::Url;

use super::{
  Bindings, EngineError, EngineKind, InferenceEngine, Session, SessionOptions, TensorLayout,
  bind_session_tensors, check_override_names, read_model, parse_shape_query, resolve_specs,
};
use crate::blob::{BlobBuffer, DataLocation, ShapePolicy, TensorSpec};
use crate::{FromUrl, FromUrlWithScheme};

const GPU_SCHEME: &str = "gpu";

/// GPU 引擎：`inference` 只负责把工作排入设备队列，`postprocess` 等待设备完成
///
/// 位于设备端的输入张量直接交给后端使用。`inference` 之后输出标记为设备端，
/// 同步成功后才回到主机端。
pub struct GpuEngine<S: Session> {
  session: S,
  name: String,
  inputs: Vec<TensorSpec>,
  outputs: Vec<TensorSpec>,
}

impl<S: Session> GpuEngine<S> {
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
    info!(
      "GPU 引擎 {} 初始化完成, 输入 {} 个, 输出 {} 个",
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

impl<S: Session> InferenceEngine for GpuEngine<S> {
  fn kind(&self) -> EngineKind {
    EngineKind::Gpu
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
    bind_session_tensors(&self.name, blobs, &self.inputs, &self.outputs, true)
  }

  fn inference(&self, blobs: &mut BlobBuffer) -> Result<(), EngineError> {
    let bindings = match blobs.take_bindings() {
      Some(bindings) => bindings,
      None => Bindings::collect(blobs, &self.inputs, &self.outputs)?,
    };
    bindings
      .with_tensors(|inputs, outputs| self.session.run(inputs, outputs))?
      .inspect_err(|e| error!("{}: 提交推理失败: {}", self.name, e))?;
    // 设备完成之前输出只在设备端有效
    for spec in &self.outputs {
      blobs.set_buffer_location(&spec.name, DataLocation::Device)?;
    }
    Ok(())
  }

  fn postprocess(&self, blobs: &mut BlobBuffer) -> Result<(), EngineError> {
    self
      .session
      .synchronize()
      .inspect_err(|e| error!("{}: 等待设备完成失败: {}", self.name, e))?;
    for spec in &self.outputs {
      blobs.set_buffer_location(&spec.name, DataLocation::Host)?;
    }
    Ok(())
  }
}

pub struct GpuEngineBuilder<S> {
  model_path: String,
  shapes: HashMap<String, Vec<usize>>,
  _session: PhantomData<fn() -> S>,
}

impl<S: Session> FromUrl for GpuEngineBuilder<S> {
  type Error = EngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != GPU_SCHEME {
      return Err(EngineError::ModelPath(format!(
        "模型路径必须使用 {} 方案",
        GPU_SCHEME
      )));
    }
    if url.path().is_empty() {
      return Err(EngineError::ModelPath("模型路径为空".to_string()));
    }

    Ok(GpuEngineBuilder {
      model_path: url.path().to_string(),
      shapes: parse_shape_query(url)?,
      _session: PhantomData,
    })
  }
}

impl<S: Session> FromUrlWithScheme for GpuEngineBuilder<S> {
  const SCHEME: &'static str = GPU_SCHEME;
}

impl<S: Session> GpuEngineBuilder<S> {
  pub fn shape(mut self, name: &str, dims: &[usize]) -> Self {
    self.shapes.insert(name.to_string(), dims.to_vec());
    self
  }

  pub fn build(self) -> Result<GpuEngine<S>, EngineError> {
    let model = read_model(&self.model_path)?;
    info!("反序列化 GPU 引擎");
    let session = S::load(&model, &SessionOptions::default())?;
    GpuEngine::from_session(self.model_path, session, &self.shapes)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;
  use std::sync::atomic::{AtomicBool, Ordering};

  use super::*;
  use crate::blob::ElementType;
  use crate::engine::{ModelIo, TensorDesc, TensorMut, TensorRef};

  /// 把输入加一，完成与否由 `synchronize` 决定
  #[derive(Default)]
  struct Queued {
    broken: AtomicBool,
    seen: Mutex<Vec<DataLocation>>,
  }

  impl Session for Queued {
    fn load(_model: &[u8], _options: &SessionOptions) -> Result<Self, EngineError> {
      Ok(Queued::default())
    }

    fn model_io(&self) -> ModelIo {
      ModelIo {
        inputs: vec![TensorDesc::new("x", vec![1, 4], ElementType::F32)],
        outputs: vec![TensorDesc::new("y", vec![1, 4], ElementType::F32)],
      }
    }

    fn run(
      &self,
      inputs: &[TensorRef<'_>],
      outputs: &mut [TensorMut<'_>],
    ) -> Result<(), EngineError> {
      self.seen.lock().unwrap().push(inputs[0].location);
      let (Some(x), Some(y)) = (inputs[0].data.as_f32(), outputs[0].data.as_f32_mut()) else {
        return Err(EngineError::InvalidArgument("需要 f32".to_string()));
      };
      for (o, i) in y.iter_mut().zip(x) {
        *o = i + 1.0;
      }
      Ok(())
    }

    fn synchronize(&self) -> Result<(), EngineError> {
      if self.broken.load(Ordering::SeqCst) {
        return Err(EngineError::Execution("设备丢失".to_string()));
      }
      Ok(())
    }
  }

  #[test]
  fn builder_reads_url() {
    let url = Url::parse("gpu:///models/m.engine?shape.x=1x4").unwrap();
    let builder = GpuEngineBuilder::<Queued>::from_url(&url).unwrap();
    assert_eq!(builder.model_path, "/models/m.engine");
    assert_eq!(builder.shapes["x"], vec![1, 4]);
    assert_eq!(GpuEngineBuilder::<Queued>::SCHEME, "gpu");

    let url = Url::parse("cpu:///models/m.engine").unwrap();
    assert!(matches!(
      GpuEngineBuilder::<Queued>::from_url(&url),
      Err(EngineError::ModelPath(_))
    ));
  }

  #[test]
  fn outputs_stay_on_device_until_synchronized() {
    let engine = GpuEngine::from_session("q", Queued::default(), &HashMap::new()).unwrap();
    let mut blobs = engine.alloc_blobs_buffer();
    blobs.set_buffer_location("x", DataLocation::Device).unwrap();

    engine.preprocess(&mut blobs).unwrap();
    engine.inference(&mut blobs).unwrap();
    assert_eq!(blobs.location("y").unwrap(), DataLocation::Device);

    engine.postprocess(&mut blobs).unwrap();
    assert_eq!(blobs.location("y").unwrap(), DataLocation::Host);
    assert_eq!(blobs.tensor("y").unwrap().as_f32().unwrap(), &[1.0; 4]);
    // 设备端输入原样交给后端
    assert_eq!(*engine.session().seen.lock().unwrap(), vec![DataLocation::Device]);
  }

  #[test]
  fn synchronize_failure_surfaces_in_postprocess() {
    let engine = GpuEngine::from_session("q", Queued::default(), &HashMap::new()).unwrap();
    engine.session().broken.store(true, Ordering::SeqCst);
    let mut blobs = engine.alloc_blobs_buffer();

    engine.preprocess(&mut blobs).unwrap();
    engine.inference(&mut blobs).unwrap();
    assert!(matches!(
      engine.postprocess(&mut blobs),
      Err(EngineError::Execution(_))
    ));
    assert_eq!(blobs.location("y").unwrap(), DataLocation::Device);
    assert!(engine.sync_infer(&mut blobs).is_err());
  }
}
