//! 向量量化自编码器
//!
//! ```text
//! (3, R, R) ─ Encoder ─> (D, R/4, R/4) ─ Quantizer ─> 码本向量 + 下标 ─ Decoder ─> (3, R, R)
//! ```
//!
//! 网络参数和码本在加载后只读，可以在多个线程间共享；
//! 码本的 EMA 更新需要 `&mut`，同一时间只允许一个写者。

mod layers;
mod network;
mod quantizer;
mod weights;

use std::io::{Read, Seek};
use std::path::Path;

use log::{error, info};
use ndarray::prelude::*;
use serde::Serialize;

pub use layers::{Conv2d, ConvTranspose2d, ResidualBlock};
pub use network::{DOWNSAMPLE, Decoder, Encoder};
pub use quantizer::{
    Codebook, CodebookUsage, Quantization, Quantizer, QuantizerState, StraightThrough, ema_update,
};
pub use weights::{SECTIONS, WeightsLayout, parameter_shapes};

use crate::error::{Error, Result};

/// 编解码器结构参数，构造后不再改变
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CodecConfig {
    /// 码本大小 N
    pub num_embeddings: usize,
    /// 码本向量维度 D
    pub embedding_dim: usize,
    /// 卷积隐藏通道数
    pub hidden: usize,
    /// 工作分辨率，输入统一缩放到 R x R
    pub resolution: usize,
    pub commitment_cost: f32,
    pub decay: f32,
    pub eps: f32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            num_embeddings: 1024,
            embedding_dim: 256,
            hidden: 256,
            resolution: 64,
            commitment_cost: 0.25,
            decay: 0.99,
            eps: 1e-5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    /// 只读推理，加载成功后的默认模式
    Inference,
    /// 允许 EMA 更新码本
    Learning,
}

#[derive(Debug, Clone)]
pub(crate) struct VqModel {
    pub(crate) encoder: Encoder,
    pub(crate) decoder: Decoder,
    pub(crate) quantizer: Quantizer,
}

/// `encode` 的结果
#[derive(Debug, Clone)]
pub struct Encoded {
    pub quantized: Array3<f32>,
    pub indices: Array2<usize>,
}

/// `forward` 的结果
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// 与输入同形状，取值范围 [-1, 1]
    pub image: Array3<f32>,
    pub commitment_loss: f32,
    pub indices: Array2<usize>,
}

/// 学习模式下的前向结果，额外保留直通估计器以便反向传播
#[derive(Debug, Clone)]
pub struct LearningForward {
    pub reconstruction: Reconstruction,
    pub straight_through: StraightThrough,
}

/// 向量量化编解码器，未加载权重时任何推理调用都返回 [`Error::ModelNotLoaded`]
#[derive(Debug, Clone)]
pub struct VqCodec {
    config: CodecConfig,
    model: Option<VqModel>,
    layout: Option<WeightsLayout>,
}

impl VqCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config, model: None, layout: None }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// 最近一次成功加载的权重布局
    pub fn layout(&self) -> Option<WeightsLayout> {
        self.layout
    }

    pub fn mode(&self) -> Option<Mode> {
        self.model.as_ref().map(|m| if m.quantizer.is_learning() { Mode::Learning } else { Mode::Inference })
    }

    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        let model = self.model.as_mut().ok_or(Error::ModelNotLoaded)?;
        model.quantizer.set_learning(mode == Mode::Learning);
        Ok(())
    }

    /// 从文件加载权重，失败时记录日志并返回 false，已有状态保持不变
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> bool {
        let path = path.as_ref();
        match self.try_load(path) {
            Ok(()) => {
                info!("VQ 模型加载成功: {}", path.display());
                true
            }
            Err(e) => {
                error!("VQ 模型加载失败 {}: {e}", path.display());
                false
            }
        }
    }

    pub fn try_load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let (layout, model) = weights::load_model_file(path.as_ref(), &self.config)?;
        self.install(layout, model);
        Ok(())
    }

    pub fn try_load_from<R: Read + Seek>(&mut self, reader: R) -> Result<()> {
        let (layout, model) = weights::load_model(reader, &self.config)?;
        self.install(layout, model);
        Ok(())
    }

    fn install(&mut self, layout: WeightsLayout, model: VqModel) {
        // 新加载的模型总是处于推理模式
        self.model = Some(model);
        self.layout = Some(layout);
    }

    fn model(&self) -> Result<&VqModel> {
        self.model.as_ref().ok_or(Error::ModelNotLoaded)
    }

    pub fn quantizer(&self) -> Result<&Quantizer> {
        Ok(&self.model()?.quantizer)
    }

    /// 编码并量化，返回量化后的特征 (D, R/4, R/4) 和下标网格
    pub fn encode(&self, x: ArrayView3<f32>) -> Result<Encoded> {
        let model = self.model()?;
        let z = model.encoder.forward(x)?;
        let q = model.quantizer.quantize(z.view())?;
        Ok(Encoded { quantized: q.quantized, indices: q.indices })
    }

    pub fn decode(&self, quantized: ArrayView3<f32>) -> Result<Array3<f32>> {
        let model = self.model()?;
        let d = self.config.embedding_dim;
        if quantized.dim().0 != d {
            let (_, h, w) = quantized.dim();
            return Err(Error::shape("decoder input", &[d, h, w], quantized.shape()));
        }
        model.decoder.forward(quantized)
    }

    pub fn forward(&self, x: ArrayView3<f32>) -> Result<Reconstruction> {
        let model = self.model()?;
        let z = model.encoder.forward(x)?;
        let q = model.quantizer.quantize(z.view())?;
        let commitment_loss = model.quantizer.commitment_loss(q.quantized.view(), z.view());
        let image = model.decoder.forward(q.quantized.view())?;
        if image.dim() != x.dim() {
            return Err(Error::shape("reconstruction", x.shape(), image.shape()));
        }
        Ok(Reconstruction { image, commitment_loss, indices: q.indices })
    }

    /// 与 `forward` 相同，但解码器消费的是直通估计器的输出
    pub fn forward_learning(&self, x: ArrayView3<f32>) -> Result<LearningForward> {
        let model = self.model()?;
        let z = model.encoder.forward(x)?;
        let q = model.quantizer.quantize(z.view())?;
        let commitment_loss = model.quantizer.commitment_loss(q.quantized.view(), z.view());
        let straight_through = StraightThrough::new(z, q.quantized)?;
        let image = model.decoder.forward(straight_through.value().view())?;
        if image.dim() != x.dim() {
            return Err(Error::shape("reconstruction", x.shape(), image.shape()));
        }
        Ok(LearningForward {
            reconstruction: Reconstruction { image, commitment_loss, indices: q.indices },
            straight_through,
        })
    }

    /// 对一批输入执行一次 EMA 码本更新，返回本批次的平均 commitment loss
    ///
    /// 仅在 [`Mode::Learning`] 下可用
    pub fn update_codebook(&mut self, batch: &[ArrayView3<f32>]) -> Result<f32> {
        let model = self.model.as_ref().ok_or(Error::ModelNotLoaded)?;
        if !model.quantizer.is_learning() {
            return Err(Error::InvalidMode);
        }

        let d = self.config.embedding_dim;
        let mut samples = Vec::new();
        let mut indices = Vec::new();
        let mut loss = 0.0;
        for x in batch {
            let z = model.encoder.forward(*x)?;
            let q = model.quantizer.quantize(z.view())?;
            loss += model.quantizer.commitment_loss(q.quantized.view(), z.view());
            // (D, H, W) -> (H * W, D)
            let hw = z.dim().1 * z.dim().2;
            let flat = z.into_shape_with_order((d, hw))?;
            samples.extend(flat.t().iter().copied());
            indices.extend(q.indices.iter().copied());
        }
        let samples = Array2::from_shape_vec((indices.len(), d), samples)?;
        let next = model.quantizer.ema_step(samples.view(), &indices)?;

        let model = self.model.as_mut().ok_or(Error::ModelNotLoaded)?;
        model.quantizer.commit(next)?;
        Ok(if batch.is_empty() { 0.0 } else { loss / batch.len() as f32 })
    }
}
