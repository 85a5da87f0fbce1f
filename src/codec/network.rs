use ndarray::prelude::*;

use super::CodecConfig;
use super::layers::{Conv2d, ConvTranspose2d, ResidualBlock, silu};
use super::weights::ParamStore;
use crate::error::{Error, Result};

/// 编码器总下采样倍数
pub const DOWNSAMPLE: usize = 4;

pub(crate) const RESIDUAL_BLOCKS: usize = 2;

/// 编码器：两次步长为 2 的卷积下采样
///
/// 权重文件中还带有 `encoder.res.*` 和 `encoder.conv_out`，前向计算不经过它们，
/// 码本是在 `conv_in` 的输出上拟合的。加载时仍然严格检查这些参数。
#[derive(Debug, Clone)]
pub struct Encoder {
    down1: Conv2d,
    down2: Conv2d,
    embedding_dim: usize,
}

impl Encoder {
    pub(crate) fn from_params(params: &mut ParamStore, config: &CodecConfig) -> Result<Self> {
        let (h, d) = (config.hidden, config.embedding_dim);
        let half = h / 2;
        let encoder = Self {
            down1: conv(params, "encoder.conv_in.0", [half, 3, 4, 4], 2, 1)?,
            down2: conv(params, "encoder.conv_in.2", [h, half, 4, 4], 2, 1)?,
            embedding_dim: d,
        };
        residual_blocks(params, "encoder.res", h)?;
        conv(params, "encoder.conv_out", [d, h, 1, 1], 1, 0)?;
        Ok(encoder)
    }

    /// 输入 (3, H, W)，输出 (hidden, H/4, W/4)
    ///
    /// hidden 与码本维度 D 不一致时无法量化，返回 [`Error::ShapeMismatch`]
    pub fn forward(&self, x: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (c, h, w) = x.dim();
        // 空间尺寸必须能被下采样倍数整除，否则解码结果与输入尺寸对不上
        if c != 3 || h == 0 || w == 0 || h % DOWNSAMPLE != 0 || w % DOWNSAMPLE != 0 {
            return Err(Error::shape("encoder input", &[3, h - h % DOWNSAMPLE, w - w % DOWNSAMPLE], &[c, h, w]));
        }
        let hidden = self.down2.out_channels();
        if hidden != self.embedding_dim {
            let (lh, lw) = (h / DOWNSAMPLE, w / DOWNSAMPLE);
            return Err(Error::shape("encoder output", &[self.embedding_dim, lh, lw], &[hidden, lh, lw]));
        }
        let mut z = self.down1.forward(x)?;
        z.mapv_inplace(silu);
        let mut z = self.down2.forward(z.view())?;
        z.mapv_inplace(silu);
        Ok(z)
    }
}

/// 解码器：1x1 卷积，残差块，两次转置卷积上采样，tanh 输出到 [-1, 1]
#[derive(Debug, Clone)]
pub struct Decoder {
    proj: Conv2d,
    res: Vec<ResidualBlock>,
    up1: ConvTranspose2d,
    up2: ConvTranspose2d,
}

impl Decoder {
    pub(crate) fn from_params(params: &mut ParamStore, config: &CodecConfig) -> Result<Self> {
        let (h, d) = (config.hidden, config.embedding_dim);
        let half = h / 2;
        Ok(Self {
            proj: conv(params, "decoder.conv_in", [h, d, 1, 1], 1, 0)?,
            res: residual_blocks(params, "decoder.res", h)?,
            up1: conv_transpose(params, "decoder.ups.0", [h, half, 4, 4])?,
            up2: conv_transpose(params, "decoder.ups.2", [half, 3, 4, 4])?,
        })
    }

    /// 输入 (D, h, w)，输出 (3, 4h, 4w)
    pub fn forward(&self, z: ArrayView3<f32>) -> Result<Array3<f32>> {
        let mut x = self.proj.forward(z)?;
        for block in &self.res {
            x = block.forward(x.view())?;
        }
        let mut x = self.up1.forward(x.view())?;
        x.mapv_inplace(silu);
        let mut x = self.up2.forward(x.view())?;
        x.mapv_inplace(f32::tanh);
        Ok(x)
    }
}

fn conv(params: &mut ParamStore, name: &str, shape: [usize; 4], stride: usize, padding: usize) -> Result<Conv2d> {
    let weight = params.take4(&format!("{name}.weight"), shape)?;
    let bias = params.take1(&format!("{name}.bias"), shape[0])?;
    Conv2d::new(weight, bias, stride, padding)
}

fn conv_transpose(params: &mut ParamStore, name: &str, shape: [usize; 4]) -> Result<ConvTranspose2d> {
    let weight = params.take4(&format!("{name}.weight"), shape)?;
    let bias = params.take1(&format!("{name}.bias"), shape[1])?;
    ConvTranspose2d::new(weight, bias, 2, 1)
}

fn residual_blocks(params: &mut ParamStore, prefix: &str, channels: usize) -> Result<Vec<ResidualBlock>> {
    (0..RESIDUAL_BLOCKS)
        .map(|i| {
            let shape = [channels, channels, 3, 3];
            Ok(ResidualBlock {
                conv1: conv(params, &format!("{prefix}.{i}.net.0"), shape, 1, 1)?,
                conv2: conv(params, &format!("{prefix}.{i}.net.3"), shape, 1, 1)?,
            })
        })
        .collect()
}
