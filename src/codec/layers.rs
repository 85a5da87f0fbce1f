use ndarray::prelude::*;

use crate::error::{Error, Result};

#[inline(always)]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// 二维卷积，权重布局与 PyTorch 一致：(out, in, k, k)
///
/// 权重在构造时展平为 (out, in * k * k)，前向计算走 im2col + 矩阵乘
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Array2<f32>,
    bias: Array1<f32>,
    in_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    pub fn new(weight: Array4<f32>, bias: Array1<f32>, stride: usize, padding: usize) -> Result<Self> {
        let (out, inc, kh, kw) = weight.dim();
        if kh != kw {
            return Err(Error::shape("conv kernel", &[kh, kh], &[kh, kw]));
        }
        if bias.len() != out {
            return Err(Error::shape("conv bias", &[out], &[bias.len()]));
        }
        let weight = weight.as_standard_layout().into_owned().into_shape_with_order((out, inc * kh * kw))?;
        Ok(Self { weight, bias, in_channels: inc, kernel: kh, stride, padding })
    }

    pub fn out_channels(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (c, h, w) = x.dim();
        if c != self.in_channels {
            return Err(Error::shape("conv input", &[self.in_channels, h, w], &[c, h, w]));
        }
        let (k, s, p) = (self.kernel, self.stride, self.padding);
        if h + 2 * p < k || w + 2 * p < k {
            return Err(Error::shape("conv input", &[c, k, k], &[c, h, w]));
        }
        let oh = (h + 2 * p - k) / s + 1;
        let ow = (w + 2 * p - k) / s + 1;

        let cols = im2col(x, k, s, p, oh, ow);
        let mut out = self.weight.dot(&cols);
        out += &self.bias.view().insert_axis(Axis(1));
        Ok(out.into_shape_with_order((self.out_channels(), oh, ow))?)
    }
}

/// 转置卷积，权重布局与 PyTorch 一致：(in, out, k, k)
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    /// (out * k * k, in)
    weight: Array2<f32>,
    bias: Array1<f32>,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
}

impl ConvTranspose2d {
    pub fn new(weight: Array4<f32>, bias: Array1<f32>, stride: usize, padding: usize) -> Result<Self> {
        let (inc, out, kh, kw) = weight.dim();
        if kh != kw {
            return Err(Error::shape("conv_transpose kernel", &[kh, kh], &[kh, kw]));
        }
        if bias.len() != out {
            return Err(Error::shape("conv_transpose bias", &[out], &[bias.len()]));
        }
        let weight = weight
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((inc, out * kh * kw))?
            .reversed_axes()
            .as_standard_layout()
            .into_owned();
        Ok(Self { weight, bias, in_channels: inc, out_channels: out, kernel: kh, stride, padding })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward(&self, x: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (c, h, w) = x.dim();
        if c != self.in_channels {
            return Err(Error::shape("conv_transpose input", &[self.in_channels, h, w], &[c, h, w]));
        }
        let (k, s, p) = (self.kernel, self.stride, self.padding);
        if h == 0 || w == 0 || (h - 1) * s + k <= 2 * p || (w - 1) * s + k <= 2 * p {
            return Err(Error::shape("conv_transpose input", &[c, 1, 1], &[c, h, w]));
        }
        let oh = (h - 1) * s + k - 2 * p;
        let ow = (w - 1) * s + k - 2 * p;

        let flat = x.as_standard_layout().into_owned().into_shape_with_order((c, h * w))?;
        let cols = self.weight.dot(&flat);

        let mut out = Array3::<f32>::zeros((self.out_channels, oh, ow));
        for co in 0..self.out_channels {
            let mut plane = out.index_axis_mut(Axis(0), co);
            for ky in 0..k {
                for kx in 0..k {
                    let row = cols.row((co * k + ky) * k + kx);
                    for iy in 0..h {
                        let oy = (iy * s + ky) as isize - p as isize;
                        if oy < 0 || oy >= oh as isize {
                            continue;
                        }
                        for ix in 0..w {
                            let ox = (ix * s + kx) as isize - p as isize;
                            if ox < 0 || ox >= ow as isize {
                                continue;
                            }
                            plane[[oy as usize, ox as usize]] += row[iy * w + ix];
                        }
                    }
                }
            }
            plane += self.bias[co];
        }
        Ok(out)
    }
}

/// x + conv2(silu(conv1(x)))，Dropout 在推理时为恒等映射
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub(crate) conv1: Conv2d,
    pub(crate) conv2: Conv2d,
}

impl ResidualBlock {
    pub fn forward(&self, x: ArrayView3<f32>) -> Result<Array3<f32>> {
        let mut h = self.conv1.forward(x)?;
        h.mapv_inplace(silu);
        let mut h = self.conv2.forward(h.view())?;
        if h.dim() != x.dim() {
            return Err(Error::shape("residual", x.shape(), h.shape()));
        }
        h += &x;
        Ok(h)
    }
}

fn im2col(x: ArrayView3<f32>, k: usize, stride: usize, pad: usize, oh: usize, ow: usize) -> Array2<f32> {
    let (c, h, w) = x.dim();
    let mut cols = Array2::<f32>::zeros((c * k * k, oh * ow));
    for ci in 0..c {
        for ky in 0..k {
            for kx in 0..k {
                let mut dst = cols.row_mut((ci * k + ky) * k + kx);
                for oy in 0..oh {
                    let iy = (oy * stride + ky) as isize - pad as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for ox in 0..ow {
                        let ix = (ox * stride + kx) as isize - pad as isize;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        dst[oy * ow + ox] = x[[ci, iy as usize, ix as usize]];
                    }
                }
            }
        }
    }
    cols
}
