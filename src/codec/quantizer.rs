use ndarray::prelude::*;
use rayon::prelude::*;

use crate::error::{Error, Result};

/// 码本：N 个 D 维向量，连续存储为 (N, D)
#[derive(Debug, Clone, PartialEq)]
pub struct Codebook {
    embeddings: Array2<f32>,
}

impl Codebook {
    pub fn new(embeddings: Array2<f32>) -> Self {
        Self { embeddings }
    }

    /// 码本向量数量 N
    pub fn len(&self) -> usize {
        self.embeddings.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 码本向量维度 D
    pub fn dim(&self) -> usize {
        self.embeddings.ncols()
    }

    pub fn embeddings(&self) -> ArrayView2<'_, f32> {
        self.embeddings.view()
    }

    pub fn entry(&self, index: usize) -> ArrayView1<'_, f32> {
        self.embeddings.row(index)
    }

    /// 返回距离最近的码本下标及其平方欧氏距离
    ///
    /// 距离相同时保留下标较小者
    pub fn nearest(&self, v: ArrayView1<f32>) -> (usize, f32) {
        let mut best = (0, f32::INFINITY);
        for (i, e) in self.embeddings.outer_iter().enumerate() {
            let d = squared_distance(v, e);
            if d < best.1 {
                best = (i, d);
            }
        }
        best
    }
}

#[inline]
fn squared_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// 量化器的完整状态快照：码本 + EMA 统计量
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizerState {
    pub codebook: Codebook,
    /// 每个码本向量被分配到的（滑动平均）次数，长度 N
    pub cluster_size: Array1<f32>,
    /// 分配到每个码本向量的特征之和的滑动平均，(N, D)
    pub embed_avg: Array2<f32>,
}

impl QuantizerState {
    /// 以给定码本初始化，统计量按未训练状态填充
    pub fn from_codebook(codebook: Codebook) -> Self {
        let n = codebook.len();
        let embed_avg = codebook.embeddings.clone();
        Self { codebook, cluster_size: Array1::zeros(n), embed_avg }
    }

    fn check(&self, n: usize, d: usize) -> Result<()> {
        let actual = [self.codebook.len(), self.codebook.dim()];
        if actual != [n, d] {
            return Err(Error::shape("codebook", &[n, d], &actual));
        }
        if self.cluster_size.len() != n {
            return Err(Error::shape("cluster_size", &[n], &[self.cluster_size.len()]));
        }
        if self.embed_avg.dim() != (n, d) {
            return Err(Error::shape("embed_avg", &[n, d], self.embed_avg.shape()));
        }
        Ok(())
    }
}

/// 一次量化的结果
#[derive(Debug, Clone)]
pub struct Quantization {
    /// (D, H, W)，每个位置都是某个码本向量的精确拷贝
    pub quantized: Array3<f32>,
    /// (H, W)
    pub indices: Array2<usize>,
}

#[derive(Debug, Clone)]
pub struct Quantizer {
    state: QuantizerState,
    commitment_cost: f32,
    decay: f32,
    eps: f32,
    learning: bool,
}

impl Quantizer {
    pub fn new(state: QuantizerState, commitment_cost: f32, decay: f32, eps: f32) -> Self {
        Self { state, commitment_cost, decay, eps, learning: false }
    }

    pub fn codebook(&self) -> &Codebook {
        &self.state.codebook
    }

    pub fn state(&self) -> &QuantizerState {
        &self.state
    }

    pub fn is_learning(&self) -> bool {
        self.learning
    }

    pub fn set_learning(&mut self, learning: bool) {
        self.learning = learning;
    }

    /// 将 (D, H, W) 的特征逐位置替换为最近的码本向量
    pub fn quantize(&self, z: ArrayView3<f32>) -> Result<Quantization> {
        let (d, h, w) = z.dim();
        if d != self.codebook().dim() {
            return Err(Error::shape("quantizer input", &[self.codebook().dim(), h, w], &[d, h, w]));
        }
        let flat = z.as_standard_layout().into_owned().into_shape_with_order((d, h * w))?;
        let samples = flat.t();

        let codebook = self.codebook();
        let indices: Vec<usize> =
            (0..h * w).into_par_iter().map(|p| codebook.nearest(samples.row(p)).0).collect();

        let mut quantized = Array2::<f32>::zeros((d, h * w));
        for (p, &i) in indices.iter().enumerate() {
            quantized.column_mut(p).assign(&codebook.entry(i));
        }

        Ok(Quantization {
            quantized: quantized.into_shape_with_order((d, h, w))?,
            indices: Array2::from_shape_vec((h, w), indices)?,
        })
    }

    /// commitment_cost * mse(quantized, z)，quantized 视为常量
    pub fn commitment_loss(&self, quantized: ArrayView3<f32>, z: ArrayView3<f32>) -> f32 {
        let mse = (&quantized - &z).mapv(|x| x * x).mean().unwrap_or(0.0);
        self.commitment_cost * mse
    }

    /// 基于当前状态计算一次 EMA 更新，返回新快照，不修改自身
    pub fn ema_step(&self, samples: ArrayView2<f32>, indices: &[usize]) -> Result<QuantizerState> {
        ema_update(&self.state, samples, indices, self.decay, self.eps)
    }

    /// 用新快照替换当前状态，仅在学习模式下允许
    pub fn commit(&mut self, state: QuantizerState) -> Result<()> {
        if !self.learning {
            return Err(Error::InvalidMode);
        }
        state.check(self.codebook().len(), self.codebook().dim())?;
        self.state = state;
        Ok(())
    }
}

/// EMA 码本更新
///
/// - samples: (M, D) 的特征向量
/// - indices: 每个特征分配到的码本下标，长度 M
///
/// 统计量先做指数滑动平均，再对 cluster_size 做拉普拉斯平滑，避免使用次数接近 0 的
/// 码本向量出现除零
pub fn ema_update(
    state: &QuantizerState,
    samples: ArrayView2<f32>,
    indices: &[usize],
    decay: f32,
    eps: f32,
) -> Result<QuantizerState> {
    let (n, d) = (state.codebook.len(), state.codebook.dim());
    if samples.ncols() != d || samples.nrows() != indices.len() {
        return Err(Error::shape("ema samples", &[indices.len(), d], samples.shape()));
    }
    if indices.is_empty() {
        return Ok(state.clone());
    }

    let mut counts = Array1::<f32>::zeros(n);
    let mut sums = Array2::<f32>::zeros((n, d));
    for (row, &i) in samples.outer_iter().zip(indices) {
        if i >= n {
            return Err(Error::shape("codebook index", &[n], &[i]));
        }
        counts[i] += 1.0;
        let mut sum = sums.row_mut(i);
        sum += &row;
    }

    let cluster_size = &state.cluster_size * decay + &counts * (1.0 - decay);
    let embed_avg = &state.embed_avg * decay + &sums * (1.0 - decay);

    let total = cluster_size.sum();
    let smoothed = cluster_size.mapv(|c| (c + eps) / (total + n as f32 * eps) * total);
    let embeddings = &embed_avg / &smoothed.view().insert_axis(Axis(1));

    Ok(QuantizerState { codebook: Codebook::new(embeddings), cluster_size, embed_avg })
}

/// 直通估计器
///
/// 前向取值为 `input + (quantized - input)`，差值项视为常量；
/// 反向时梯度原样传回编码器，如同量化是恒等映射
#[derive(Debug, Clone)]
pub struct StraightThrough {
    input: Array3<f32>,
    quantized: Array3<f32>,
}

impl StraightThrough {
    pub fn new(input: Array3<f32>, quantized: Array3<f32>) -> Result<Self> {
        if input.dim() != quantized.dim() {
            return Err(Error::shape("straight-through", input.shape(), quantized.shape()));
        }
        Ok(Self { input, quantized })
    }

    pub fn value(&self) -> Array3<f32> {
        let detached = &self.quantized - &self.input;
        &self.input + &detached
    }

    pub fn backward(&self, grad_output: ArrayView3<f32>) -> Result<Array3<f32>> {
        if grad_output.dim() != self.input.dim() {
            return Err(Error::shape("straight-through grad", self.input.shape(), grad_output.shape()));
        }
        Ok(grad_output.to_owned())
    }

    pub fn quantized(&self) -> &Array3<f32> {
        &self.quantized
    }
}

/// 码本使用情况
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CodebookUsage {
    /// 被使用过的不同码本向量数量
    pub used: usize,
    pub total: usize,
    /// 下标分布的困惑度，均匀使用全部码本时等于 N
    pub perplexity: f32,
}

impl CodebookUsage {
    pub fn from_indices(indices: &[usize], total: usize) -> Self {
        let mut hist = vec![0usize; total];
        for &i in indices {
            if i < total {
                hist[i] += 1;
            }
        }
        let n = indices.len().max(1) as f32;
        let entropy: f32 = hist
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = c as f32 / n;
                -p * p.ln()
            })
            .sum();
        Self { used: hist.iter().filter(|&&c| c > 0).count(), total, perplexity: entropy.exp() }
    }
}
