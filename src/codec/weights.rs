use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use log::debug;
use ndarray::prelude::*;
use ndarray_npy::NpzReader;

use super::network::{Decoder, Encoder, RESIDUAL_BLOCKS};
use super::quantizer::{Codebook, Quantizer, QuantizerState};
use super::{CodecConfig, VqModel};
use crate::error::{Error, Result};

/// 权重文件中的三个分区
pub const SECTIONS: [&str; 3] = ["encoder", "decoder", "quantizer"];

/// 权重文件布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum WeightsLayout {
    /// `encoder/<param>`、`decoder/<param>`、`quantizer/<param>` 三个命名分区
    Sectioned,
    /// 整个模型的 state dict：`encoder.<param>` 等
    Flat,
}

/// 以规范名（`encoder.conv_in.0.weight`）索引的参数表，取出即移除
pub(crate) struct ParamStore {
    params: HashMap<String, ArrayD<f32>>,
}

impl ParamStore {
    fn take(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>> {
        let array = self.params.remove(name).ok_or_else(|| Error::Weights(format!("缺少参数 {name}")))?;
        if array.shape() != shape {
            return Err(Error::Weights(format!(
                "参数 {name} 形状不匹配: 期望 {shape:?}, 实际 {:?}",
                array.shape()
            )));
        }
        Ok(array)
    }

    pub(crate) fn take1(&mut self, name: &str, len: usize) -> Result<Array1<f32>> {
        Ok(self.take(name, &[len])?.into_dimensionality()?)
    }

    pub(crate) fn take2(&mut self, name: &str, shape: [usize; 2]) -> Result<Array2<f32>> {
        Ok(self.take(name, &shape)?.into_dimensionality()?)
    }

    pub(crate) fn take4(&mut self, name: &str, shape: [usize; 4]) -> Result<Array4<f32>> {
        Ok(self.take(name, &shape)?.into_dimensionality()?)
    }

    /// 所有参数都应当已被取走，多余的参数视为结构不匹配
    fn finish(self) -> Result<()> {
        if self.params.is_empty() {
            return Ok(());
        }
        let mut names: Vec<_> = self.params.into_keys().collect();
        names.sort();
        Err(Error::Weights(format!("多余的参数: {}", names.join(", "))))
    }
}

/// 读取 npz 中的全部数组，返回布局和规范名参数表
fn read_params<R: Read + Seek>(reader: R) -> Result<(WeightsLayout, ParamStore)> {
    let mut npz = NpzReader::new(reader)?;
    let names = npz.names()?;

    let keys: Vec<(String, String)> = names
        .into_iter()
        .map(|name| {
            let key = name.strip_suffix(".npy").unwrap_or(&name).to_owned();
            (name, key)
        })
        .collect();

    let layout = if keys.iter().any(|(_, key)| key.starts_with("encoder/")) {
        WeightsLayout::Sectioned
    } else {
        WeightsLayout::Flat
    };

    let mut params = HashMap::with_capacity(keys.len());
    for (name, key) in keys {
        let canonical = match layout {
            WeightsLayout::Sectioned => match key.split_once('/') {
                Some((section, param)) if SECTIONS.contains(&section) => format!("{section}.{param}"),
                _ => return Err(Error::Weights(format!("无法识别的分区: {key}"))),
            },
            WeightsLayout::Flat => key,
        };
        let array: ArrayD<f32> = npz.by_name(&name)?;
        if params.insert(canonical.clone(), array).is_some() {
            return Err(Error::Weights(format!("重复的参数: {canonical}")));
        }
    }

    if layout == WeightsLayout::Sectioned {
        for section in SECTIONS {
            let prefix = format!("{section}.");
            if !params.keys().any(|k| k.starts_with(&prefix)) {
                return Err(Error::Weights(format!("缺少 {section} 分区")));
            }
        }
    }

    Ok((layout, ParamStore { params }))
}

/// 从 npz 构建完整模型，任何错误都不会产生部分加载的模型
pub(crate) fn load_model<R: Read + Seek>(reader: R, config: &CodecConfig) -> Result<(WeightsLayout, VqModel)> {
    let (layout, mut params) = read_params(reader)?;
    debug!("权重布局: {layout:?}");

    let encoder = Encoder::from_params(&mut params, config)?;
    let decoder = Decoder::from_params(&mut params, config)?;

    let (n, d) = (config.num_embeddings, config.embedding_dim);
    // 码本在文件中按 (D, N) 存储
    let embedding = params.take2("quantizer.embedding", [d, n])?;
    let cluster_size = params.take1("quantizer.cluster_size", n)?;
    let embed_avg = params.take2("quantizer.embed_avg", [d, n])?;
    params.finish()?;

    let state = QuantizerState {
        codebook: Codebook::new(embedding.reversed_axes().as_standard_layout().into_owned()),
        cluster_size,
        embed_avg: embed_avg.reversed_axes().as_standard_layout().into_owned(),
    };
    let quantizer = Quantizer::new(state, config.commitment_cost, config.decay, config.eps);

    Ok((layout, VqModel { encoder, decoder, quantizer }))
}

pub(crate) fn load_model_file(path: &Path, config: &CodecConfig) -> Result<(WeightsLayout, VqModel)> {
    let file = File::open(path)?;
    load_model(BufReader::new(file), config)
}

/// 按网络结构列出全部参数的规范名和形状（与 PyTorch state dict 一致）
pub fn parameter_shapes(config: &CodecConfig) -> Vec<(String, Vec<usize>)> {
    let (h, d, n) = (config.hidden, config.embedding_dim, config.num_embeddings);
    let half = h / 2;
    let mut shapes = vec![];
    let mut conv = |name: String, weight: [usize; 4], out: usize| {
        shapes.push((format!("{name}.weight"), weight.to_vec()));
        shapes.push((format!("{name}.bias"), vec![out]));
    };
    conv("encoder.conv_in.0".into(), [half, 3, 4, 4], half);
    conv("encoder.conv_in.2".into(), [h, half, 4, 4], h);
    conv("encoder.conv_out".into(), [d, h, 1, 1], d);
    conv("decoder.conv_in".into(), [h, d, 1, 1], h);
    conv("decoder.ups.0".into(), [h, half, 4, 4], half);
    conv("decoder.ups.2".into(), [half, 3, 4, 4], 3);
    for part in ["encoder", "decoder"] {
        for i in 0..RESIDUAL_BLOCKS {
            for j in [0, 3] {
                conv(format!("{part}.res.{i}.net.{j}"), [h, h, 3, 3], h);
            }
        }
    }
    shapes.push(("quantizer.embedding".into(), vec![d, n]));
    shapes.push(("quantizer.cluster_size".into(), vec![n]));
    shapes.push(("quantizer.embed_avg".into(), vec![d, n]));
    shapes.sort();
    shapes
}
