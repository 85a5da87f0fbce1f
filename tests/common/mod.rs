#![allow(dead_code)]

use std::io::Cursor;

use ndarray::{ArrayD, IxDyn};
use ndarray_npy::NpzWriter;
use opencv::core::{self, Mat, Scalar};
use opencv::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vqpress::codec::{CodecConfig, VqCodec, parameter_shapes};
use vqpress::utils::{self, ImageFormat};

/// 可以快速跑完前向计算的小模型
pub fn tiny_config() -> CodecConfig {
    CodecConfig { num_embeddings: 8, embedding_dim: 8, hidden: 8, resolution: 16, ..Default::default() }
}

/// 按网络结构生成随机权重，`sectioned` 决定使用 `encoder/...` 还是 `encoder....` 命名
pub fn random_weights(config: &CodecConfig, seed: u64, sectioned: bool) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut npz = NpzWriter::new(Cursor::new(Vec::new()));
    for (name, shape) in parameter_shapes(config) {
        let array = if name.ends_with("cluster_size") {
            ArrayD::<f32>::ones(IxDyn(&shape))
        } else {
            ArrayD::from_shape_fn(IxDyn(&shape), |_| rng.random_range(-0.2..0.2f32))
        };
        let name = if sectioned { name.replacen('.', "/", 1) } else { name };
        npz.add_array(name, &array).unwrap();
    }
    npz.finish().unwrap().into_inner()
}

pub fn loaded_codec(config: CodecConfig, seed: u64) -> VqCodec {
    let mut codec = VqCodec::new(config);
    codec.try_load_from(Cursor::new(random_weights(&config, seed, false))).unwrap();
    codec
}

/// 带噪声的渐变图片，接近照片的压缩特性
pub fn noisy_image(width: i32, height: i32, seed: u64) -> Mat {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = Mat::new_rows_cols_with_default(height, width, core::CV_8UC3, Scalar::all(0.0)).unwrap();
    let data = img.data_bytes_mut().unwrap();
    for (p, px) in data.chunks_exact_mut(3).enumerate() {
        let (y, x) = ((p as i32) / width, (p as i32) % width);
        let base = [x * 255 / width, y * 255 / height, (x + y) * 127 / (width + height)];
        for c in 0..3 {
            px[c] = (base[c] + rng.random_range(-16..=16)).clamp(0, 255) as u8;
        }
    }
    img
}

pub fn encoded_image(width: i32, height: i32, format: ImageFormat, seed: u64) -> Vec<u8> {
    utils::imencode(&noisy_image(width, height, seed), format, 95).unwrap()
}

/// 完全透明的 BGRA 图片编码为 PNG
pub fn transparent_png(width: i32, height: i32) -> Vec<u8> {
    let img = Mat::new_rows_cols_with_default(height, width, core::CV_8UC4, Scalar::all(0.0)).unwrap();
    utils::imencode(&img, ImageFormat::Png, 100).unwrap()
}
