use ndarray::prelude::*;
use opencv::core::{self, Mat, Scalar};
use opencv::imgproc::InterpolationFlags;
use opencv::prelude::*;

use crate::error::{Error, Result};
use crate::utils;

/// 归一化参数：(x / 255 - MEAN) / STD，把 [0, 255] 映射到 [-1, 1]
pub const MEAN: f32 = 0.5;
pub const STD: f32 = 0.5;

/// 图片与编解码器张量之间的转换
///
/// 压缩和检查（`inspect`）都走同一个转换，保证往返一致
#[derive(Debug, Clone, Copy)]
pub struct TensorTransform {
    resolution: usize,
    interpolation: InterpolationFlags,
}

impl TensorTransform {
    pub fn new(resolution: usize, interpolation: InterpolationFlags) -> Self {
        Self { resolution, interpolation }
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    /// 解码字节并转换为张量
    pub fn from_bytes(&self, bytes: &[u8]) -> Result<Array3<f32>> {
        let img = utils::to_bgr(&utils::imdecode(bytes)?)?;
        self.to_tensor(&img)
    }

    /// 8 位 BGR 图片 -> (3, R, R) 的 RGB 张量
    pub fn to_tensor(&self, img: &Mat) -> Result<Array3<f32>> {
        if img.channels() != 3 || img.depth() != core::CV_8U {
            return Err(Error::shape(
                "transform input",
                &[3],
                &[img.channels() as usize],
            ));
        }
        let r = self.resolution;
        let resized = utils::resize(img, (r as i32, r as i32), self.interpolation)?;
        let data = resized.data_bytes().map_err(|e| Error::Decode(e.to_string()))?;

        let mut tensor = Array3::<f32>::zeros((3, r, r));
        for (p, px) in data.chunks_exact(3).enumerate() {
            let (y, x) = (p / r, p % r);
            // BGR -> RGB
            for c in 0..3 {
                tensor[[c, y, x]] = (px[2 - c] as f32 / 255.0 - MEAN) / STD;
            }
        }
        Ok(tensor)
    }

    /// (3, R, R) 的 RGB 张量 -> 8 位 BGR 图片
    pub fn to_image(&self, tensor: ArrayView3<f32>) -> Result<Mat> {
        let r = self.resolution;
        if tensor.dim() != (3, r, r) {
            return Err(Error::shape("transform output", &[3, r, r], tensor.shape()));
        }
        let mut img = Mat::new_rows_cols_with_default(r as i32, r as i32, core::CV_8UC3, Scalar::all(0.0))
            .map_err(|e| Error::Encode(e.to_string()))?;
        let data = img.data_bytes_mut().map_err(|e| Error::Encode(e.to_string()))?;
        for (p, px) in data.chunks_exact_mut(3).enumerate() {
            let (y, x) = (p / r, p % r);
            for c in 0..3 {
                px[2 - c] = denormalize(tensor[[c, y, x]]);
            }
        }
        Ok(img)
    }
}

/// 反归一化并截断到 [0, 255]，小数部分直接舍去
#[inline]
pub fn denormalize(v: f32) -> u8 {
    let v = (v * STD + MEAN).clamp(0.0, 1.0);
    (v * 255.0) as u8
}

#[inline]
pub fn normalize(v: u8) -> f32 {
    (v as f32 / 255.0 - MEAN) / STD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(r: usize) -> TensorTransform {
        TensorTransform::new(r, InterpolationFlags::INTER_AREA)
    }

    #[test]
    fn test_normalize_range() {
        assert_eq!(normalize(0), -1.0);
        assert_eq!(normalize(255), 1.0);
        assert_eq!(denormalize(-1.0), 0);
        assert_eq!(denormalize(1.0), 255);
        // 超出范围的值被截断
        assert_eq!(denormalize(-3.0), 0);
        assert_eq!(denormalize(2.5), 255);
        assert_eq!(denormalize(f32::NAN), 0);
    }

    #[test]
    fn test_to_tensor_channel_order() {
        // 纯红色（BGR = 0, 0, 255）
        let img = Mat::new_rows_cols_with_default(8, 8, core::CV_8UC3, Scalar::new(0.0, 0.0, 255.0, 0.0)).unwrap();
        let tensor = transform(4).to_tensor(&img).unwrap();
        assert_eq!(tensor.dim(), (3, 4, 4));
        assert!(tensor.index_axis(Axis(0), 0).iter().all(|&v| v == 1.0));
        assert!(tensor.index_axis(Axis(0), 1).iter().all(|&v| v == -1.0));
        assert!(tensor.index_axis(Axis(0), 2).iter().all(|&v| v == -1.0));
    }

    #[test]
    fn test_roundtrip_at_working_resolution() {
        let t = transform(4);
        let img = Mat::new_rows_cols_with_default(4, 4, core::CV_8UC3, Scalar::new(12.0, 130.0, 250.0, 0.0)).unwrap();
        let back = t.to_image(t.to_tensor(&img).unwrap().view()).unwrap();
        let (a, b) = (img.data_bytes().unwrap(), back.data_bytes().unwrap());
        assert!(a.iter().zip(b).all(|(x, y)| x.abs_diff(*y) <= 1));
    }

    #[test]
    fn test_to_image_shape_mismatch() {
        let err = transform(4).to_image(Array3::zeros((3, 8, 8)).view()).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(matches!(transform(4).from_bytes(b"garbage"), Err(Error::Decode(_))));
    }
}
