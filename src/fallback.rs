use log::debug;
use opencv::core::Mat;
use opencv::imgproc::InterpolationFlags;
use opencv::prelude::*;

use crate::error::Result;
use crate::utils::{self, ImageFormat};

/// 不依赖模型的传统压缩：合成透明通道、限制尺寸、有损重新编码
#[derive(Debug, Clone, Copy)]
pub struct FallbackCompressor {
    /// 最大 (宽, 高)，超过时等比缩小
    pub max_size: (i32, i32),
    pub quality: i32,
    pub interpolation: InterpolationFlags,
}

impl Default for FallbackCompressor {
    fn default() -> Self {
        Self { max_size: (1920, 1080), quality: 85, interpolation: InterpolationFlags::INTER_AREA }
    }
}

/// 编码后的图片
#[derive(Debug, Clone)]
pub struct Compressed {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
}

impl FallbackCompressor {
    pub fn compress_bytes(&self, bytes: &[u8], format: ImageFormat) -> Result<Compressed> {
        self.compress(&utils::imdecode(bytes)?, format)
    }

    /// 压缩已解码的图片，输入可以是任意通道数和位深
    pub fn compress(&self, img: &Mat, format: ImageFormat) -> Result<Compressed> {
        let bgr = utils::to_bgr(img)?;
        let (w, h) = (bgr.cols(), bgr.rows());
        let img = utils::adjust_image_size(bgr, self.max_size, self.interpolation)?;
        if (img.cols(), img.rows()) != (w, h) {
            debug!("缩放 {w}x{h} -> {}x{}", img.cols(), img.rows());
        }
        let data = utils::imencode(&img, format, self.quality)?;
        Ok(Compressed { data, width: img.cols(), height: img.rows() })
    }
}
