use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ValueEnum;
use indicatif::ProgressStyle;
use opencv::core::{self, Mat, Scalar, Size, Vector};
use opencv::imgproc::InterpolationFlags;
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc};
use serde::Serialize;

use crate::error::{Error, Result};

/// 自动推导输出路径时插入到扩展名之前的后缀
pub const COMPRESSED_SUFFIX: &str = "_compressed";

/// 输出图片格式
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageFormat {
    #[value(alias = "jpg")]
    Jpeg,
    Png,
    Webp,
}

impl ImageFormat {
    /// 规范扩展名
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn matches_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        match self {
            ImageFormat::Jpeg => matches!(ext.as_str(), "jpg" | "jpeg" | "jpe"),
            ImageFormat::Png => ext == "png",
            ImageFormat::Webp => ext == "webp",
        }
    }

    /// imencode 参数，PNG 为无损格式，忽略 quality 并使用最高压缩级别
    fn encode_params(&self, quality: i32) -> Vector<i32> {
        let quality = quality.clamp(1, 100);
        match self {
            ImageFormat::Jpeg => Vector::from(vec![
                imgcodecs::IMWRITE_JPEG_QUALITY,
                quality,
                imgcodecs::IMWRITE_JPEG_PROGRESSIVE,
                1,
                imgcodecs::IMWRITE_JPEG_OPTIMIZE,
                1,
            ]),
            ImageFormat::Png => Vector::from(vec![imgcodecs::IMWRITE_PNG_COMPRESSION, 9]),
            ImageFormat::Webp => Vector::from(vec![imgcodecs::IMWRITE_WEBP_QUALITY, quality]),
        }
    }
}

impl FromStr for ImageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "png" => Ok(ImageFormat::Png),
            "webp" => Ok(ImageFormat::Webp),
            _ => Err(Error::Encode(format!("不支持的输出格式: {s}"))),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Png => "PNG",
            ImageFormat::Webp => "WEBP",
        };
        f.write_str(name)
    }
}

fn decode_error(e: opencv::Error) -> Error {
    Error::Decode(e.to_string())
}

fn encode_error(e: opencv::Error) -> Error {
    Error::Encode(e.to_string())
}

/// 解码图片，保留原始通道数和位深
pub fn imdecode(bytes: &[u8]) -> Result<Mat> {
    if bytes.is_empty() {
        return Err(Error::Decode("输入为空".to_string()));
    }
    let buf = Vector::<u8>::from_slice(bytes);
    let img = imgcodecs::imdecode(&buf, imgcodecs::IMREAD_UNCHANGED).map_err(decode_error)?;
    // OpenCV 对无法识别的数据返回空矩阵而不是错误
    if img.empty() {
        return Err(Error::Decode("无法识别的图片数据".to_string()));
    }
    Ok(img)
}

/// 将任意位深、灰度或带透明通道的图片转换为不透明的 8 位 BGR
///
/// 透明区域合成到白色背景上
pub fn to_bgr(img: &Mat) -> Result<Mat> {
    let scale = match img.depth() {
        core::CV_8U => None,
        core::CV_16U => Some(1.0 / 257.0),
        core::CV_32F | core::CV_64F => Some(255.0),
        _ => Some(1.0),
    };
    let img = match scale {
        Some(alpha) => {
            let mut output = Mat::default();
            img.convert_to(&mut output, core::CV_8U, alpha, 0.0).map_err(decode_error)?;
            output
        }
        None => img.try_clone().map_err(decode_error)?,
    };

    match img.channels() {
        3 => Ok(img),
        1 => {
            let mut output = Mat::default();
            imgproc::cvt_color_def(&img, &mut output, imgproc::COLOR_GRAY2BGR).map_err(decode_error)?;
            Ok(output)
        }
        4 => flatten_alpha(&img),
        n => Err(Error::Decode(format!("不支持的通道数: {n}"))),
    }
}

/// BGRA 合成到白色背景
fn flatten_alpha(img: &Mat) -> Result<Mat> {
    let mut output =
        Mat::new_rows_cols_with_default(img.rows(), img.cols(), core::CV_8UC3, Scalar::all(255.0))
            .map_err(decode_error)?;
    let src = img.data_bytes().map_err(decode_error)?;
    let dst = output.data_bytes_mut().map_err(decode_error)?;
    for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(3)) {
        let a = s[3] as u32;
        for c in 0..3 {
            d[c] = ((s[c] as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
        }
    }
    Ok(output)
}

/// 计算等比缩放到 max 范围内的尺寸，不会放大
pub fn fit_within((width, height): (i32, i32), (max_width, max_height): (i32, i32)) -> (i32, i32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let scale = (max_width as f64 / width as f64).min(max_height as f64 / height as f64);
    let w = ((width as f64 * scale).round() as i32).clamp(1, max_width);
    let h = ((height as f64 * scale).round() as i32).clamp(1, max_height);
    (w, h)
}

pub fn resize(img: &Mat, (width, height): (i32, i32), interpolation: InterpolationFlags) -> Result<Mat> {
    let mut output = Mat::default();
    imgproc::resize(img, &mut output, Size::new(width, height), 0.0, 0.0, interpolation as i32)
        .map_err(encode_error)?;
    Ok(output)
}

/// 如果宽或高超过 max_size，则等比缩小
pub fn adjust_image_size(img: Mat, max_size: (i32, i32), interpolation: InterpolationFlags) -> Result<Mat> {
    let size = (img.cols(), img.rows());
    let target = fit_within(size, max_size);
    if target == size {
        return Ok(img);
    }
    resize(&img, target, interpolation)
}

pub fn imencode(img: &Mat, format: ImageFormat, quality: i32) -> Result<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    let ext = format!(".{}", format.extension());
    let ok = imgcodecs::imencode(&ext, img, &mut buf, &format.encode_params(quality)).map_err(encode_error)?;
    if !ok || buf.is_empty() {
        return Err(Error::Encode(format!("{format} 编码器没有输出")));
    }
    Ok(buf.to_vec())
}

/// 在原扩展名之前插入后缀，扩展名与目标格式不符时改用目标格式的扩展名，
/// 并把被替换的扩展名保留在文件名中
///
/// `photo.jpg` + JPEG -> `photo_compressed.jpg`
/// `photo.png` + JPEG -> `photo_png_compressed.jpg`
pub fn derive_output_path(input: &Path, format: ImageFormat) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let file_name = match input.extension().map(|e| e.to_string_lossy()) {
        Some(ext) if format.matches_extension(&ext) => format!("{stem}{COMPRESSED_SUFFIX}.{ext}"),
        Some(ext) => format!("{stem}_{ext}{COMPRESSED_SUFFIX}.{}", format.extension()),
        None => format!("{stem}{COMPRESSED_SUFFIX}.{}", format.extension()),
    };
    input.with_file_name(file_name)
}

/// 先写入同目录下的临时文件，成功后再重命名，避免留下不完整的输出
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("invalid progress bar template")
        .progress_chars("#>-")
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn solid(rows: i32, cols: i32, typ: i32, value: Scalar) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, typ, value).unwrap()
    }

    #[rstest]
    #[case((4000, 3000), (1920, 1080), (1440, 1080))]
    #[case((3000, 4000), (1920, 1080), (810, 1080))]
    #[case((1920, 1080), (1920, 1080), (1920, 1080))]
    #[case((800, 600), (1920, 1080), (800, 600))]
    #[case((5000, 10), (1920, 1080), (1920, 4))]
    #[case((10000, 1), (1920, 1080), (1920, 1))]
    fn test_fit_within(#[case] size: (i32, i32), #[case] max: (i32, i32), #[case] expected: (i32, i32)) {
        assert_eq!(fit_within(size, max), expected);
    }

    #[rstest]
    #[case("a/photo.png", ImageFormat::Jpeg, "a/photo_png_compressed.jpg")]
    #[case("a/photo.jpg", ImageFormat::Jpeg, "a/photo_compressed.jpg")]
    #[case("a/photo.JPEG", ImageFormat::Jpeg, "a/photo_compressed.JPEG")]
    #[case("a/my.holiday.webp", ImageFormat::Webp, "a/my.holiday_compressed.webp")]
    #[case("noext", ImageFormat::Png, "noext_compressed.png")]
    fn test_derive_output_path(#[case] input: &str, #[case] format: ImageFormat, #[case] expected: &str) {
        assert_eq!(derive_output_path(Path::new(input), format), PathBuf::from(expected));
    }

    #[test]
    fn test_derived_paths_of_same_stem_differ() {
        let png = derive_output_path(Path::new("dir/photo.png"), ImageFormat::Jpeg);
        let jpg = derive_output_path(Path::new("dir/photo.jpg"), ImageFormat::Jpeg);
        let jpeg = derive_output_path(Path::new("dir/photo.jpeg"), ImageFormat::Jpeg);
        assert_ne!(png, jpg);
        assert_ne!(jpg, jpeg);
    }

    #[rstest]
    #[case("JPEG", ImageFormat::Jpeg)]
    #[case("jpg", ImageFormat::Jpeg)]
    #[case("Png", ImageFormat::Png)]
    #[case("WEBP", ImageFormat::Webp)]
    fn test_parse_format(#[case] token: &str, #[case] expected: ImageFormat) {
        assert_eq!(token.parse::<ImageFormat>().unwrap(), expected);
    }

    #[test]
    fn test_parse_unknown_format() {
        assert!("gif".parse::<ImageFormat>().is_err());
    }

    #[test]
    fn test_imdecode_garbage() {
        assert!(matches!(imdecode(b"definitely not an image"), Err(Error::Decode(_))));
        assert!(matches!(imdecode(&[]), Err(Error::Decode(_))));
    }

    #[test]
    fn test_flatten_transparent_to_white() {
        // 完全透明的黑色像素应当变成白色
        let img = solid(2, 2, core::CV_8UC4, Scalar::all(0.0));
        let bgr = to_bgr(&img).unwrap();
        assert_eq!(bgr.channels(), 3);
        assert!(bgr.data_bytes().unwrap().iter().all(|&v| v == 255));
    }

    #[test]
    fn test_flatten_opaque_keeps_color() {
        let img = solid(2, 2, core::CV_8UC4, Scalar::new(10.0, 20.0, 30.0, 255.0));
        let bgr = to_bgr(&img).unwrap();
        assert_eq!(&bgr.data_bytes().unwrap()[..3], &[10, 20, 30]);
    }

    #[test]
    fn test_flatten_half_alpha() {
        let img = solid(1, 1, core::CV_8UC4, Scalar::new(0.0, 0.0, 0.0, 128.0));
        let bgr = to_bgr(&img).unwrap();
        // 0 * 128 + 255 * 127 ≈ 127
        assert_eq!(bgr.data_bytes().unwrap(), &[127, 127, 127]);
    }

    #[test]
    fn test_gray_and_16bit_to_bgr() {
        let gray = to_bgr(&solid(2, 3, core::CV_8UC1, Scalar::all(77.0))).unwrap();
        assert_eq!((gray.channels(), gray.cols(), gray.rows()), (3, 3, 2));
        assert!(gray.data_bytes().unwrap().iter().all(|&v| v == 77));

        let deep = to_bgr(&solid(1, 1, core::CV_16UC3, Scalar::all(65535.0))).unwrap();
        assert_eq!(deep.depth(), core::CV_8U);
        assert_eq!(deep.data_bytes().unwrap(), &[255, 255, 255]);
    }

    #[test]
    fn test_encode_roundtrip_dimensions() {
        let img = solid(30, 40, core::CV_8UC3, Scalar::new(50.0, 100.0, 150.0, 0.0));
        for format in [ImageFormat::Jpeg, ImageFormat::Png] {
            let bytes = imencode(&img, format, 85).unwrap();
            let decoded = imdecode(&bytes).unwrap();
            assert_eq!((decoded.cols(), decoded.rows()), (40, 30));
        }
    }

    #[test]
    fn test_adjust_image_size() {
        let img = solid(300, 400, core::CV_8UC3, Scalar::all(0.0));
        let small = adjust_image_size(img, (200, 200), InterpolationFlags::INTER_AREA).unwrap();
        assert_eq!((small.cols(), small.rows()), (200, 150));
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        // 不应残留临时文件
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
