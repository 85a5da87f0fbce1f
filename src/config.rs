use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use opencv::imgproc::InterpolationFlags;

use crate::cli::*;
use crate::codec::CodecConfig;
use crate::fallback::FallbackCompressor;
use crate::utils::ImageFormat;

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let path = ProjectDirs::from("", "", "vqpress")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".vqpress"));
    ConfDir { path }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap_or(".vqpress")
}

#[derive(Parser, Debug, Clone)]
pub struct CompressOptions {
    /// 输出格式
    #[arg(short, long, value_enum, ignore_case = true, default_value = "jpeg")]
    pub format: ImageFormat,
    /// 图片最大尺寸，如果宽或高超过这个尺寸，则等比缩放
    #[arg(short = 'S', long, value_name = "WIDTHxHEIGHT", value_parser = parse_size, default_value = "1920x1080")]
    pub max_size: (i32, i32),
    /// 传统压缩的输出质量（1-100）
    #[arg(short, long, default_value_t = 85, value_parser = clap::value_parser!(i32).range(1..=100))]
    pub quality: i32,
    /// 缩放插值方式
    #[arg(long, value_name = "FLAG", default_value = "area", value_parser = parse_interpolation)]
    pub interpolation: InterpolationFlags,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self::parse_from::<_, &str>([])
    }
}

impl CompressOptions {
    pub fn fallback(&self) -> FallbackCompressor {
        FallbackCompressor { max_size: self.max_size, quality: self.quality, interpolation: self.interpolation }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct CodecOptions {
    /// VQ 模型权重文件（npz），默认使用配置目录下的 vqgan.npz
    #[arg(short, long, value_name = "FILE")]
    pub weights: Option<PathBuf>,
    /// 工作分辨率，必须是 4 的倍数
    #[arg(long, value_name = "R", default_value_t = 64)]
    pub resolution: usize,
    /// 码本大小
    #[arg(long, value_name = "N", default_value_t = 1024)]
    pub num_embeddings: usize,
    /// 码本向量维度
    #[arg(long, value_name = "D", default_value_t = 256)]
    pub embedding_dim: usize,
    /// 卷积隐藏通道数
    #[arg(long, value_name = "H", default_value_t = 256)]
    pub hidden: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self::parse_from::<_, &str>([])
    }
}

impl CodecOptions {
    pub fn config(&self) -> CodecConfig {
        CodecConfig {
            num_embeddings: self.num_embeddings,
            embedding_dim: self.embedding_dim,
            hidden: self.hidden,
            resolution: self.resolution,
            ..Default::default()
        }
    }

    /// 显式指定的权重文件，或者配置目录下存在的默认权重
    pub fn weights_path(&self, conf_dir: &ConfDir) -> Option<PathBuf> {
        match &self.weights {
            Some(path) => Some(path.clone()),
            None => Some(conf_dir.weights()).filter(|p| p.exists()),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "vqpress", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// vqpress 配置文件目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 压缩图片，支持文件和目录
    Compress(CompressCommand),
    /// 检查权重文件，可选地对一张图片做重建
    Inspect(InspectCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回默认权重文件的路径
    pub fn weights(&self) -> PathBuf {
        self.path.join("vqgan.npz")
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

fn parse_size(s: &str) -> anyhow::Result<(i32, i32)> {
    let parts: Vec<&str> = s.split('x').collect();
    if parts.len() != 2 {
        return Err(anyhow::anyhow!("无效的尺寸: {}", s));
    }
    let (w, h): (i32, i32) = (parts[0].parse()?, parts[1].parse()?);
    if w <= 0 || h <= 0 {
        return Err(anyhow::anyhow!("尺寸必须为正数: {}", s));
    }
    Ok((w, h))
}

pub(crate) fn parse_interpolation(s: &str) -> Result<InterpolationFlags, String> {
    match s {
        "nearest" => Ok(InterpolationFlags::INTER_NEAREST),
        "linear" => Ok(InterpolationFlags::INTER_LINEAR),
        "cubic" => Ok(InterpolationFlags::INTER_CUBIC),
        "area" => Ok(InterpolationFlags::INTER_AREA),
        "lanczos4" => Ok(InterpolationFlags::INTER_LANCZOS4),
        _ => Err(format!("无效的插值方式: {}", s)),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("1920x1080", Some((1920, 1080)))]
    #[case("64x64", Some((64, 64)))]
    #[case("1920", None)]
    #[case("0x10", None)]
    #[case("axb", None)]
    fn test_parse_size(#[case] input: &str, #[case] expected: Option<(i32, i32)>) {
        assert_eq!(parse_size(input).ok(), expected);
    }

    #[test]
    fn test_defaults() {
        let compress = CompressOptions::default();
        assert_eq!(compress.format, ImageFormat::Jpeg);
        assert_eq!(compress.max_size, (1920, 1080));
        assert_eq!(compress.quality, 85);

        let codec = CodecOptions::default();
        assert_eq!(codec.config(), CodecConfig::default());
        assert_eq!(codec.weights, None);
    }

    #[test]
    fn test_parse_format_ignores_case() {
        let opts = CompressOptions::parse_from(["test", "--format", "PNG"]);
        assert_eq!(opts.format, ImageFormat::Png);
        let opts = CompressOptions::parse_from(["test", "-f", "jpg"]);
        assert_eq!(opts.format, ImageFormat::Jpeg);
    }

    #[test]
    fn test_default_weights_only_when_present() {
        let dir = tempfile::TempDir::new().unwrap();
        let conf_dir: ConfDir = dir.path().to_str().unwrap().parse().unwrap();
        let codec = CodecOptions::default();
        assert_eq!(codec.weights_path(&conf_dir), None);
        std::fs::write(conf_dir.weights(), b"").unwrap();
        assert_eq!(codec.weights_path(&conf_dir), Some(conf_dir.weights()));
    }
}
