use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::Parser;
use log::info;
use opencv::imgproc::InterpolationFlags;
use serde::Serialize;

use crate::cli::{OutputFormat, SubCommandExtend};
use crate::codec::{CodebookUsage, CodecConfig, VqCodec, WeightsLayout, parameter_shapes};
use crate::config::{CodecOptions, Opts, parse_interpolation};
use crate::transform::TensorTransform;
use crate::utils::{self, ImageFormat};

#[derive(Parser, Debug, Clone)]
pub struct InspectCommand {
    #[command(flatten)]
    pub codec: CodecOptions,
    /// 对这张图片做一次前向计算，报告 commitment loss 和码本使用情况
    #[arg(short, long, value_name = "IMAGE")]
    pub image: Option<PathBuf>,
    /// 保存重建后的图片（PNG）
    #[arg(short, long, value_name = "FILE", requires = "image")]
    pub reconstruct: Option<PathBuf>,
    /// 缩放插值方式
    #[arg(long, value_name = "FLAG", default_value = "area", value_parser = parse_interpolation)]
    pub interpolation: InterpolationFlags,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    weights: PathBuf,
    layout: Option<WeightsLayout>,
    config: CodecConfig,
    parameters: usize,
    /// EMA 计数大于 0.5 的码本向量数量
    active_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    forward: Option<ForwardReport>,
}

#[derive(Debug, Serialize)]
struct ForwardReport {
    image: PathBuf,
    commitment_loss: f32,
    latent: (usize, usize),
    usage: CodebookUsage,
}

impl SubCommandExtend for InspectCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let weights = self
            .codec
            .weights_path(&opts.conf_dir)
            .ok_or_else(|| anyhow!("未指定权重文件，且 {} 不存在", opts.conf_dir.weights().display()))?;

        let config = self.codec.config();
        let mut codec = VqCodec::new(config);
        codec.try_load(&weights)?;
        info!("已加载 {}", weights.display());

        let quantizer = codec.quantizer()?;
        let active_entries = quantizer.state().cluster_size.iter().filter(|&&c| c > 0.5).count();

        let forward = match &self.image {
            Some(image) => Some(self.forward(&codec, image)?),
            None => None,
        };

        let report = InspectReport {
            weights,
            layout: codec.layout(),
            config,
            parameters: parameter_shapes(&config).len(),
            active_entries,
            forward,
        };
        print_report(&report, self.output_format)
    }
}

impl InspectCommand {
    fn forward(&self, codec: &VqCodec, image: &Path) -> Result<ForwardReport> {
        let transform = TensorTransform::new(codec.config().resolution, self.interpolation);
        let bytes = std::fs::read(image)?;
        let tensor = transform.from_bytes(&bytes)?;
        let reconstruction = codec.forward(tensor.view())?;

        if let Some(output) = &self.reconstruct {
            let img = transform.to_image(reconstruction.image.view())?;
            utils::write_atomic(output, &utils::imencode(&img, ImageFormat::Png, 100)?)?;
            info!("重建结果已保存到 {}", output.display());
        }

        let indices = reconstruction.indices.as_standard_layout();
        let usage = CodebookUsage::from_indices(
            indices.as_slice().unwrap_or_default(),
            codec.config().num_embeddings,
        );
        Ok(ForwardReport {
            image: image.to_path_buf(),
            commitment_loss: reconstruction.commitment_loss,
            latent: reconstruction.indices.dim(),
            usage,
        })
    }
}

fn print_report(report: &InspectReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?)
        }
        OutputFormat::Table => {
            let c = &report.config;
            println!("weights         : {}", report.weights.display());
            println!("layout          : {:?}", report.layout);
            println!("parameters      : {}", report.parameters);
            println!("codebook        : {} x {}", c.num_embeddings, c.embedding_dim);
            println!("resolution      : {0}x{0}", c.resolution);
            println!("active entries  : {}/{}", report.active_entries, c.num_embeddings);
            if let Some(f) = &report.forward {
                println!("image           : {}", f.image.display());
                println!("latent          : {}x{}", f.latent.0, f.latent.1);
                println!("commitment loss : {:.6}", f.commitment_loss);
                println!("codebook usage  : {}/{}", f.usage.used, f.usage.total);
                println!("perplexity      : {:.2}", f.usage.perplexity);
            }
        }
    }
    Ok(())
}
