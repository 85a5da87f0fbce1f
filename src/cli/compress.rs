use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::{Parser, ValueEnum};
use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{info, warn};
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::cli::SubCommandExtend;
use crate::codec::VqCodec;
use crate::config::{CodecOptions, CompressOptions, ConfDir, Opts};
use crate::error::ErrorKind;
use crate::orchestrator::{CODEC_QUALITY, CompressionFailure, CompressionResult, Orchestrator, Output, OutputTarget};
use crate::utils::{self, COMPRESSED_SUFFIX, pb_style};

#[derive(Parser, Debug, Clone)]
pub struct CompressCommand {
    #[command(flatten)]
    pub compress: CompressOptions,
    #[command(flatten)]
    pub codec: CodecOptions,
    /// 不使用 VQ 模型，直接使用传统压缩
    #[arg(long)]
    pub no_codec: bool,
    /// VQ 模型路径的输出质量（1-100）
    #[arg(long, default_value_t = CODEC_QUALITY, value_parser = clap::value_parser!(i32).range(1..=100))]
    pub codec_quality: i32,
    /// 图片文件或目录
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
    /// 输出目录，默认输出到源文件旁的 `<name>_compressed.<ext>`
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,
    /// 扫描目录时的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png,webp,bmp,tif,tiff")]
    pub suffix: String,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}

#[derive(Debug, Serialize)]
struct Report {
    path: PathBuf,
    #[serde(flatten)]
    result: CompressionResult,
}

impl SubCommandExtend for CompressCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let orchestrator = self.orchestrator(&opts.conf_dir);
        let files = self.collect_files()?;
        if files.is_empty() {
            warn!("没有找到需要压缩的图片");
            return Ok(());
        }
        if let Some(dir) = &self.output {
            fs::create_dir_all(dir)?;
        }

        let targets: Vec<PathBuf> = files.iter().map(|path| self.output_target(path)).collect();
        let conflicts = output_conflicts(&files, &targets);

        let pb = ProgressBar::new(files.len() as u64).with_style(pb_style());
        let reports: Vec<Report> = files
            .par_iter()
            .zip(targets.par_iter())
            .zip(conflicts.par_iter())
            .progress_with(pb.clone())
            .map(|((path, target), conflict)| {
                let result = match conflict {
                    Some(owner) => conflict_failure(target, owner),
                    None => orchestrator.compress_path(path, self.compress.format, OutputTarget::File(target.clone())),
                };
                Report { path: path.clone(), result }
            })
            .collect();
        pb.finish_and_clear();

        print_reports(&reports, self.output_format)?;

        let failed = reports.iter().filter(|r| !r.result.is_success()).count();
        if failed > 0 {
            return Err(anyhow!("{failed}/{} 张图片压缩失败", reports.len()));
        }
        Ok(())
    }
}

impl CompressCommand {
    /// 按命令行参数构建调度器，权重加载失败时退化为传统压缩
    pub fn orchestrator(&self, conf_dir: &ConfDir) -> Orchestrator {
        let mut codec = VqCodec::new(self.codec.config());
        if !self.no_codec {
            match self.codec.weights_path(conf_dir) {
                Some(path) => {
                    codec.load(&path);
                }
                None => info!("没有找到 VQ 模型权重，使用传统压缩"),
            }
        }
        Orchestrator::new(codec, self.compress.fallback())
            .use_codec(!self.no_codec)
            .codec_quality(self.codec_quality)
    }

    fn collect_files(&self) -> Result<Vec<PathBuf>> {
        let re_suf = Regex::new(&format!("(?i)^({})$", self.suffix.replace(',', "|")))?;
        let mut files = vec![];
        for path in &self.paths {
            // 不存在的文件交给调度器报告 I/O 错误
            if !path.is_dir() {
                files.push(path.clone());
                continue;
            }
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|p| p.extension().map(|s| re_suf.is_match(&s.to_string_lossy())) == Some(true))
                .filter(|p| !is_compressed_output(p))
                .collect();
            found.sort();
            files.extend(found);
        }
        Ok(files)
    }

    fn output_target(&self, path: &Path) -> PathBuf {
        let derived = utils::derive_output_path(path, self.compress.format);
        match &self.output {
            Some(dir) => dir.join(derived.file_name().unwrap_or_default()),
            None => derived,
        }
    }
}

/// 对每个输入，返回先占用了同一输出路径的输入（如果有）
fn output_conflicts(files: &[PathBuf], targets: &[PathBuf]) -> Vec<Option<PathBuf>> {
    let mut owners: HashMap<&Path, &Path> = HashMap::with_capacity(targets.len());
    files
        .iter()
        .zip(targets)
        .map(|(file, target)| match owners.entry(target.as_path()) {
            Entry::Occupied(owner) => Some(owner.get().to_path_buf()),
            Entry::Vacant(slot) => {
                slot.insert(file.as_path());
                None
            }
        })
        .collect()
}

fn conflict_failure(target: &Path, owner: &Path) -> CompressionResult {
    CompressionResult::Failure(CompressionFailure {
        kind: ErrorKind::IoFailure,
        error: format!("输出路径 {} 已被 {} 占用", target.display(), owner.display()),
        learned_error: None,
    })
}

/// 上一次压缩留下的输出文件
fn is_compressed_output(path: &Path) -> bool {
    path.file_stem().map(|s| s.to_string_lossy().ends_with(COMPRESSED_SUFFIX)) == Some(true)
}

fn print_reports(reports: &[Report], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(reports)?)
        }
        OutputFormat::Table => {
            for report in reports {
                match &report.result {
                    CompressionResult::Success(s) => {
                        let output = match &s.output {
                            Output::File { path } => path.display().to_string(),
                            Output::Memory { .. } => "<memory>".to_string(),
                        };
                        println!(
                            "[OK] {} -> {}\t{}\t{}x{}\t{:.1}%",
                            report.path.display(),
                            output,
                            s.method,
                            s.width,
                            s.height,
                            s.compression_ratio * 100.0
                        );
                    }
                    CompressionResult::Failure(f) => {
                        eprintln!("[ERR] {}: {}", report.path.display(), f.error);
                    }
                }
            }
        }
    }
    Ok(())
}
