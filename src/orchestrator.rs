//! 单次压缩请求的调度：优先尝试 VQ 编解码器，失败后回退到传统压缩
//!
//! ```text
//! Pending ─> Processing ─┬─> Completed (learned | fallback)
//!                        └─> Failed
//! ```

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use opencv::core::Mat;
use opencv::prelude::*;
use serde::Serialize;

use crate::codec::VqCodec;
use crate::error::{Error, ErrorKind, Result};
use crate::fallback::{Compressed, FallbackCompressor};
use crate::transform::TensorTransform;
use crate::utils::{self, ImageFormat};

/// 编解码器路径的默认输出质量
pub const CODEC_QUALITY: i32 = 95;

#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl ImageSource {
    fn read(&self) -> Result<Cow<'_, [u8]>> {
        match self {
            ImageSource::Path(path) => Ok(Cow::Owned(std::fs::read(path)?)),
            ImageSource::Bytes(bytes) => Ok(Cow::Borrowed(bytes)),
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Path(path) => write!(f, "{}", path.display()),
            ImageSource::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// 结果保存在内存中返回
    Memory,
    File(PathBuf),
    /// 在源文件旁生成 `<stem>_compressed.<ext>`，仅适用于路径输入
    Derived,
}

#[derive(Debug, Clone)]
pub struct CompressionRequest {
    pub source: ImageSource,
    pub format: ImageFormat,
    pub output: OutputTarget,
}

impl CompressionRequest {
    pub fn new(source: ImageSource, format: ImageFormat) -> Self {
        Self { source, format, output: OutputTarget::Memory }
    }

    pub fn output(mut self, output: OutputTarget) -> Self {
        self.output = output;
        self
    }

    fn output_path(&self) -> Result<Option<PathBuf>> {
        match (&self.output, &self.source) {
            (OutputTarget::Memory, _) => Ok(None),
            (OutputTarget::File(path), _) => Ok(Some(path.clone())),
            (OutputTarget::Derived, ImageSource::Path(path)) => {
                Ok(Some(utils::derive_output_path(path, self.format)))
            }
            (OutputTarget::Derived, ImageSource::Bytes(_)) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "字节输入无法推导输出路径",
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Learned,
    Fallback,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Learned => "learned",
            Method::Fallback => "fallback",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Output {
    Memory {
        #[serde(skip)]
        data: Vec<u8>,
    },
    File {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressionSuccess {
    pub original_size: u64,
    pub compressed_size: u64,
    /// compressed_size / original_size，原始大小为 0 时为 0
    pub compression_ratio: f64,
    pub method: Method,
    pub output: Output,
    pub width: i32,
    pub height: i32,
    /// 仅编解码器路径有值
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment_loss: Option<f32>,
    /// 编解码器失败后回退时保留的错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learned_error: Option<String>,
    pub message: String,
}

impl CompressionSuccess {
    /// 内存输出的数据
    pub fn data(&self) -> Option<&[u8]> {
        match &self.output {
            Output::Memory { data } => Some(data),
            Output::File { .. } => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.output {
            Output::Memory { .. } => None,
            Output::File { path } => Some(path),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressionFailure {
    pub kind: ErrorKind,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learned_error: Option<String>,
}

/// 一次压缩请求的结果，成功与失败互斥
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CompressionResult {
    Success(CompressionSuccess),
    Failure(CompressionFailure),
}

impl CompressionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CompressionResult::Success(_))
    }

    pub fn status(&self) -> Status {
        match self {
            CompressionResult::Success(_) => Status::Completed,
            CompressionResult::Failure(_) => Status::Failed,
        }
    }

    pub fn method(&self) -> Option<Method> {
        match self {
            CompressionResult::Success(s) => Some(s.method),
            CompressionResult::Failure(_) => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            CompressionResult::Success(_) => None,
            CompressionResult::Failure(f) => Some(f.kind),
        }
    }
}

/// compressed / original，original 为 0 时定义为 0
pub fn compression_ratio(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 { 0.0 } else { compressed_size as f64 / original_size as f64 }
}

/// 请求的处理状态，由外部持久化层记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Processing)
                | (Status::Processing, Status::Completed)
                | (Status::Processing, Status::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

/// 接收状态变更，调度器本身不做持久化
pub trait StatusListener {
    fn on_status(&mut self, status: Status);
}

impl StatusListener for () {
    fn on_status(&mut self, _: Status) {}
}

impl StatusListener for Vec<Status> {
    fn on_status(&mut self, status: Status) {
        self.push(status);
    }
}

struct Transitions<'a, L: StatusListener> {
    current: Status,
    listener: &'a mut L,
}

impl<L: StatusListener> Transitions<'_, L> {
    fn advance(&mut self, next: Status) {
        debug_assert!(self.current.can_transition_to(next), "{:?} -> {next:?}", self.current);
        self.current = next;
        self.listener.on_status(next);
    }
}

/// 编解码器路径的产物
struct Learned {
    compressed: Compressed,
    commitment_loss: f32,
}

/// 压缩调度器
///
/// 编解码器是否启用由实例自身持有，多个实例之间互不影响
#[derive(Debug, Clone)]
pub struct Orchestrator {
    codec: VqCodec,
    transform: TensorTransform,
    fallback: FallbackCompressor,
    use_codec: bool,
    codec_quality: i32,
}

impl Orchestrator {
    pub fn new(codec: VqCodec, fallback: FallbackCompressor) -> Self {
        let transform = TensorTransform::new(codec.config().resolution, fallback.interpolation);
        Self { codec, transform, fallback, use_codec: true, codec_quality: CODEC_QUALITY }
    }

    pub fn use_codec(mut self, enabled: bool) -> Self {
        self.use_codec = enabled;
        self
    }

    pub fn codec_quality(mut self, quality: i32) -> Self {
        self.codec_quality = quality;
        self
    }

    pub fn codec(&self) -> &VqCodec {
        &self.codec
    }

    pub fn codec_mut(&mut self) -> &mut VqCodec {
        &mut self.codec
    }

    pub fn fallback(&self) -> &FallbackCompressor {
        &self.fallback
    }

    /// 编解码器已启用且权重已加载
    pub fn codec_active(&self) -> bool {
        self.use_codec && self.codec.is_loaded()
    }

    pub fn compress_bytes(&self, bytes: Vec<u8>, format: ImageFormat) -> CompressionResult {
        self.compress(&CompressionRequest::new(ImageSource::Bytes(bytes), format), &mut ())
    }

    pub fn compress_path<P: AsRef<Path>>(
        &self,
        path: P,
        format: ImageFormat,
        output: OutputTarget,
    ) -> CompressionResult {
        let request = CompressionRequest::new(ImageSource::Path(path.as_ref().to_path_buf()), format).output(output);
        self.compress(&request, &mut ())
    }

    pub fn compress<L: StatusListener>(&self, request: &CompressionRequest, listener: &mut L) -> CompressionResult {
        let mut status = Transitions { current: Status::Pending, listener };
        status.advance(Status::Processing);

        let mut learned_error = None;
        let result = self.run(request, &mut learned_error);
        let result = match result {
            Ok(success) => CompressionResult::Success(success),
            Err(e) => {
                error!("压缩失败 {}: {e}", request.source);
                CompressionResult::Failure(CompressionFailure { kind: e.kind(), error: e.to_string(), learned_error })
            }
        };
        status.advance(result.status());
        result
    }

    fn run(&self, request: &CompressionRequest, learned_error: &mut Option<String>) -> Result<CompressionSuccess> {
        let output_path = request.output_path()?;
        let bytes = request.source.read()?;
        let original_size = bytes.len() as u64;
        let img = utils::imdecode(&bytes)?;
        drop(bytes);

        let mut learned = None;
        if self.codec_active() {
            match self.compress_learned(&img, request.format) {
                Ok(result) => learned = Some(result),
                Err(e) => {
                    warn!("VQ 压缩失败，回退到传统压缩 {}: {e}", request.source);
                    *learned_error = Some(e.to_string());
                }
            }
        } else {
            debug!("VQ 模型未启用，使用传统压缩");
        }

        let (method, compressed, commitment_loss) = match learned {
            Some(Learned { compressed, commitment_loss }) => (Method::Learned, compressed, Some(commitment_loss)),
            None => (Method::Fallback, self.fallback.compress(&img, request.format)?, None),
        };

        let compressed_size = compressed.data.len() as u64;
        let output = match output_path {
            Some(path) => {
                utils::write_atomic(&path, &compressed.data)?;
                Output::File { path }
            }
            None => Output::Memory { data: compressed.data },
        };

        let compression_ratio = compression_ratio(original_size, compressed_size);
        let message = format!(
            "从 {original_size} 字节压缩到 {compressed_size} 字节（原始大小的 {:.1}%）",
            compression_ratio * 100.0
        );
        debug!("{}: {message} [{method}]", request.source);

        Ok(CompressionSuccess {
            original_size,
            compressed_size,
            compression_ratio,
            method,
            output,
            width: compressed.width,
            height: compressed.height,
            commitment_loss,
            learned_error: learned_error.clone(),
            message,
        })
    }

    fn compress_learned(&self, img: &Mat, format: ImageFormat) -> Result<Learned> {
        let bgr = utils::to_bgr(img)?;
        let tensor = self.transform.to_tensor(&bgr)?;
        let reconstruction = self.codec.forward(tensor.view())?;
        let output = self.transform.to_image(reconstruction.image.view())?;
        let data = utils::imencode(&output, format, self.codec_quality)?;
        let compressed = Compressed { data, width: output.cols(), height: output.rows() };
        Ok(Learned { compressed, commitment_loss: reconstruction.commitment_loss })
    }
}
