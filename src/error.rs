use serde::Serialize;
use thiserror::Error;

/// 压缩流程中的错误
#[derive(Debug, Error)]
pub enum Error {
    /// 编解码器尚未加载权重
    #[error("VQ 模型未加载")]
    ModelNotLoaded,

    /// 张量形状与网络约定不符，属于调用方的编程错误
    #[error("{what} 形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
    ShapeMismatch { what: &'static str, expected: Vec<usize>, actual: Vec<usize> },

    /// 输入不是有效的图片
    #[error("图片解码失败: {0}")]
    Decode(String),

    /// 输出编码失败
    #[error("图片编码失败: {0}")]
    Encode(String),

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 仅外部协作方（例如去文字 API）会产生
    #[error("网络错误: {0}")]
    Network(String),

    /// 权重文件缺失字段、形状不符或已损坏
    #[error("权重文件无效: {0}")]
    Weights(String),

    #[error("张量重排失败: {0}")]
    Reshape(#[from] ndarray::ShapeError),

    /// 推理模式下不允许修改码本
    #[error("码本处于推理模式，拒绝 EMA 更新")]
    InvalidMode,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ModelNotLoaded => ErrorKind::ModelNotLoaded,
            Error::ShapeMismatch { .. } | Error::Reshape(_) => ErrorKind::ShapeMismatch,
            Error::Decode(_) => ErrorKind::DecodeFailure,
            Error::Encode(_) => ErrorKind::EncodeFailure,
            Error::Io(_) => ErrorKind::IoFailure,
            Error::Network(_) => ErrorKind::NetworkFailure,
            Error::Weights(_) => ErrorKind::WeightsFailure,
            Error::InvalidMode => ErrorKind::InvalidMode,
        }
    }

    pub(crate) fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Error::ShapeMismatch { what, expected: expected.to_vec(), actual: actual.to_vec() }
    }
}

impl From<ndarray_npy::ReadNpzError> for Error {
    fn from(err: ndarray_npy::ReadNpzError) -> Self {
        Error::Weights(err.to_string())
    }
}

/// 可序列化的错误类别，供外部持久化层记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ModelNotLoaded,
    ShapeMismatch,
    DecodeFailure,
    EncodeFailure,
    IoFailure,
    NetworkFailure,
    WeightsFailure,
    InvalidMode,
}

pub type Result<T> = std::result::Result<T, Error>;
