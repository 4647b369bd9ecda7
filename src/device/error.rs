//! Error types for sector-mmap
//!
//! sector-mmap 的错误类型

use std::io;
use thiserror::Error;

/// Error type for block device operations
///
/// 块设备操作的错误类型
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the filesystem (open, resize, flush)
    ///
    /// 来自文件系统的 I/O 错误（打开、调整大小、刷盘）
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backing file could not be memory mapped
    ///
    /// 后备文件无法被内存映射
    #[error("failed to map backing file: {0}")]
    Mapping(#[source] io::Error),

    /// Empty file cannot be mapped
    ///
    /// 空文件无法映射
    #[error("cannot map empty file")]
    EmptyFile,

    /// Byte range lies outside the device capacity
    ///
    /// 字节范围超出设备容量
    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    /// Sector size or sector count is not usable
    ///
    /// 扇区大小或扇区数量不可用
    #[error("invalid geometry: sector_size_bytes={sector_size_bytes} sector_count={sector_count}")]
    InvalidGeometry {
        sector_size_bytes: usize,
        sector_count: u64,
    },

    /// Existing file length does not match the supplied geometry
    ///
    /// 现有文件长度与给定几何参数不符
    #[error("backing file is {actual} bytes, geometry requires {expected}")]
    GeometryMismatch { expected: u64, actual: u64 },

    /// The mapped pages could not be read, because the file shrank or the medium failed
    ///
    /// 映射页无法读取：文件被缩小或介质出错
    #[error("Page fault occurred while reading from memory map")]
    PageFault,
}

/// Coarse error category
///
/// 粗粒度的错误类别
///
/// Lets callers translate device errors into their own status codes.
///
/// 便于调用者将设备错误转换为自己的状态码。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Failure reported by the host filesystem
    ///
    /// 宿主文件系统报告的失败
    Io,

    /// The caller passed arguments that can never succeed
    ///
    /// 调用者传入了不可能成功的参数
    InvalidArgument,

    /// Data is currently unavailable at the requested offset
    ///
    /// 请求偏移处的数据当前不可用
    Internal,
}

impl Error {
    /// Get the category of this error
    ///
    /// 获取错误类别
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Io(_) | Error::Mapping(_) | Error::GeometryMismatch { .. } => ErrorClass::Io,
            Error::EmptyFile | Error::OutOfBounds { .. } | Error::InvalidGeometry { .. } => {
                ErrorClass::InvalidArgument
            }
            Error::PageFault => ErrorClass::Internal,
        }
    }
}

/// Convert from Error to io::Error for compatibility
///
/// 从 Error 转换到 io::Error 以保持兼容性
impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(io_err) => io_err,
            Error::Mapping(io_err) => io_err,
            Error::PageFault => io::Error::other(err.to_string()),
            Error::GeometryMismatch { .. } => {
                io::Error::new(io::ErrorKind::InvalidData, err.to_string())
            }
            Error::EmptyFile | Error::OutOfBounds { .. } | Error::InvalidGeometry { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
            }
        }
    }
}

/// Result type alias using our custom Error type
///
/// 使用自定义 Error 类型的 Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
