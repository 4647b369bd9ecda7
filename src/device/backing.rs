//! Backing file allocation
//!
//! 后备文件分配

use super::error::{Error, Result};
use super::geometry::Geometry;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Open or create the file at `path` and size it to exactly `geometry.capacity()`
///
/// 打开或创建 `path` 处的文件，并将其大小设置为恰好 `geometry.capacity()`
///
/// Existing contents are kept up to the new length. Extended regions read back as
/// zeros, no further initialization is done.
///
/// 保留新长度以内的已有内容。扩展区域读取为零，不做其他初始化。
///
/// # Errors
/// I/O errors from opening or resizing are returned unchanged
///
/// # Errors
/// 打开或调整大小产生的 I/O 错误原样返回
pub(crate) fn allocate(path: &Path, geometry: Geometry) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    file.set_len(geometry.capacity())?;

    tracing::debug!(
        path = %path.display(),
        sector_size_bytes = geometry.sector_size_bytes(),
        sector_count = geometry.sector_count(),
        "allocated backing file"
    );

    Ok(file)
}

/// Open an existing file whose length must match `geometry`
///
/// 打开已有文件，其长度必须与 `geometry` 一致
///
/// # Errors
/// - Returns I/O errors if the file is missing or cannot be opened for writing
/// - Returns `GeometryMismatch` if the file length differs from `geometry.capacity()`
///
/// # Errors
/// - 文件不存在或无法以写方式打开时返回 I/O 错误
/// - 文件长度与 `geometry.capacity()` 不同时返回 `GeometryMismatch`
pub(crate) fn open_existing(path: &Path, geometry: Geometry) -> Result<File> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;

    let actual = file.metadata()?.len();
    if actual != geometry.capacity() {
        return Err(Error::GeometryMismatch {
            expected: geometry.capacity(),
            actual,
        });
    }

    Ok(file)
}
