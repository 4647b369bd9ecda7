//! Memory-mapped block device
//!
//! 内存映射块设备
//!
//! Construction path: [`compute_geometry`] → backing file allocation → memory mapping
//! → [`MmapBlockDevice`].
//!
//! 构造路径：[`compute_geometry`] → 分配后备文件 → 建立内存映射 → [`MmapBlockDevice`]。
//!
//! Per-operation path: [`MmapBlockDevice`] → [`fault`] guarded read → mapping.
//!
//! 单次操作路径：[`MmapBlockDevice`] → [`fault`] 受保护读取 → 映射。
//!
//! # Page Faults
//!
//! When the backing file is truncated after the mapping was established, or the
//! medium reports an I/O error while a page is brought in, touching the mapping
//! raises `SIGBUS`. Reads run inside a guarded copy that traps this signal, so only
//! the offending read fails:
//!
//! # 页错误
//!
//! 如果映射建立后后备文件被截断，或存储介质在换入页面时报告 I/O 错误，
//! 访问映射会触发 `SIGBUS`。读取在受保护的拷贝中执行并捕获该信号，因此只有出错的读取会失败：
//!
//! ```
//! # use sector_mmap::{BlockDevice, Error, MmapBlockDevice, Result};
//! # use tempfile::tempdir;
//! # fn main() -> Result<()> {
//! # let dir = tempdir()?;
//! # let path = dir.path().join("truncated.bin");
//! let (device, _geometry) = MmapBlockDevice::create(&path, 8192)?;
//!
//! // Another process shrinks the file underneath the mapping
//! // 其他进程在映射下方缩小了文件
//! std::fs::OpenOptions::new().write(true).open(&path)?.set_len(0)?;
//!
//! let mut buf = [0u8; 16];
//! # #[cfg(unix)]
//! assert!(matches!(device.read_at(&mut buf, 100), Err(Error::PageFault)));
//! # Ok(())
//! # }
//! ```

mod backing;
mod block_device;
mod error;
pub mod fault;
mod geometry;
mod mapping;


// Re-export public API
// 重新导出公共 API
pub use block_device::{new_block_device_from_file, BlockDevice, MmapBlockDevice};
pub use error::{Error, ErrorClass, Result};
pub use geometry::{compute_geometry, page_size, Geometry, MIN_SECTOR_SIZE};
