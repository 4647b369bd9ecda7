//! Sector-addressed block device backed by a memory-mapped file
//!
//! 基于内存映射文件的按扇区寻址块设备
//!
//! This library lets a storage engine treat a regular file as a raw block device:
//! the file is allocated once at a requested minimum capacity, mapped into memory,
//! and then accessed through byte-range reads and writes with explicit durability
//! control.
//!
//! 本库让存储引擎把普通文件当作裸块设备使用：文件按请求的最小容量一次性分配并映射到内存，
//! 之后通过字节范围读写访问，并显式控制持久化。
//!
//! # Features
//!
//! - **Sector geometry**: Capacity is rounded up to a power-of-two sector size
//! - **Zero-copy mapping**: Reads and writes go straight to mapped memory
//! - **Contained page faults**: A read that hits a truncated or failing page returns
//!   [`Error::PageFault`] instead of killing the process
//! - **Thread-safe**: Devices are `Clone + Send + Sync` and can be shared by workers
//!
//! # 特性
//!
//! - **扇区几何**：容量向上取整到 2 的幂次扇区大小
//! - **零拷贝映射**：读写直接作用于映射内存
//! - **页错误隔离**：读取已截断或出错的页时返回 [`Error::PageFault`]，而不是终止进程
//! - **线程安全**：设备实现 `Clone + Send + Sync`，可在多个 worker 间共享
//!
//! # Quick Start
//!
//! ```
//! use sector_mmap::{new_block_device_from_file, BlockDevice, Result};
//! # use tempfile::tempdir;
//! # fn main() -> Result<()> {
//! # let dir = tempdir()?;
//! # let path = dir.path().join("device.bin");
//!
//! // Allocate at least 123456 bytes
//! // 分配至少 123456 字节
//! let (device, sector_size, sector_count) = new_block_device_from_file(&path, 123456)?;
//! assert!(sector_size as u64 * sector_count >= 123456);
//!
//! device.write_at(b"Hello", 12345)?;
//!
//! let mut buf = [0u8; 5];
//! assert_eq!(device.read_at(&mut buf, 12345)?, 5);
//! assert_eq!(&buf, b"Hello");
//!
//! device.sync()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Main Types
//!
//! - [`BlockDevice`]: Random-access byte store contract
//! - [`MmapBlockDevice`]: File-backed, memory-mapped implementation
//! - [`Geometry`]: Sector size and sector count of a device
//! - [`Error`]: Error type with [`ErrorClass`] categories
//!
//! # 主要类型
//!
//! - [`BlockDevice`]: 随机访问字节存储接口
//! - [`MmapBlockDevice`]: 基于文件的内存映射实现
//! - [`Geometry`]: 设备的扇区大小与扇区数量
//! - [`Error`]: 带 [`ErrorClass`] 分类的错误类型

mod device;

pub use device::fault;
pub use device::{
    compute_geometry, new_block_device_from_file, page_size, BlockDevice, Error, ErrorClass,
    Geometry, MmapBlockDevice, Result, MIN_SECTOR_SIZE,
};
