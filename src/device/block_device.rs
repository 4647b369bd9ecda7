//! Block device facade over a memory-mapped file
//!
//! 基于内存映射文件的块设备门面

use super::backing;
use super::error::Result;
use super::fault;
use super::geometry::{compute_geometry, Geometry};
use super::mapping::MappedRegion;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Random-access byte store with durability control
///
/// 带持久化控制的随机访问字节存储
///
/// This is the contract a higher-level storage engine programs against. Offsets and
/// lengths need not be sector aligned.
///
/// 上层存储引擎面向此接口编程。偏移和长度无需按扇区对齐。
pub trait BlockDevice: Send + Sync {
    /// Read `buf.len()` bytes starting at `offset`
    ///
    /// 从 `offset` 开始读取 `buf.len()` 字节
    ///
    /// # Returns
    /// `buf.len()` on success
    ///
    /// # 返回值
    /// 成功时返回 `buf.len()`
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write all of `buf` starting at `offset`
    ///
    /// 从 `offset` 开始写入全部 `buf`
    ///
    /// # Returns
    /// `buf.len()` on success
    ///
    /// # 返回值
    /// 成功时返回 `buf.len()`
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Make every preceding write durable
    ///
    /// 使之前的所有写入持久化
    fn sync(&self) -> Result<()>;
}

/// Block device backed by a memory-mapped file
///
/// 基于内存映射文件的块设备
///
/// The backing file is sized to exactly `sector_size_bytes * sector_count` bytes and
/// mapped shared, read-write, in one piece.
///
/// 后备文件的大小恰好为 `sector_size_bytes * sector_count` 字节，并整体以共享读写方式映射。
///
/// # Features
///
/// - **Contained page faults**: Reads that hit truncated or failing storage return
///   [`Error::PageFault`](super::Error::PageFault) and leave the device usable
/// - **Reference counting**: Can be cloned and shared among multiple workers
/// - **Explicit durability**: [`sync`](BlockDevice::sync) blocks until the flush is acknowledged
///
/// # 特性
///
/// - **页错误隔离**：读取到被截断或出错的存储时返回 [`Error::PageFault`](super::Error::PageFault)，
///   设备仍可继续使用
/// - **引用计数**：可以克隆并在多个 worker 间共享
/// - **显式持久化**：[`sync`](BlockDevice::sync) 阻塞直到刷盘被确认
///
/// # Concurrency
///
/// Writes and syncs run without locking. Reads are serialized process-wide, because
/// the fault mode they switch is a process-wide setting. Concurrent overlapping reads
/// and writes interleave like any shared memory buffer.
///
/// # 并发
///
/// 写入和刷盘不加锁。读取在进程范围内串行执行，因为它们切换的错误模式是进程级设置。
/// 并发的重叠读写与任何共享内存缓冲区一样交错执行。
///
/// # Examples
///
/// ```
/// # use sector_mmap::{BlockDevice, MmapBlockDevice, Result};
/// # use tempfile::tempdir;
/// # fn main() -> Result<()> {
/// # let dir = tempdir()?;
/// # let path = dir.path().join("device.bin");
/// let (device, geometry) = MmapBlockDevice::create(&path, 1 << 20)?;
/// assert!(geometry.capacity() >= 1 << 20);
///
/// std::thread::scope(|s| {
///     let d1 = device.clone();
///     let d2 = device.clone();
///     s.spawn(move || d1.write_at(&[1; 512], 0));
///     s.spawn(move || d2.write_at(&[2; 512], 512));
/// });
///
/// device.sync()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MmapBlockDevice {
    /// Mapping shared by all clones
    ///
    /// 所有克隆共享的映射
    region: Arc<MappedRegion>,

    /// Path of the backing file
    ///
    /// 后备文件路径
    path: Arc<Path>,

    /// Sector size and count
    ///
    /// 扇区大小与数量
    geometry: Geometry,
}

impl MmapBlockDevice {
    /// Create (or resize) the file at `path` and map it as a block device
    ///
    /// 在 `path` 创建（或调整）文件并将其映射为块设备
    ///
    /// The capacity is at least `minimum_size_bytes`, rounded up to whole sectors, and
    /// never less than one sector. Existing file contents within the new length are kept.
    ///
    /// 容量至少为 `minimum_size_bytes`，向上取整到整扇区，且至少一个扇区。
    /// 新长度以内的已有文件内容会被保留。
    ///
    /// # Parameters
    /// - `path`: File path
    /// - `minimum_size_bytes`: Minimum capacity in bytes
    ///
    /// # 参数
    /// - `path`: 文件路径
    /// - `minimum_size_bytes`: 最小容量（字节）
    ///
    /// # Errors
    /// - Returns I/O errors if the file cannot be opened, created or resized
    /// - Returns `Mapping` if the file cannot be memory mapped
    ///
    /// # Errors
    /// - 如果无法打开、创建或调整文件大小，返回相应的 I/O 错误
    /// - 如果无法内存映射文件，返回 `Mapping` 错误
    pub fn create(path: impl AsRef<Path>, minimum_size_bytes: u64) -> Result<(Self, Geometry)> {
        let path = path.as_ref();
        let geometry = compute_geometry(minimum_size_bytes)?;
        let file = backing::allocate(path, geometry)?;
        let device = Self::from_file(path, file, geometry)?;
        Ok((device, geometry))
    }

    /// Open an existing device file with a known geometry
    ///
    /// 使用已知几何打开已有的设备文件
    ///
    /// The file carries no header, so the geometry returned by [`create`](Self::create)
    /// has to be supplied again. The file is never created or resized here.
    ///
    /// 文件不含头部，因此需要再次提供 [`create`](Self::create) 返回的几何。此处不会创建或调整文件。
    ///
    /// # Examples
    ///
    /// ```
    /// # use sector_mmap::{BlockDevice, MmapBlockDevice, Result};
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<()> {
    /// # let dir = tempdir()?;
    /// # let path = dir.path().join("reopen.bin");
    /// let (device, geometry) = MmapBlockDevice::create(&path, 4096)?;
    /// device.write_at(b"persisted", 0)?;
    /// device.sync()?;
    /// drop(device);
    ///
    /// let device = MmapBlockDevice::open(&path, geometry)?;
    /// let mut buf = [0u8; 9];
    /// device.read_at(&mut buf, 0)?;
    /// assert_eq!(&buf, b"persisted");
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    /// - Returns `InvalidGeometry` if the geometry is not usable
    /// - Returns I/O errors if the file is missing or cannot be opened read-write
    /// - Returns `GeometryMismatch` if the file length differs from the geometry capacity
    ///
    /// # Errors
    /// - 几何参数不可用时返回 `InvalidGeometry`
    /// - 文件不存在或无法以读写方式打开时返回 I/O 错误
    /// - 文件长度与几何容量不一致时返回 `GeometryMismatch`
    pub fn open(path: impl AsRef<Path>, geometry: Geometry) -> Result<Self> {
        let path = path.as_ref();
        let geometry = Geometry::new(geometry.sector_size_bytes(), geometry.sector_count())?;
        let file = backing::open_existing(path, geometry)?;

        tracing::debug!(
            path = %path.display(),
            sector_size_bytes = geometry.sector_size_bytes(),
            sector_count = geometry.sector_count(),
            "opened existing block device"
        );

        Self::from_file(path, file, geometry)
    }

    fn from_file(path: &Path, file: File, geometry: Geometry) -> Result<Self> {
        // Install the fault trap up front so the first read does not pay for it
        // 预先安装错误陷阱，使第一次读取无需承担安装开销
        fault::prepare()?;

        let region = MappedRegion::map(file, geometry.capacity())?;
        Ok(Self {
            region: Arc::new(region),
            path: Arc::from(path),
            geometry,
        })
    }

    /// Path of the backing file
    ///
    /// 后备文件路径
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sector size and count
    ///
    /// 扇区大小与数量
    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Total addressable bytes
    ///
    /// 可寻址的总字节数
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.region.len() as u64
    }
}

impl BlockDevice for MmapBlockDevice {
    /// Reads run as a guarded copy; see [`fault`](super::fault)
    ///
    /// 读取以受保护拷贝执行，见 [`fault`](super::fault)
    ///
    /// # Errors
    /// - Returns `OutOfBounds` if the range exceeds the capacity
    /// - Returns `PageFault` if the mapped pages could not be read; no bytes count as read
    ///
    /// # Errors
    /// - 范围超出容量时返回 `OutOfBounds`
    /// - 映射页无法读取时返回 `PageFault`，视为未读取任何字节
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.region.read(offset, buf)?;
        Ok(buf.len())
    }

    /// # Errors
    /// Returns `OutOfBounds` if the range exceeds the capacity
    ///
    /// # Errors
    /// 范围超出容量时返回 `OutOfBounds`
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.region.write(offset, buf)?;
        Ok(buf.len())
    }

    fn sync(&self) -> Result<()> {
        self.region.sync()?;
        tracing::debug!(path = %self.path.display(), "synced block device");
        Ok(())
    }
}

impl std::fmt::Debug for MmapBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapBlockDevice")
            .field("path", &self.path)
            .field("geometry", &self.geometry)
            .field("region", &self.region)
            .finish()
    }
}

/// Create a block device of at least `minimum_size_bytes` backed by the file at `path`
///
/// 创建由 `path` 处文件支撑、至少 `minimum_size_bytes` 字节的块设备
///
/// Returns the device together with its sector size and sector count. On success the
/// file at `path` is exactly `sector_size_bytes * sector_count` bytes long.
///
/// 返回设备及其扇区大小和扇区数量。成功时 `path` 处的文件长度恰好为
/// `sector_size_bytes * sector_count` 字节。
pub fn new_block_device_from_file(
    path: impl AsRef<Path>,
    minimum_size_bytes: u64,
) -> Result<(MmapBlockDevice, usize, u64)> {
    let (device, geometry) = MmapBlockDevice::create(path, minimum_size_bytes)?;
    Ok((device, geometry.sector_size_bytes(), geometry.sector_count()))
}
