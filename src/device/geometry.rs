//! Sector geometry calculation
//!
//! 扇区几何计算

use super::error::{Error, Result};

/// Smallest sector size handed out, in bytes
///
/// 最小扇区大小（字节）
pub const MIN_SECTOR_SIZE: usize = 512;

/// Sector size and sector count of a block device
///
/// 块设备的扇区大小与扇区数量
///
/// The capacity of a device is always `sector_size_bytes * sector_count`. The backing
/// file carries no header, so a geometry has to be kept by the caller and passed to
/// [`MmapBlockDevice::open`](super::MmapBlockDevice::open) when reopening a device.
///
/// 设备容量始终为 `sector_size_bytes * sector_count`。后备文件不包含头部，
/// 因此调用者需要保存几何参数，并在重新打开设备时传给
/// [`MmapBlockDevice::open`](super::MmapBlockDevice::open)。
///
/// # Examples
///
/// ```
/// use sector_mmap::{compute_geometry, MIN_SECTOR_SIZE};
///
/// let geometry = compute_geometry(123456)?;
/// assert!(geometry.sector_size_bytes().is_power_of_two());
/// assert!(geometry.sector_size_bytes() >= MIN_SECTOR_SIZE);
/// assert!(geometry.capacity() >= 123456);
/// # Ok::<(), sector_mmap::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Geometry {
    sector_size_bytes: usize,
    sector_count: u64,
}

impl Geometry {
    /// Create a geometry from explicit values
    ///
    /// 使用显式参数创建几何
    ///
    /// # Errors
    /// Returns `InvalidGeometry` if the sector size is not a power of two of at least
    /// [`MIN_SECTOR_SIZE`], the sector count is zero, or the capacity overflows `u64`.
    ///
    /// # Errors
    /// 如果扇区大小不是不小于 [`MIN_SECTOR_SIZE`] 的 2 的幂、扇区数量为 0，
    /// 或容量溢出 `u64`，返回 `InvalidGeometry` 错误
    pub fn new(sector_size_bytes: usize, sector_count: u64) -> Result<Self> {
        let valid = sector_size_bytes >= MIN_SECTOR_SIZE
            && sector_size_bytes.is_power_of_two()
            && sector_count >= 1
            && (sector_size_bytes as u64).checked_mul(sector_count).is_some();
        if !valid {
            return Err(Error::InvalidGeometry {
                sector_size_bytes,
                sector_count,
            });
        }
        Ok(Self {
            sector_size_bytes,
            sector_count,
        })
    }

    /// Compute the geometry for `requested_bytes` with a given sector size
    ///
    /// 使用给定扇区大小计算 `requested_bytes` 所需的几何
    ///
    /// `sector_size_bytes` is raised to [`MIN_SECTOR_SIZE`] and to the next power of two.
    /// The sector count is `ceil(requested_bytes / sector_size_bytes)`, but never below 1.
    ///
    /// `sector_size_bytes` 会被提升到 [`MIN_SECTOR_SIZE`] 以及下一个 2 的幂。
    /// 扇区数量为 `ceil(requested_bytes / sector_size_bytes)`，且至少为 1。
    ///
    /// # Errors
    /// Returns `InvalidGeometry` if the rounded-up capacity does not fit in `u64`,
    /// which happens for requests within one sector of `u64::MAX`
    ///
    /// # Errors
    /// 如果向上取整后的容量超出 `u64`（请求距 `u64::MAX` 不足一个扇区时），
    /// 返回 `InvalidGeometry` 错误
    pub fn for_capacity(requested_bytes: u64, sector_size_bytes: usize) -> Result<Self> {
        let sector_size_bytes = sector_size_bytes.max(MIN_SECTOR_SIZE).next_power_of_two();
        let sector_count = requested_bytes.div_ceil(sector_size_bytes as u64).max(1);
        Self::new(sector_size_bytes, sector_count)
    }

    /// Sector size in bytes
    ///
    /// 扇区大小（字节）
    #[inline]
    pub fn sector_size_bytes(&self) -> usize {
        self.sector_size_bytes
    }

    /// Number of sectors
    ///
    /// 扇区数量
    #[inline]
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    /// Total addressable bytes
    ///
    /// 可寻址的总字节数
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.sector_size_bytes as u64 * self.sector_count
    }

    /// Byte offset of the first byte of `sector`, or `None` past the last sector
    ///
    /// `sector` 首字节的偏移，超出最后一个扇区时返回 `None`
    #[inline]
    pub fn sector_offset(&self, sector: u64) -> Option<u64> {
        (sector < self.sector_count).then(|| sector * self.sector_size_bytes as u64)
    }
}

/// Compute the geometry for a device of at least `requested_bytes`
///
/// 计算至少容纳 `requested_bytes` 的设备几何
///
/// The sector size is the host page size (at least [`MIN_SECTOR_SIZE`]), so sector
/// boundaries of a geometry computed here are also page boundaries of the mapping.
/// Geometries built with [`Geometry::new`] may use smaller sectors.
///
/// 扇区大小取宿主页大小（至少 [`MIN_SECTOR_SIZE`]），因此此处计算的几何中扇区边界也是映射的页边界。
/// 通过 [`Geometry::new`] 构造的几何可以使用更小的扇区。
///
/// # Errors
/// Returns `InvalidGeometry` if the rounded-up capacity overflows `u64`
///
/// # Errors
/// 向上取整后的容量溢出 `u64` 时返回 `InvalidGeometry` 错误
pub fn compute_geometry(requested_bytes: u64) -> Result<Geometry> {
    Geometry::for_capacity(requested_bytes, page_size())
}

/// Memory page size of the host
///
/// 宿主的内存页大小
#[cfg(unix)]
pub fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    // Safety: sysconf 没有前置条件
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// Memory page size of the host
///
/// 宿主的内存页大小
#[cfg(not(unix))]
pub fn page_size() -> usize {
    4096
}
