//! Shared memory mapping of the backing file
//!
//! 后备文件的共享内存映射

use super::error::{Error, Result};
use super::fault;
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::io;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Read-write shared mapping of the first `len` bytes of a file
///
/// 文件前 `len` 字节的读写共享映射
///
/// The only owner of the mapped memory. All access goes through [`read`](Self::read)
/// and [`write`](Self::write), which take an explicit offset and length and check them
/// against the tracked length before touching memory.
///
/// 映射内存的唯一所有者。所有访问都经过 [`read`](Self::read) 和 [`write`](Self::write)，
/// 它们接收显式的偏移和长度，并在访问内存之前与记录的长度比较。
///
/// Dropping the region unmaps it and closes the file.
///
/// drop 时解除映射并关闭文件。
pub(crate) struct MappedRegion {
    /// Owns the mapping; unmapped on drop
    ///
    /// 持有映射，drop 时解除映射
    mmap: MmapMut,

    /// Base address of the mapping
    ///
    /// 映射的基地址
    ///
    /// # Safety
    /// Valid for `len` bytes for as long as `mmap` is alive
    ///
    /// # Safety
    /// 在 `mmap` 存活期间对 `len` 字节有效
    base: NonNull<u8>,

    /// Mapped length in bytes
    ///
    /// 映射长度（字节）
    len: usize,

    /// Kept open to map pages back in after a contained fault
    ///
    /// 保持打开，用于在错误被隔离后重新映射页面
    file: File,

    /// Page ranges that could not be mapped back to the file after a fault
    ///
    /// 出错后未能重新映射到文件的页范围
    damaged: Mutex<Vec<Range<usize>>>,

    /// Fast check for a non-empty `damaged`
    ///
    /// `damaged` 非空的快速检查
    has_damage: AtomicBool,
}

impl MappedRegion {
    /// Map the first `len` bytes of `file`
    ///
    /// 映射 `file` 的前 `len` 字节
    ///
    /// # Errors
    /// - Returns `EmptyFile` if `len` is 0
    /// - Returns `Mapping` if the region cannot be mapped
    ///
    /// # Errors
    /// - 如果 `len` 为 0，返回 `EmptyFile` 错误
    /// - 如果无法映射，返回 `Mapping` 错误
    pub(crate) fn map(file: File, len: u64) -> Result<Self> {
        if len == 0 {
            return Err(Error::EmptyFile);
        }
        let len = usize::try_from(len).map_err(|_| {
            Error::Mapping(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping length exceeds the address space",
            ))
        })?;

        // Safety: the mapping is only accessed through bounds-checked copies, and
        // reads are guarded against the file shrinking underneath it
        // Safety: 映射只通过带边界检查的拷贝访问，且读取对文件被缩小有保护
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(Error::Mapping)?;

        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            Error::Mapping(io::Error::other("mapping returned a null address"))
        })?;

        tracing::debug!(len, "mapped backing file");

        Ok(Self {
            mmap,
            base,
            len,
            file,
            damaged: Mutex::new(Vec::new()),
            has_damage: AtomicBool::new(false),
        })
    }

    /// Mapped length in bytes
    ///
    /// 映射长度（字节）
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Check that `[offset, offset + len)` lies inside the mapping
    ///
    /// 检查 `[offset, offset + len)` 是否位于映射内
    #[inline]
    fn check_range(&self, offset: u64, len: usize) -> Result<usize> {
        let out_of_bounds = || Error::OutOfBounds {
            offset,
            len,
            capacity: self.len as u64,
        };
        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        match start.checked_add(len) {
            Some(end) if end <= self.len => Ok(start),
            _ => Err(out_of_bounds()),
        }
    }

    /// Copy `buf.len()` bytes at `offset` into `buf`, containing page faults
    ///
    /// 将 `offset` 处的 `buf.len()` 字节拷贝到 `buf`，并隔离页错误
    ///
    /// # Errors
    /// - Returns `OutOfBounds` if the range exceeds the mapping
    /// - Returns `PageFault` if the pages could not be read
    /// - Returns `Mapping` if the range touches pages that still cannot be mapped back
    ///   to the file after an earlier fault
    ///
    /// # Errors
    /// - 范围超出映射时返回 `OutOfBounds`
    /// - 页面无法读取时返回 `PageFault`
    /// - 范围涉及之前出错后仍无法重新映射到文件的页面时返回 `Mapping`
    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.check_range(offset, buf.len())?;
        self.heal(start, buf.len())?;

        // Safety: the range was checked above and the mapping outlives the call
        // Safety: 范围已在上面检查，映射在调用期间有效
        unsafe {
            let src = self.base.as_ptr().add(start);
            fault::guarded_read(src, buf, |pages| self.restore_file_pages(pages))
        }
    }

    /// Copy `data` into the mapping at `offset`
    ///
    /// 将 `data` 拷贝到映射的 `offset` 处
    ///
    /// Not guarded: a medium failure on write-back surfaces through [`sync`](Self::sync).
    ///
    /// 不受保护：写回时的介质错误会通过 [`sync`](Self::sync) 报告。
    ///
    /// # Errors
    /// - Returns `OutOfBounds` if the range exceeds the mapping
    /// - Returns `Mapping` if the range touches pages that still cannot be mapped back
    ///   to the file after an earlier fault
    ///
    /// # Errors
    /// - 范围超出映射时返回 `OutOfBounds`
    /// - 范围涉及之前出错后仍无法重新映射到文件的页面时返回 `Mapping`
    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let start = self.check_range(offset, data.len())?;
        self.heal(start, data.len())?;

        // Safety: the range was checked above; concurrent overlapping access has the
        // same unspecified interleaving as any shared memory buffer
        // Safety: 范围已在上面检查；并发的重叠访问与任何共享内存缓冲区一样，交错顺序未定义
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.as_ptr().add(start), data.len());
        }
        Ok(())
    }

    /// Flush dirty pages to the backing file, blocking until the storage acknowledges
    ///
    /// 将脏页刷新到后备文件，阻塞直到存储确认
    pub(crate) fn sync(&self) -> Result<()> {
        Ok(self.mmap.flush()?)
    }

    fn lock_damaged(&self) -> MutexGuard<'_, Vec<Range<usize>>> {
        self.damaged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map the file back over `pages` after a contained fault, remembering failures
    ///
    /// 在错误被隔离后将文件重新映射到 `pages`，并记录失败
    fn restore_file_pages(&self, pages: Range<usize>) -> io::Result<()> {
        let result = self.map_file_pages(pages.clone());
        if result.is_err() {
            self.lock_damaged().push(pages);
            self.has_damage.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Retry remapping damaged pages before `[start, start + len)` is accessed
    ///
    /// 在访问 `[start, start + len)` 之前重试重新映射受损页面
    ///
    /// Damaged pages are read-only zero pages, not the file. Serving them would hand
    /// out zeros as data and crash writers, so an access touching one that still cannot
    /// be remapped fails instead.
    ///
    /// 受损页面是只读零页而非文件。使用它们会把零当作数据返回并使写入崩溃，
    /// 因此涉及仍无法重新映射的受损页面的访问会直接失败。
    fn heal(&self, start: usize, len: usize) -> Result<()> {
        if len == 0 || !self.has_damage.load(Ordering::SeqCst) {
            return Ok(());
        }

        fault::serialized(|| {
            let addr = self.base.as_ptr() as usize + start;
            let wanted = addr..addr + len;
            let mut damaged = self.lock_damaged();
            let mut failure = None;

            damaged.retain(|pages| match self.map_file_pages(pages.clone()) {
                Ok(()) => {
                    tracing::info!(pages = ?pages, "restored file mapping of damaged pages");
                    false
                }
                Err(err) => {
                    if pages.start < wanted.end && wanted.start < pages.end {
                        failure.get_or_insert(err);
                    }
                    true
                }
            });
            self.has_damage.store(!damaged.is_empty(), Ordering::SeqCst);

            match failure {
                Some(err) => Err(Error::Mapping(err)),
                None => Ok(()),
            }
        })
    }

    /// Map the backing file over `pages` again
    ///
    /// 将后备文件重新映射到 `pages`
    ///
    /// `pages` is a page-aligned address range inside this mapping.
    ///
    /// `pages` 是本映射内的页对齐地址范围。
    #[cfg(unix)]
    fn map_file_pages(&self, pages: Range<usize>) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        let offset = pages.start - self.base.as_ptr() as usize;

        // Safety: `pages` lies inside our own mapping, which we replace with the same
        // file range it was created from
        // Safety: `pages` 位于我们自己的映射内，用创建时相同的文件范围替换
        let mapped = unsafe {
            libc::mmap(
                pages.start as *mut libc::c_void,
                pages.end - pages.start,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn map_file_pages(&self, _pages: Range<usize>) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("damaged", &*self.lock_damaged())
            .finish()
    }
}

// Safety: the raw base pointer refers to the mapping owned by this value; every
// access goes through bounds-checked copies
//
// Safety: 原始基指针指向本值持有的映射；所有访问都经过带边界检查的拷贝
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn region(len: u64) -> (tempfile::TempDir, MappedRegion) {
        let dir = tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("region.bin"))
            .unwrap();
        file.set_len(len).unwrap();
        let region = MappedRegion::map(file, len).unwrap();
        (dir, region)
    }

    #[test]
    fn empty_file_is_rejected() {
        let file = tempfile::tempfile().unwrap();
        assert!(matches!(MappedRegion::map(file, 0), Err(Error::EmptyFile)));
    }

    #[test]
    fn write_then_read() {
        let (_dir, region) = region(8192);
        assert_eq!(region.len(), 8192);

        region.write(4000, b"across a page").unwrap();

        let mut buf = [0u8; 13];
        region.read(4000, &mut buf).unwrap();
        assert_eq!(&buf, b"across a page");
    }

    #[test]
    fn range_checks() {
        let (_dir, region) = region(4096);

        assert!(region.write(4091, b"12345").is_ok());
        assert!(matches!(
            region.write(4092, b"12345"),
            Err(Error::OutOfBounds {
                offset: 4092,
                len: 5,
                capacity: 4096
            })
        ));

        let mut buf = [0u8; 1];
        assert!(matches!(
            region.read(u64::MAX, &mut buf),
            Err(Error::OutOfBounds { .. })
        ));

        // Zero-length access at the very end is fine
        // 末尾的零长度访问是允许的
        assert!(region.read(4096, &mut []).is_ok());
        assert!(region.read(4097, &mut []).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn damaged_pages_are_never_served() {
        use crate::device::geometry::page_size;
        use std::fs::File;

        let page = page_size();
        let dir = tempdir().unwrap();
        let path = dir.path().join("damaged.bin");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(2 * page as u64).unwrap();
        let mut region = MappedRegion::map(file, 2 * page as u64).unwrap();

        region.write(0, b"head").unwrap();
        region.sync().unwrap();

        // 换成只读句柄，使重新映射失败
        let writable = std::mem::replace(&mut region.file, File::open(&path).unwrap());
        writable.set_len(page as u64).unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(region.read(page as u64, &mut buf), Err(Error::PageFault)));
        assert!(region.has_damage.load(Ordering::SeqCst));

        // 文件恢复了长度，但页面仍未重新映射：读写都报错，而不是返回零或丢失写入
        writable.set_len(2 * page as u64).unwrap();
        assert!(matches!(region.read(page as u64, &mut buf), Err(Error::Mapping(_))));
        assert!(matches!(region.write(page as u64, b"lost"), Err(Error::Mapping(_))));

        // 未受损的页面不受影响
        region.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"head");

        // 重新映射成功后页面恢复由文件支撑
        region.file = writable;
        region.write(page as u64, b"tail").unwrap();
        region.sync().unwrap();
        assert!(!region.has_damage.load(Ordering::SeqCst));
        assert_eq!(&std::fs::read(&path).unwrap()[page..page + 4], b"tail");
    }
}
