//! Page fault containment for reads from mapped memory
//!
//! 对映射内存读取的页错误隔离
//!
//! Reading a mapped page whose backing storage has disappeared (the file was
//! truncated) or cannot be read (medium error) raises `SIGBUS`. Without help this
//! terminates the process. Every read issued by [`MmapBlockDevice`](super::MmapBlockDevice)
//! runs as a *guarded copy* instead:
//!
//! 读取后备存储已消失（文件被截断）或无法读取（介质错误）的映射页会触发 `SIGBUS`，
//! 默认会终止进程。[`MmapBlockDevice`](super::MmapBlockDevice) 的每次读取都以*受保护拷贝*执行：
//!
//! 1. Take the process-wide guard lock
//! 2. Record the current fault mode and switch to recoverable
//! 3. Copy, with the signal trap armed for the source pages
//! 4. On a trapped fault, map the file back over the pages that faulted and report
//!    [`Error::PageFault`](super::Error::PageFault)
//! 5. Restore the recorded fault mode, then release the lock
//!
//! 1. 获取进程级保护锁
//! 2. 记录当前错误模式并切换为可恢复
//! 3. 在源页面上布置信号陷阱后执行拷贝
//! 4. 若捕获到错误，将文件重新映射到出错的页面上，并报告 [`Error::PageFault`](super::Error::PageFault)
//! 5. 恢复记录的错误模式，然后释放锁
//!
//! Only the page that faulted is replaced while the copy finishes, and it is replaced
//! read-only. Healthy pages next to it stay mapped to the file, so concurrent writes to
//! them are never diverted.
//!
//! 拷贝完成期间只替换出错的那一页，且以只读方式替换。相邻的正常页面始终映射着文件，
//! 因此对它们的并发写入不会被转移。
//!
//! The fault mode is shared by the whole process, so guarded copies from all devices
//! are serialized on one lock.
//!
//! 错误模式由整个进程共享，因此所有设备的受保护拷贝都在同一把锁上串行执行。

use super::error::{Error, Result};
use super::geometry::page_size;
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Whether a fault inside a guarded copy is recovered instead of being fatal
///
/// 受保护拷贝中的错误是否可恢复（否则为致命）
static RECOVER_ON_FAULT: AtomicBool = AtomicBool::new(false);

/// Serializes guarded copies and fault mode changes across the process
///
/// 在整个进程内串行化受保护拷贝与错误模式修改
static GUARD_LOCK: Mutex<()> = Mutex::new(());

fn lock_guard() -> MutexGuard<'static, ()> {
    GUARD_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f` while no guarded copy is in flight
///
/// 在没有进行中的受保护拷贝时运行 `f`
pub(crate) fn serialized<T>(f: impl FnOnce() -> T) -> T {
    let _lock = lock_guard();
    f()
}

/// Set the process-wide fault mode, returning the previous value
///
/// 设置进程级错误模式，返回之前的值
///
/// With `false` (the default) a memory fault is fatal. Guarded copies switch the
/// mode to `true` for their own duration and always put back what they found.
/// This call waits for any guarded copy in flight, so it never races with one.
///
/// 为 `false`（默认）时内存错误是致命的。受保护拷贝在执行期间将模式切换为 `true`，
/// 并总是恢复原值。此调用会等待进行中的受保护拷贝，因此不会与之竞争。
///
/// # Examples
///
/// ```
/// use sector_mmap::fault;
///
/// let previous = fault::set_recover_on_fault(true);
/// assert!(fault::recover_on_fault());
/// fault::set_recover_on_fault(previous);
/// ```
pub fn set_recover_on_fault(enabled: bool) -> bool {
    let _lock = lock_guard();
    RECOVER_ON_FAULT.swap(enabled, Ordering::SeqCst)
}

/// Get the process-wide fault mode
///
/// 获取进程级错误模式
///
/// Never observes the temporary value set by a guarded copy.
///
/// 不会观察到受保护拷贝设置的临时值。
pub fn recover_on_fault() -> bool {
    let _lock = lock_guard();
    RECOVER_ON_FAULT.load(Ordering::SeqCst)
}

/// Install the process-wide fault trap if it is not installed yet
///
/// 如尚未安装，则安装进程级错误陷阱
pub(crate) fn prepare() -> Result<()> {
    Ok(trap::install()?)
}

/// Switches the fault mode to recoverable and restores the recorded value on drop
///
/// 将错误模式切换为可恢复，并在 drop 时恢复记录的值
struct ModeRestore {
    previous: bool,
}

impl ModeRestore {
    fn enter() -> Self {
        Self {
            previous: RECOVER_ON_FAULT.swap(true, Ordering::SeqCst),
        }
    }
}

impl Drop for ModeRestore {
    fn drop(&mut self) {
        RECOVER_ON_FAULT.store(self.previous, Ordering::SeqCst);
    }
}

/// Page-aligned address range covering `[addr, addr + len)`
///
/// 覆盖 `[addr, addr + len)` 的页对齐地址范围
fn page_span(addr: usize, len: usize) -> Range<usize> {
    let page = page_size();
    let start = addr & !(page - 1);
    let end = (addr + len).next_multiple_of(page);
    start..end
}

/// Copy `dst.len()` bytes from mapped memory at `src` into `dst`, containing page faults
///
/// 从 `src` 处的映射内存拷贝 `dst.len()` 字节到 `dst`，并隔离页错误
///
/// If the copy faults, each faulting page is left backed by read-only anonymous memory
/// and `repair` is called once, while the lock is still held, with the page-aligned
/// range spanning every patched page. It must map the original backing storage over
/// that range again. A failed `repair` leaves the range unbacked; the caller has to
/// remember that and keep it out of use.
///
/// 如果拷贝出错，每个出错的页面会暂由只读匿名内存支撑，并在仍持有锁时以覆盖所有被替换页面的
/// 页对齐范围调用一次 `repair`，`repair` 必须将原后备存储重新映射到该范围。
/// `repair` 失败时该范围没有文件支撑，调用者需要记住这一点并停止使用该范围。
///
/// # Safety
///
/// `src..src + dst.len()` must lie inside a live shared file mapping that is not
/// unmapped during the call.
///
/// # Safety
///
/// `src..src + dst.len()` 必须位于一个在调用期间不会被解除映射的有效共享文件映射内。
///
/// # Errors
/// - Returns `PageFault` if the source pages could not be read; the contents of
///   `dst` are unspecified in that case
/// - Returns an I/O error if the signal trap could not be installed
///
/// # Errors
/// - 源页面无法读取时返回 `PageFault`，此时 `dst` 的内容未定义
/// - 信号陷阱安装失败时返回 I/O 错误
pub(crate) unsafe fn guarded_read<F>(src: *const u8, dst: &mut [u8], repair: F) -> Result<()>
where
    F: FnOnce(Range<usize>) -> io::Result<()>,
{
    if dst.is_empty() {
        return Ok(());
    }

    prepare()?;

    let pages = page_span(src as usize, dst.len());

    // Declared in this order so the mode is restored before the lock is released
    // 按此顺序声明，保证在释放锁之前恢复模式
    let _lock = lock_guard();
    let _mode = ModeRestore::enter();

    let patched = trap::run_armed(pages, || unsafe {
        std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
    });

    let Some(patched) = patched else {
        return Ok(());
    };

    tracing::warn!(
        pages = ?patched,
        len = dst.len(),
        "contained page fault while reading from memory map"
    );

    if let Err(err) = repair(patched.clone()) {
        tracing::error!(
            pages = ?patched,
            error = %err,
            "failed to restore file mapping after page fault"
        );
    }

    Err(Error::PageFault)
}

#[cfg(unix)]
mod trap {
    //! `SIGBUS`/`SIGSEGV` trap
    //!
    //! Only async-signal-safe work happens in the handler: atomics and one `mmap`.

    use std::ffi::c_void;
    use std::io;
    use std::mem;
    use std::ops::Range;
    use std::ptr;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering, compiler_fence};

    use libc::{c_int, siginfo_t};

    static ARMED_START: AtomicUsize = AtomicUsize::new(0);
    static ARMED_END: AtomicUsize = AtomicUsize::new(0);
    static ARMED_THREAD: AtomicUsize = AtomicUsize::new(0);
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    // Lowest and highest patched page of the current copy; LOW > HIGH means none
    // 本次拷贝中被替换页面的最低与最高地址；LOW > HIGH 表示没有
    static PATCHED_LOW: AtomicUsize = AtomicUsize::new(usize::MAX);
    static PATCHED_HIGH: AtomicUsize = AtomicUsize::new(0);

    static INSTALLED: OnceLock<Option<i32>> = OnceLock::new();
    static PREVIOUS_SIGBUS: OnceLock<PreviousAction> = OnceLock::new();
    static PREVIOUS_SIGSEGV: OnceLock<PreviousAction> = OnceLock::new();

    /// Handler that was installed before ours, chained for faults we don't own
    ///
    /// 在我们之前安装的处理器，用于转发不属于我们的错误
    struct PreviousAction(libc::sigaction);

    // Safety: sigaction is plain data; it is written once before our handler is live
    // Safety: sigaction 是纯数据，在我们的处理器生效前只写入一次
    unsafe impl Send for PreviousAction {}
    unsafe impl Sync for PreviousAction {}

    fn current_thread() -> usize {
        // Safety: pthread_self has no preconditions and is async-signal-safe
        // Safety: pthread_self 没有前置条件，且是异步信号安全的
        unsafe { libc::pthread_self() as usize }
    }

    /// Install the handlers once per process
    ///
    /// 每个进程只安装一次处理器
    pub(super) fn install() -> io::Result<()> {
        match INSTALLED.get_or_init(|| unsafe { install_handlers() }) {
            None => Ok(()),
            Some(errno) => Err(io::Error::from_raw_os_error(*errno)),
        }
    }

    unsafe fn install_handlers() -> Option<i32> {
        for (signum, slot) in [
            (libc::SIGBUS, &PREVIOUS_SIGBUS),
            (libc::SIGSEGV, &PREVIOUS_SIGSEGV),
        ] {
            unsafe {
                // Record the previous handler before ours can run
                // 在我们的处理器可能运行之前记录先前的处理器
                let mut previous: libc::sigaction = mem::zeroed();
                if libc::sigaction(signum, ptr::null(), &mut previous) != 0 {
                    return last_errno();
                }
                let _ = slot.set(PreviousAction(previous));

                let mut action: libc::sigaction = mem::zeroed();
                action.sa_sigaction = handle_fault as libc::sighandler_t;
                action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
                libc::sigemptyset(&mut action.sa_mask);
                if libc::sigaction(signum, &action, ptr::null_mut()) != 0 {
                    return last_errno();
                }
            }
        }

        tracing::debug!("installed page fault trap");
        None
    }

    fn last_errno() -> Option<i32> {
        Some(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
    }

    /// Run `copy` with the trap armed for `pages` on the current thread
    ///
    /// 在当前线程为 `pages` 布置陷阱并运行 `copy`
    ///
    /// Returns the page range spanning every page patched by the trap, or `None` if the
    /// copy did not fault. The caller must hold the guard lock.
    ///
    /// 返回覆盖陷阱替换的所有页面的范围；拷贝未出错时返回 `None`。调用者必须持有保护锁。
    pub(super) fn run_armed(pages: Range<usize>, copy: impl FnOnce()) -> Option<Range<usize>> {
        PATCHED_LOW.store(usize::MAX, Ordering::SeqCst);
        PATCHED_HIGH.store(0, Ordering::SeqCst);
        PAGE_SIZE.store(super::page_size(), Ordering::SeqCst);
        ARMED_START.store(pages.start, Ordering::SeqCst);
        ARMED_END.store(pages.end, Ordering::SeqCst);
        ARMED_THREAD.store(current_thread(), Ordering::SeqCst);
        compiler_fence(Ordering::SeqCst);

        copy();

        compiler_fence(Ordering::SeqCst);
        ARMED_THREAD.store(0, Ordering::SeqCst);
        ARMED_START.store(0, Ordering::SeqCst);
        ARMED_END.store(0, Ordering::SeqCst);

        let low = PATCHED_LOW.swap(usize::MAX, Ordering::SeqCst);
        let high = PATCHED_HIGH.swap(0, Ordering::SeqCst);
        (low < high).then_some(low..high)
    }

    extern "C" fn handle_fault(signum: c_int, info: *mut siginfo_t, context: *mut c_void) {
        let address = unsafe { fault_address(info) };
        if claim(address) {
            return;
        }
        unsafe { forward(signum, info, context) }
    }

    /// Take ownership of a fault inside the armed range
    ///
    /// 接管布置范围内的错误
    ///
    /// The single page holding `address` is replaced by a read-only anonymous zero
    /// page, so the faulting instruction succeeds when it is restarted and the copy
    /// runs on. Other threads writing to that page still fault, as they would have
    /// against the missing storage.
    ///
    /// 仅将包含 `address` 的那一页替换为只读匿名零页，被中断的指令重新执行时会成功，拷贝继续进行。
    /// 其他线程写入该页时仍会出错，与写入缺失的存储时一样。
    fn claim(address: usize) -> bool {
        if !super::RECOVER_ON_FAULT.load(Ordering::SeqCst) {
            return false;
        }
        let thread = ARMED_THREAD.load(Ordering::SeqCst);
        if thread == 0 || thread != current_thread() {
            return false;
        }
        let start = ARMED_START.load(Ordering::SeqCst);
        let end = ARMED_END.load(Ordering::SeqCst);
        if address < start || address >= end {
            return false;
        }

        let page_size = PAGE_SIZE.load(Ordering::SeqCst);
        let page = address & !(page_size - 1);

        // Safety: the page lies inside the armed source range, whose storage is gone
        // Safety: 该页位于布置的源范围内，其存储已不可用
        let patched = unsafe {
            libc::mmap(
                page as *mut c_void,
                page_size,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if patched == libc::MAP_FAILED {
            return false;
        }

        PATCHED_LOW.fetch_min(page, Ordering::SeqCst);
        PATCHED_HIGH.fetch_max(page + page_size, Ordering::SeqCst);
        true
    }

    /// Hand the signal to the previous handler, or restore the default disposition
    ///
    /// 将信号交给先前的处理器，或恢复默认处置
    ///
    /// With the default disposition back in place, the faulting instruction faults
    /// again on return and the process terminates as it would have without us.
    ///
    /// 恢复默认处置后，出错指令返回时会再次出错，进程如同没有我们时一样终止。
    unsafe fn forward(signum: c_int, info: *mut siginfo_t, context: *mut c_void) {
        let previous = match signum {
            libc::SIGBUS => PREVIOUS_SIGBUS.get(),
            _ => PREVIOUS_SIGSEGV.get(),
        };

        match previous.map(|p| (p.0.sa_sigaction, p.0.sa_flags)) {
            Some((handler, flags)) if handler != libc::SIG_DFL && handler != libc::SIG_IGN => {
                unsafe {
                    if flags & libc::SA_SIGINFO != 0 {
                        let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                            mem::transmute(handler);
                        handler(signum, info, context);
                    } else {
                        let handler: extern "C" fn(c_int) = mem::transmute(handler);
                        handler(signum);
                    }
                }
            }
            _ => unsafe {
                let mut default: libc::sigaction = mem::zeroed();
                default.sa_sigaction = libc::SIG_DFL;
                libc::sigemptyset(&mut default.sa_mask);
                libc::sigaction(signum, &default, ptr::null_mut());
            },
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn fault_address(info: *const siginfo_t) -> usize {
        unsafe { (*info).si_addr() as usize }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe fn fault_address(info: *const siginfo_t) -> usize {
        unsafe { (*info).si_addr as usize }
    }
}

#[cfg(not(unix))]
mod trap {
    //! No fault trap on this platform; guarded copies are plain copies

    use std::io;
    use std::ops::Range;

    pub(super) fn install() -> io::Result<()> {
        Ok(())
    }

    pub(super) fn run_armed(_pages: Range<usize>, copy: impl FnOnce()) -> Option<Range<usize>> {
        copy();
        None
    }
}
