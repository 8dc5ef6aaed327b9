//! Memory backends: private anonymous mappings and named POSIX shared memory.
//!
//! A named segment is created by whichever process wins `shm_open(O_EXCL)`;
//! everyone else opens the existing object, waits until the creator has
//! sized it, and maps it `MAP_SHARED`. Names outlive every mapping until
//! [`MemoryBackend::unlink`] removes them.
//!
//! A creator that fails after winning the name unlinks it again. Attachers
//! holding the orphaned object notice once they fall back to yielding and
//! start over, usually becoming the creator themselves.

use std::ffi::{CStr, CString};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::MetadataExt;
use std::ptr::{self, NonNull};

use slabring_primitives::{Backoff, Region};

use crate::error::{Error, Result};

/// Longest accepted segment name, including the leading `/`.
pub const MAX_NAME_LEN: usize = 255;

/// Advisory placement requests applied after a backend is mapped.
///
/// Failures are logged and otherwise ignored; a segment that could not be
/// bound or locked is still fully usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOptions {
    /// Bind the pages to this NUMA node (Linux only).
    pub numa_node: Option<u32>,
    /// Pin the pages in physical memory (`mlock`).
    pub lock_in_memory: bool,
}

/// Whether this process laid out the segment or found it already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Created,
    Attached,
}

#[derive(Debug)]
enum Backing {
    Anonymous,
    Named {
        name: String,
        cname: CString,
        /// Identity of the object this mapping refers to.
        inode: u64,
    },
}

/// A mapped, fixed-size, page-aligned byte range.
///
/// Move-only. Dropping it unmaps the range; named segments stay registered
/// with the OS until unlinked.
pub struct MemoryBackend {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
    attachment: Attachment,
}

impl MemoryBackend {
    /// Map `size` zeroed bytes visible only to this process.
    pub fn anonymous(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid("segment size must be > 0"));
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        let ptr = mapped(ptr)?;

        debug!(size, "mapped anonymous segment");
        Ok(Self {
            ptr,
            len: size,
            backing: Backing::Anonymous,
            attachment: Attachment::Created,
        })
    }

    /// Create or attach to the shared segment `name` of exactly `size` bytes.
    ///
    /// A leading `/` is added when missing. If the name already exists with a
    /// different size, fails with [`Error::ResourceInUse`].
    ///
    /// An attacher that opens the name while the creator is still sizing it
    /// waits. If the creator fails and unlinks the name in the meantime, the
    /// attacher retries from scratch instead of waiting on the orphaned
    /// object. A creator that dies without unlinking leaves attachers waiting.
    pub fn named(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid("segment size must be > 0"));
        }
        let (name, cname) = shm_name(name)?;
        let (file, attachment) = open_shm(&name, &cname, size)?;
        let inode = file
            .metadata()
            .map_err(|err| Error::os("fstat", err))?
            .ino();

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        let ptr = match mapped(ptr) {
            Ok(ptr) => ptr,
            Err(err) => {
                if attachment == Attachment::Created {
                    unsafe { libc::shm_unlink(cname.as_ptr()) };
                }
                return Err(err);
            }
        };

        // The mapping keeps the object alive; the descriptor closes here.
        drop(file);

        debug!(%name, size, ?attachment, "mapped shared segment");
        Ok(Self {
            ptr,
            len: size,
            backing: Backing::Named { name, cname, inode },
            attachment,
        })
    }

    /// Whether the name this backend was opened under still refers to it.
    ///
    /// Always true for anonymous backends. False once the name was unlinked,
    /// even if it has since been recreated by someone else.
    pub fn is_linked(&self) -> Result<bool> {
        match &self.backing {
            Backing::Anonymous => Ok(true),
            Backing::Named { cname, inode, .. } => Ok(linked_inode(cname)? == Some(*inode)),
        }
    }

    /// Remove the name `name`. Existing mappings stay valid.
    ///
    /// Unlinking a name that does not exist succeeds.
    pub fn unlink(name: &str) -> Result<()> {
        let (name, cname) = shm_name(name)?;
        if unsafe { libc::shm_unlink(cname.as_ptr()) } == 0 {
            debug!(%name, "unlinked shared segment");
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(());
        }
        Err(Error::os("shm_unlink", err))
    }

    /// Address of byte `offset`.
    pub fn get(&self, offset: usize) -> Result<NonNull<u8>> {
        self.region().checked_offset(offset).ok_or(Error::OutOfRange {
            offset,
            len: self.len,
        })
    }

    /// Offset-addressed view used to lay out rings and pools.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the mapping is valid, page-aligned and outlives self.
        unsafe { Region::from_raw(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.region().contains(ptr)
    }

    /// Normalized name (with leading `/`) of a shared segment.
    pub fn name(&self) -> Option<&str> {
        match &self.backing {
            Backing::Anonymous => None,
            Backing::Named { name, .. } => Some(name),
        }
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Named { .. })
    }

    #[inline]
    pub fn attachment(&self) -> Attachment {
        self.attachment
    }

    /// Bind the segment's pages to NUMA node `node`.
    #[cfg(target_os = "linux")]
    pub fn bind_numa(&self, node: u32) -> Result<()> {
        const MPOL_BIND: libc::c_int = 2;
        const MASK_WORDS: usize = 16;

        let bits = libc::c_ulong::BITS;
        let max_nodes = MASK_WORDS as u32 * bits;
        if node >= max_nodes {
            return Err(Error::invalid(format!(
                "NUMA node {node} is beyond the {max_nodes} supported nodes"
            )));
        }

        let mut mask = [0 as libc::c_ulong; MASK_WORDS];
        mask[(node / bits) as usize] |= 1 << (node % bits);

        // The kernel reads one bit less than `maxnode`.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                self.ptr.as_ptr() as *mut libc::c_void,
                self.len as libc::c_ulong,
                MPOL_BIND,
                mask.as_ptr(),
                max_nodes as libc::c_ulong + 1,
                0 as libc::c_uint,
            )
        };
        if rc != 0 {
            return Err(Error::last_os("mbind"));
        }

        debug!(node, len = self.len, "bound segment to NUMA node");
        Ok(())
    }

    /// Bind the segment's pages to NUMA node `node`.
    #[cfg(not(target_os = "linux"))]
    pub fn bind_numa(&self, node: u32) -> Result<()> {
        let _ = node;
        Err(Error::Unsupported("NUMA binding requires Linux".into()))
    }

    /// Pin the segment in physical memory.
    pub fn lock_in_memory(&self) -> Result<()> {
        let rc = unsafe { libc::mlock(self.ptr.as_ptr() as *const libc::c_void, self.len) };
        if rc == 0 {
            debug!(len = self.len, "locked segment in memory");
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return Err(Error::Unsupported(
                "locking memory requires CAP_IPC_LOCK or a higher RLIMIT_MEMLOCK".into(),
            ));
        }
        Err(Error::os("mlock", err))
    }

    /// Apply advisory placement. Never fails; problems are logged.
    pub fn apply(&self, options: &BackendOptions) {
        if let Some(node) = options.numa_node
            && let Err(err) = self.bind_numa(node)
        {
            warn!(node, %err, "NUMA binding failed, segment left unbound");
        }
        if options.lock_in_memory
            && let Err(err) = self.lock_in_memory()
        {
            warn!(%err, "could not lock segment in memory");
        }
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("backing", &self.backing)
            .field("attachment", &self.attachment)
            .finish()
    }
}

// SAFETY: the mapping is valid for the lifetime of MemoryBackend and all
// concurrent access to its contents goes through atomics.
unsafe impl Send for MemoryBackend {}
unsafe impl Sync for MemoryBackend {}

fn mapped(ptr: *mut libc::c_void) -> Result<NonNull<u8>> {
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os("mmap"));
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| Error::Fatal {
        op: "mmap",
        source: io::Error::other("mapping returned a null address"),
    })
}

/// Validate and normalize a segment name.
fn shm_name(name: &str) -> Result<(String, CString)> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() {
        return Err(Error::invalid("segment name must not be empty"));
    }
    if bare.contains('/') {
        return Err(Error::invalid(format!(
            "segment name {name:?} may only contain '/' as its first character"
        )));
    }
    if bare.len() + 1 > MAX_NAME_LEN {
        return Err(Error::invalid(format!(
            "segment name is longer than {MAX_NAME_LEN} bytes"
        )));
    }

    let full = format!("/{bare}");
    let cname = CString::new(full.as_str())
        .map_err(|_| Error::invalid("segment name contains a NUL byte"))?;
    Ok((full, cname))
}

fn open_shm(name: &str, cname: &CStr, size: usize) -> Result<(File, Attachment)> {
    loop {
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
                0o600 as libc::c_uint,
            )
        };
        if fd >= 0 {
            let file = unsafe { File::from_raw_fd(fd) };
            if let Err(err) = file.set_len(size as u64) {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                return Err(Error::os("ftruncate", err));
            }
            return Ok((file, Attachment::Created));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(Error::os("shm_open", err));
        }

        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                trace!(%name, "segment unlinked between create and open, retrying");
                continue;
            }
            return Err(Error::os("shm_open", err));
        }

        let file = unsafe { File::from_raw_fd(fd) };
        let Some(actual) = wait_for_size(&file, cname)? else {
            debug!(%name, "creator unlinked the segment before sizing it, retrying");
            continue;
        };
        if actual != size as u64 {
            return Err(Error::ResourceInUse {
                what: format!("shared segment {name}"),
                reason: format!("it holds {actual} bytes, {size} requested").into(),
            });
        }
        return Ok((file, Attachment::Attached));
    }
}

/// The creator sizes the object right after creating it; until then it is
/// empty. Returns `None` if the name stops referring to `file` first.
fn wait_for_size(file: &File, cname: &CStr) -> Result<Option<u64>> {
    let mut backoff = Backoff::new();
    loop {
        let meta = file.metadata().map_err(|err| Error::os("fstat", err))?;
        if meta.len() != 0 {
            return Ok(Some(meta.len()));
        }
        if backoff.is_yielding() && linked_inode(cname)? != Some(meta.ino()) {
            return Ok(None);
        }
        backoff.step();
    }
}

/// Inode the name currently resolves to, if it exists.
fn linked_inode(cname: &CStr) -> Result<Option<u64>> {
    let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC, 0) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(None);
        }
        return Err(Error::os("shm_open", err));
    }
    let file = unsafe { File::from_raw_fd(fd) };
    let meta = file.metadata().map_err(|err| Error::os("fstat", err))?;
    Ok(Some(meta.ino()))
}
