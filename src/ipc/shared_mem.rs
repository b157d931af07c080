/*!
 * Shared Memory
 *
 * A cross-process byte region polymorphic over anonymous mmap, POSIX
 * `shm_open` and SysV `shmget`. Anonymous mappings are inherited across
 * fork, so attach and detach are no-ops for them; the other schemes keep
 * their id around for tools that attach from outside the process tree.
 *
 * The region only ever hands out a base pointer and a length; everything
 * stored inside is addressed by offset, never by pointer.
 */

use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::str::FromStr;

use log::debug;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;

use super::proc_mutex::errno_io;
use crate::core::errors::IpcError;
use crate::core::limits::IPC_NAME_MAX;
use crate::core::types::IpcResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedMemScheme {
    Mmap,
    PosixShm,
    SysvShm,
}

impl SharedMemScheme {
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            SharedMemScheme::Mmap => "mmap",
            SharedMemScheme::PosixShm => "posix",
            SharedMemScheme::SysvShm => "sysv",
        }
    }
}

impl FromStr for SharedMemScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mmap" => Ok(SharedMemScheme::Mmap),
            "posix" => Ok(SharedMemScheme::PosixShm),
            "sysv" => Ok(SharedMemScheme::SysvShm),
            other => Err(format!("unknown shared-mem scheme {:?}", other)),
        }
    }
}

enum ShmImp {
    Mmap,
    Posix,
    Sysv { id: libc::c_int },
}

pub struct SharedMem {
    name: String,
    size: usize,
    base: NonNull<u8>,
    imp: ShmImp,
}

// The mapping is process-shared by construction; concurrent access is
// coordinated by the registry's proc mutex and per-slot atomics.
unsafe impl Send for SharedMem {}
unsafe impl Sync for SharedMem {}

impl SharedMem {
    pub fn create(scheme: SharedMemScheme, name: &str, size: usize) -> IpcResult<Self> {
        if name.len() >= IPC_NAME_MAX {
            return Err(IpcError::NameTooLong(name.to_string(), IPC_NAME_MAX));
        }
        let region = match scheme {
            SharedMemScheme::Mmap => Self::create_mmap(name, size),
            SharedMemScheme::PosixShm => Self::create_posix(name, size),
            SharedMemScheme::SysvShm => Self::create_sysv(name, size),
        }?;
        debug!("created shared memory {} ({} bytes)", region, size);
        Ok(region)
    }

    fn create_mmap(name: &str, size: usize) -> IpcResult<Self> {
        let len = NonZeroUsize::new(size).ok_or_else(|| IpcError::ShmCreate {
            name: name.to_string(),
            size,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        })?;
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| IpcError::ShmCreate {
            name: name.to_string(),
            size,
            source: errno_io(e),
        })?;
        Ok(Self {
            name: name.to_string(),
            size,
            base: base.cast(),
            imp: ShmImp::Mmap,
        })
    }

    fn create_posix(name: &str, size: usize) -> IpcResult<Self> {
        let shm_name = format!("/{}", name.trim_start_matches('/'));
        let mk_err = |source: io::Error| IpcError::ShmCreate {
            name: shm_name.clone(),
            size,
            source,
        };
        let fd = shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o600),
        )
        .map_err(|e| mk_err(errno_io(e)))?;
        nix::unistd::ftruncate(&fd, size as libc::off_t).map_err(|e| {
            let _ = shm_unlink(shm_name.as_str());
            mk_err(errno_io(e))
        })?;
        let len = NonZeroUsize::new(size).ok_or_else(|| mk_err(io::Error::from_raw_os_error(libc::EINVAL)))?;
        let base = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| {
            let _ = shm_unlink(shm_name.as_str());
            mk_err(errno_io(e))
        })?;
        // The mapping keeps the object alive; the descriptor can go.
        drop(fd);
        Ok(Self {
            name: shm_name,
            size,
            base: base.cast(),
            imp: ShmImp::Posix,
        })
    }

    fn create_sysv(name: &str, size: usize) -> IpcResult<Self> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
        if id < 0 {
            return Err(IpcError::ShmCreate {
                name: name.to_string(),
                size,
                source: io::Error::last_os_error(),
            });
        }
        let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if ptr == usize::MAX as *mut libc::c_void {
            let source = io::Error::last_os_error();
            unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
            return Err(IpcError::ShmCreate {
                name: name.to_string(),
                size,
                source,
            });
        }
        Ok(Self {
            name: name.to_string(),
            size,
            base: NonNull::new(ptr.cast()).expect("shmat returned non-null"),
            imp: ShmImp::Sysv { id },
        })
    }

    /// Attach an existing POSIX region by name, for tools outside the
    /// process tree. Fork children inherit the mapping and never call this.
    pub fn attach_posix(name: &str, size: usize) -> IpcResult<Self> {
        let shm_name = format!("/{}", name.trim_start_matches('/'));
        let fd = shm_open(shm_name.as_str(), OFlag::O_RDWR, Mode::from_bits_truncate(0o600))
            .map_err(|e| IpcError::ShmAttach(shm_name.clone(), errno_io(e)))?;
        let len = NonZeroUsize::new(size)
            .ok_or_else(|| IpcError::ShmAttach(shm_name.clone(), io::Error::from_raw_os_error(libc::EINVAL)))?;
        let base = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| IpcError::ShmAttach(shm_name.clone(), errno_io(e)))?;
        Ok(Self {
            name: shm_name,
            size,
            base: base.cast(),
            imp: ShmImp::Posix,
        })
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Raw view of the region.
    ///
    /// # Safety
    /// Concurrent writers in other processes are not visible to the borrow
    /// checker; callers must coordinate through the registry mutex or
    /// per-slot atomics.
    #[must_use]
    pub unsafe fn slice_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base.as_ptr(), self.size)
    }

    /// Unmap locally without removing the kernel object.
    fn detach_mapping(&mut self) {
        match self.imp {
            ShmImp::Mmap | ShmImp::Posix => {
                let _ = unsafe { munmap(self.base.cast(), self.size) };
            }
            ShmImp::Sysv { .. } => {
                unsafe { libc::shmdt(self.base.as_ptr().cast()) };
            }
        }
    }

    /// Unlink the kernel object without unmapping; existing mappings (ours
    /// included) stay valid until they are dropped. Only the creating
    /// process should call this, after its children are gone.
    pub fn remove(&self) {
        match self.imp {
            ShmImp::Mmap => {}
            ShmImp::Posix => {
                let _ = shm_unlink(self.name.as_str());
            }
            ShmImp::Sysv { id } => {
                unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
            }
        }
    }

    /// Remove the kernel object and drop the local mapping.
    pub fn destroy(self) -> IpcResult<()> {
        self.remove();
        Ok(())
    }
}

impl Drop for SharedMem {
    fn drop(&mut self) {
        self.detach_mapping();
    }
}

impl fmt::Display for SharedMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.imp {
            ShmImp::Mmap => write!(f, "mmap:{}", self.name),
            ShmImp::Posix => write!(f, "posix:{}", self.name),
            ShmImp::Sysv { id } => write!(f, "sysv:{}/{}", self.name, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn mmap_region_is_zeroed_and_writable() {
        let shm = SharedMem::create(SharedMemScheme::Mmap, "test-region", 4096).unwrap();
        let bytes = unsafe { shm.slice_mut() };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[0] = 0xAB;
        bytes[4095] = 0xCD;
        assert_eq!(bytes[0], 0xAB);
        shm.destroy().unwrap();
    }

    #[test]
    #[serial]
    fn sysv_region_round_trip() {
        let shm = SharedMem::create(SharedMemScheme::SysvShm, "test-sysv", 4096).unwrap();
        unsafe { shm.slice_mut()[10] = 7 };
        shm.destroy().unwrap();
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(SharedMem::create(SharedMemScheme::Mmap, "empty", 0).is_err());
    }

    #[test]
    fn scheme_parse() {
        assert_eq!(
            "mmap".parse::<SharedMemScheme>().unwrap(),
            SharedMemScheme::Mmap
        );
        assert!("bogus".parse::<SharedMemScheme>().is_err());
    }
}
