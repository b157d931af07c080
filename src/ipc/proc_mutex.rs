/*!
 * Inter-Process Mutex
 *
 * One mutex, three schemes: POSIX named semaphores, SysV semaphores and
 * POSIX file locks. The scheme is fixed when the mutex is created; lock
 * and unlock report `Interrupted` on EINTR so callers can fold signal
 * handling into their own loops.
 */

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::str::FromStr;

use log::debug;

use crate::core::errors::IpcError;
use crate::core::limits::{IPC_NAME_MAX, PROC_MUTEX_NAME_RETRIES};
use crate::core::types::IpcResult;

const SEM_NAME_TMPL: &str = "/c-icap-sem.";
const LOCK_FILE_TMPL: &str = "/tmp/icapd-lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcMutexScheme {
    PosixSem,
    SysvSem,
    FileLock,
}

impl ProcMutexScheme {
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            ProcMutexScheme::PosixSem => "posix",
            ProcMutexScheme::SysvSem => "sysv",
            ProcMutexScheme::FileLock => "file",
        }
    }
}

impl FromStr for ProcMutexScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "posix" => Ok(ProcMutexScheme::PosixSem),
            "sysv" => Ok(ProcMutexScheme::SysvSem),
            "file" => Ok(ProcMutexScheme::FileLock),
            other => Err(format!("unknown proc-mutex scheme {:?}", other)),
        }
    }
}

enum Imp {
    Posix { sem: *mut libc::sem_t },
    Sysv { id: libc::c_int },
    File { fd: OwnedFd, path: PathBuf },
}

pub struct ProcMutex {
    name: String,
    imp: Imp,
}

// The semaphore handle and lock fd address process-shared kernel objects.
unsafe impl Send for ProcMutex {}
unsafe impl Sync for ProcMutex {}

impl ProcMutex {
    pub fn create(scheme: ProcMutexScheme, name: &str) -> IpcResult<Self> {
        let m = match scheme {
            ProcMutexScheme::PosixSem => Self::create_posix(name),
            ProcMutexScheme::SysvSem => Self::create_sysv(name),
            ProcMutexScheme::FileLock => Self::create_file(name),
        }?;
        debug!("created proc mutex {}", m);
        Ok(m)
    }

    fn create_posix(name: &str) -> IpcResult<Self> {
        // Retry with a monotonic suffix; a stale semaphore from a crashed
        // run occupies the previous names.
        let mut last = io::Error::from_raw_os_error(libc::EEXIST);
        for n in 0..PROC_MUTEX_NAME_RETRIES {
            let sem_name = format!("{}{}.{}", SEM_NAME_TMPL, name, n);
            if sem_name.len() >= IPC_NAME_MAX {
                return Err(IpcError::NameTooLong(sem_name, IPC_NAME_MAX));
            }
            let c_name = CString::new(sem_name.clone()).expect("no NUL in mutex name");
            let sem = unsafe {
                libc::sem_open(
                    c_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o640,
                    1,
                )
            };
            if sem != libc::SEM_FAILED {
                return Ok(Self {
                    name: sem_name,
                    imp: Imp::Posix { sem },
                });
            }
            last = io::Error::last_os_error();
            if last.raw_os_error() != Some(libc::EEXIST) {
                break;
            }
        }
        Err(IpcError::MutexCreate {
            scheme: "posix",
            name: name.to_string(),
            source: last,
        })
    }

    fn create_sysv(name: &str) -> IpcResult<Self> {
        let id = unsafe { libc::semget(libc::IPC_PRIVATE, 1, libc::IPC_CREAT | 0o600) };
        if id < 0 {
            return Err(IpcError::MutexCreate {
                scheme: "sysv",
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        if unsafe { libc::semctl(id, 0, libc::SETVAL, 0) } < 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::semctl(id, 0, libc::IPC_RMID, 0) };
            return Err(IpcError::MutexCreate {
                scheme: "sysv",
                name: name.to_string(),
                source,
            });
        }
        Ok(Self {
            name: truncate_name(name),
            imp: Imp::Sysv { id },
        })
    }

    fn create_file(name: &str) -> IpcResult<Self> {
        let mk_err = |source: io::Error| IpcError::MutexCreate {
            scheme: "file",
            name: name.to_string(),
            source,
        };
        for n in 0..PROC_MUTEX_NAME_RETRIES {
            let path = PathBuf::from(format!(
                "{}.{}.{}",
                LOCK_FILE_TMPL,
                std::process::id(),
                n
            ));
            match std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(file) => {
                    return Ok(Self {
                        name: truncate_name(name),
                        imp: Imp::File {
                            fd: file.into(),
                            path,
                        },
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(mk_err(e)),
            }
        }
        Err(mk_err(io::Error::from_raw_os_error(libc::EEXIST)))
    }

    pub fn lock(&self) -> IpcResult<()> {
        match &self.imp {
            Imp::Posix { sem } => {
                if unsafe { libc::sem_wait(*sem) } == 0 {
                    return Ok(());
                }
                self.map_wait_error()
            }
            Imp::Sysv { id } => {
                // Wait for zero, then bump to one, atomically and undone on
                // process death.
                let mut ops = [
                    libc::sembuf {
                        sem_num: 0,
                        sem_op: 0,
                        sem_flg: 0,
                    },
                    libc::sembuf {
                        sem_num: 0,
                        sem_op: 1,
                        sem_flg: libc::SEM_UNDO as libc::c_short,
                    },
                ];
                if unsafe { libc::semop(*id, ops.as_mut_ptr(), 2) } == 0 {
                    return Ok(());
                }
                self.map_wait_error()
            }
            Imp::File { fd, .. } => {
                let lock = whole_file_lock(libc::F_WRLCK as libc::c_short);
                if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETLKW, &lock) } == 0 {
                    Ok(())
                } else {
                    self.map_wait_error()
                }
            }
        }
    }

    pub fn unlock(&self) -> IpcResult<()> {
        match &self.imp {
            Imp::Posix { sem } => {
                if unsafe { libc::sem_post(*sem) } == 0 {
                    Ok(())
                } else {
                    Err(IpcError::MutexUnlock(
                        self.to_string(),
                        io::Error::last_os_error(),
                    ))
                }
            }
            Imp::Sysv { id } => {
                let mut ops = [libc::sembuf {
                    sem_num: 0,
                    sem_op: -1,
                    sem_flg: (libc::IPC_NOWAIT | libc::SEM_UNDO) as libc::c_short,
                }];
                if unsafe { libc::semop(*id, ops.as_mut_ptr(), 1) } == 0 {
                    Ok(())
                } else {
                    Err(IpcError::MutexUnlock(
                        self.to_string(),
                        io::Error::last_os_error(),
                    ))
                }
            }
            Imp::File { fd, .. } => {
                let lock = whole_file_lock(libc::F_UNLCK as libc::c_short);
                if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETLK, &lock) } == 0 {
                    Ok(())
                } else {
                    Err(IpcError::MutexUnlock(
                        self.to_string(),
                        io::Error::last_os_error(),
                    ))
                }
            }
        }
    }

    fn map_wait_error(&self) -> IpcResult<()> {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            Err(IpcError::Interrupted)
        } else {
            Err(IpcError::MutexLock(self.to_string(), err))
        }
    }

    /// Remove the underlying kernel object. Only the process that created
    /// the mutex should destroy it, and nothing may lock it afterwards.
    pub fn destroy(&self) -> IpcResult<()> {
        match &self.imp {
            Imp::Posix { sem } => {
                unsafe {
                    libc::sem_close(*sem);
                }
                let c_name = CString::new(self.name.clone()).expect("no NUL in mutex name");
                if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
                    debug!(
                        "sem_unlink({}) failed: {}",
                        self.name,
                        io::Error::last_os_error()
                    );
                }
            }
            Imp::Sysv { id } => {
                unsafe { libc::semctl(*id, 0, libc::IPC_RMID, 0) };
            }
            Imp::File { path, .. } => {
                let _ = std::fs::remove_file(path);
            }
        }
        Ok(())
    }
}

impl fmt::Display for ProcMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.imp {
            Imp::Posix { .. } => write!(f, "posix:{}", self.name),
            Imp::Sysv { id } => write!(f, "sysv:{}/{}", self.name, id),
            Imp::File { path, .. } => write!(f, "file:{}", path.display()),
        }
    }
}

fn truncate_name(name: &str) -> String {
    name.chars().take(IPC_NAME_MAX - 1).collect()
}

fn whole_file_lock(kind: libc::c_short) -> libc::flock {
    // Whole-file byte range: start 0, len 0.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl
}

pub(crate) fn errno_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn file_lock_round_trip() {
        let m = ProcMutex::create(ProcMutexScheme::FileLock, "test").unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
        assert!(m.to_string().starts_with("file:/tmp/"));
        m.destroy().unwrap();
    }

    #[test]
    #[serial]
    fn posix_sem_round_trip() {
        let m = ProcMutex::create(ProcMutexScheme::PosixSem, "test").unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
        assert!(m.to_string().starts_with("posix:/c-icap-sem.test."));
        m.destroy().unwrap();
    }

    #[test]
    #[serial]
    fn sysv_sem_round_trip() {
        let m = ProcMutex::create(ProcMutexScheme::SysvSem, "test").unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
        m.destroy().unwrap();
    }

    #[test]
    fn scheme_parse() {
        assert_eq!(
            "posix".parse::<ProcMutexScheme>().unwrap(),
            ProcMutexScheme::PosixSem
        );
        assert!("bogus".parse::<ProcMutexScheme>().is_err());
    }
}
