//! POSIX message queue and shared memory backends.

use std::ffi::CString;
use std::io;

use simbridge_types::TransportConfig;

use crate::channel::{ControlChannel, PayloadRegion};
use crate::codec::{self, HEADER_LEN};
use crate::error::TransportError;
use crate::framed::FramedTransport;

pub type PosixTransport = FramedTransport<PosixQueue, PosixRegion>;

fn object_name(name: &str) -> Result<CString, TransportError> {
    CString::new(name).map_err(|_| TransportError::Io {
        object: name.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "name contains a NUL byte"),
    })
}

/// A message queue holding at most one 8-byte length header.
pub struct PosixQueue {
    name: String,
    mqd: libc::mqd_t,
}

impl PosixQueue {
    /// Open the queue, creating it with capacity one if it does not exist.
    pub fn open(name: &str) -> Result<Self, TransportError> {
        let c_name = object_name(name)?;
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_maxmsg = 1;
        attr.mq_msgsize = HEADER_LEN as libc::c_long;
        let mqd = unsafe {
            libc::mq_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o600 as libc::mode_t,
                &mut attr as *mut libc::mq_attr,
            )
        };
        if mqd == -1 {
            return Err(TransportError::last_os_error(name));
        }
        Ok(Self {
            name: name.to_string(),
            mqd,
        })
    }
}

impl ControlChannel for PosixQueue {
    fn send_header(&mut self, length: u64) -> Result<(), TransportError> {
        let header = codec::encode_header(length);
        loop {
            let rc = unsafe {
                libc::mq_send(
                    self.mqd,
                    header.as_ptr() as *const libc::c_char,
                    header.len(),
                    0,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(TransportError::Io {
                    object: self.name.clone(),
                    source: err,
                });
            }
        }
    }

    fn receive_header(&mut self) -> Result<u64, TransportError> {
        let mut buf = [0u8; HEADER_LEN];
        loop {
            let received = unsafe {
                libc::mq_receive(
                    self.mqd,
                    buf.as_mut_ptr() as *mut libc::c_char,
                    buf.len(),
                    std::ptr::null_mut(),
                )
            };
            if received >= 0 {
                return codec::decode_header(&buf[..received as usize]);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(TransportError::Io {
                    object: self.name.clone(),
                    source: err,
                });
            }
        }
    }
}

impl Drop for PosixQueue {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.mqd);
        }
    }
}

/// A named shared memory segment, mapped only for the duration of each access.
pub struct PosixRegion {
    name: String,
    c_name: CString,
}

impl PosixRegion {
    pub fn new(name: &str) -> Result<Self, TransportError> {
        Ok(Self {
            name: name.to_string(),
            c_name: object_name(name)?,
        })
    }

    fn open_fd(&self, flags: libc::c_int) -> Result<Fd, TransportError> {
        let fd = unsafe { libc::shm_open(self.c_name.as_ptr(), flags, 0o600 as libc::mode_t) };
        if fd == -1 {
            return Err(TransportError::last_os_error(&self.name));
        }
        Ok(Fd(fd))
    }
}

/// Closes the descriptor on every exit path.
struct Fd(libc::c_int);

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// A live mapping, unmapped on drop.
struct Mapping {
    ptr: *mut libc::c_void,
    len: usize,
}

impl Mapping {
    fn new(fd: &Fd, len: usize, prot: libc::c_int, object: &str) -> Result<Self, TransportError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd.0,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(TransportError::last_os_error(object));
        }
        Ok(Self { ptr, len })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

impl PayloadRegion for PosixRegion {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let fd = self.open_fd(libc::O_CREAT | libc::O_RDWR)?;
        if unsafe { libc::ftruncate(fd.0, bytes.len() as libc::off_t) } == -1 {
            return Err(TransportError::last_os_error(&self.name));
        }
        let mapping = Mapping::new(&fd, bytes.len(), libc::PROT_READ | libc::PROT_WRITE, &self.name)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapping.ptr as *mut u8, bytes.len());
        }
        // msync before the mapping drops so the header can never outrun the payload.
        if unsafe { libc::msync(mapping.ptr, mapping.len, libc::MS_SYNC) } == -1 {
            return Err(TransportError::last_os_error(&self.name));
        }
        Ok(())
    }

    fn read(&mut self, length: usize) -> Result<Vec<u8>, TransportError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let fd = self.open_fd(libc::O_RDONLY)?;
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.0, &mut stat) } == -1 {
            return Err(TransportError::last_os_error(&self.name));
        }
        let available = usize::try_from(stat.st_size).unwrap_or(0);
        if available < length {
            return Err(TransportError::Truncated {
                expected: length,
                available,
            });
        }
        let mapping = Mapping::new(&fd, length, libc::PROT_READ, &self.name)?;
        let mut out = vec![0u8; length];
        unsafe {
            std::ptr::copy_nonoverlapping(mapping.ptr as *const u8, out.as_mut_ptr(), length);
        }
        Ok(out)
    }
}

impl FramedTransport<PosixQueue, PosixRegion> {
    /// Bridge-side transport: requests in, responses out.
    pub fn open(config: &TransportConfig) -> Result<Self, TransportError> {
        Ok(FramedTransport::new(
            PosixQueue::open(&config.request_queue)?,
            PosixRegion::new(&config.request_region)?,
            PosixQueue::open(&config.response_queue)?,
            PosixRegion::new(&config.response_region)?,
        ))
    }
}
