//! Thin wrappers over the socket and eventfd calls the broker needs
//!
//! Reads from sockets shared with the agent always pass `MSG_DONTWAIT`
//! instead of flipping `O_NONBLOCK`, since duplicated descriptors share
//! their file status flags with the agent's copies.

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Retry a call while it fails with `EINTR`
pub fn retry_eintr<T, F>(mut f: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn cvt(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn cvt_int(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Create a close-on-exec eventfd holding `initval`
pub fn eventfd(initval: u32) -> io::Result<OwnedFd> {
    let fd = cvt_int(unsafe { libc::eventfd(initval as libc::c_uint, libc::EFD_CLOEXEC) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Blocking read of an eventfd counter
pub fn eventfd_read(fd: RawFd) -> io::Result<u64> {
    let mut value: u64 = 0;
    let n = retry_eintr(|| {
        cvt(unsafe {
            libc::read(
                fd,
                &mut value as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        })
    })?;
    if n != mem::size_of::<u64>() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short eventfd read",
        ));
    }
    Ok(value)
}

/// Add `value` to an eventfd counter
pub fn eventfd_write(fd: RawFd, value: u64) -> io::Result<()> {
    retry_eintr(|| {
        cvt(unsafe {
            libc::write(
                fd,
                &value as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        })
    })?;
    Ok(())
}

/// Connected `SOCK_SEQPACKET` pair, both ends close-on-exec
pub fn seqpacket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as libc::c_int; 2];
    cvt_int(unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Duplicate a descriptor with close-on-exec set
pub fn dup_cloexec(fd: RawFd) -> io::Result<OwnedFd> {
    let new = cvt_int(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

fn recv_flags(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    retry_eintr(|| {
        cvt(unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
            )
        })
    })
}

/// Look at pending bytes without consuming them; never blocks
pub fn peek(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    recv_flags(fd, buf, libc::MSG_PEEK | libc::MSG_DONTWAIT)
}

/// Non-blocking receive
pub fn recv_dontwait(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    recv_flags(fd, buf, libc::MSG_DONTWAIT)
}

/// Receive until `buf` is full, EOF, or an error
pub fn recv_waitall(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    recv_flags(fd, buf, libc::MSG_WAITALL)
}

/// Number of bytes buffered for reading
pub fn bytes_available(fd: RawFd) -> io::Result<usize> {
    let mut avail: libc::c_int = 0;
    cvt_int(unsafe { libc::ioctl(fd, libc::FIONREAD, &mut avail) })?;
    Ok(avail.max(0) as usize)
}

/// Single send without `SIGPIPE`
pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    retry_eintr(|| {
        cvt(unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        })
    })
}

/// Gather-write several buffers in one `sendmsg` without `SIGPIPE`
pub fn send_vectored(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    let mut iovs: Vec<libc::iovec> = bufs
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iovs.as_mut_ptr();
    msg.msg_iovlen = iovs.len() as _;

    retry_eintr(|| cvt(unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) }))
}

fn control_space(fd_count: usize) -> usize {
    unsafe { libc::CMSG_SPACE((fd_count * mem::size_of::<libc::c_int>()) as libc::c_uint) as usize }
}

/// Send `data` with `fds` attached as `SCM_RIGHTS`, as one end-of-record
/// message without `SIGPIPE`
pub fn send_with_fds(fd: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let fds_len = mem::size_of_val(fds);
    let space = control_space(fds.len());
    // u64 backing keeps the cmsghdr aligned
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no room for control message",
            ));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fds_len as libc::c_uint) as _;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr() as *const u8,
            libc::CMSG_DATA(cmsg),
            fds_len,
        );
    }

    retry_eintr(|| {
        cvt(unsafe { libc::sendmsg(fd, &msg, libc::MSG_EOR | libc::MSG_NOSIGNAL) })
    })
}

/// Receive one message and any descriptors passed alongside it
///
/// This is the agent's half of the handoff; the broker itself only sends.
pub fn recv_with_fds(
    fd: RawFd,
    buf: &mut [u8],
    max_fds: usize,
) -> io::Result<(usize, Vec<OwnedFd>)> {
    let space = control_space(max_fds);
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    let n = retry_eintr(|| {
        cvt(unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC) })
    })?;

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const libc::c_int;
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                for i in 0..payload / mem::size_of::<libc::c_int>() {
                    let raw = std::ptr::read_unaligned(data.add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n, fds))
}
