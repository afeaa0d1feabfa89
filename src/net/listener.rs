//! Non-blocking TCP listen socket

use std::io;
use std::mem;
use std::net::{SocketAddrV4, TcpStream};
use std::os::unix::io::{FromRawFd, RawFd};
use std::ptr;

use tracing::info;

use crate::error::{MaelstromError, Result};

/// Listening socket: non-blocking, close-on-exec, `SO_REUSEADDR`.
pub struct Listener {
    fd: RawFd,
}

impl Listener {
    /// Bind and listen on an IPv4 address such as `"127.0.0.1:7600"`.
    /// Port 0 picks an ephemeral port; see [`local_port`].
    ///
    /// [`local_port`]: Self::local_port
    pub fn bind(addr: &str) -> Result<Self> {
        let addr: SocketAddrV4 = addr
            .parse()
            .map_err(|_| MaelstromError::config(format!("invalid listen address: {addr}")))?;

        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(MaelstromError::socket(format!(
                "socket() failed: {}",
                io::Error::last_os_error()
            )));
        }
        let listener = Self { fd };

        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(MaelstromError::socket(format!(
                "setsockopt(SO_REUSEADDR) failed: {}",
                io::Error::last_os_error()
            )));
        }

        let sockaddr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: addr.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(*addr.ip()).to_be(),
            },
            sin_zero: [0; 8],
        };
        let rc = unsafe {
            libc::bind(
                fd,
                &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(MaelstromError::socket(format!(
                "bind({addr}) failed: {}",
                io::Error::last_os_error()
            )));
        }

        let rc = unsafe { libc::listen(fd, libc::SOMAXCONN) };
        if rc < 0 {
            return Err(MaelstromError::socket(format!(
                "listen() failed: {}",
                io::Error::last_os_error()
            )));
        }

        info!(%addr, "listening");
        Ok(listener)
    }

    /// Accept one pending connection, already non-blocking and close-on-exec.
    /// `Ok(None)` means the accept would block (no more pending connections).
    pub fn accept(&self) -> Result<Option<TcpStream>> {
        let fd = unsafe {
            libc::accept4(
                self.fd,
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(err.into()),
            };
        }
        Ok(Some(unsafe { TcpStream::from_raw_fd(fd) }))
    }

    /// Actual bound port (useful with ephemeral binds).
    pub fn local_port(&self) -> Result<u16> {
        let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut sockaddr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(u16::from_be(sockaddr.sin_port))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_and_accept() {
        let listener = Listener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_port().unwrap();
        assert!(port > 0);

        // Nothing pending yet.
        assert!(listener.accept().unwrap().is_none());

        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // Non-blocking accept; the connection may take a moment to land.
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(s) = listener.accept().unwrap() {
                accepted = Some(s);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(accepted.is_some());
        drop(client);
    }

    #[test]
    fn test_bind_rejects_garbage_address() {
        assert!(Listener::bind("not-an-address").is_err());
    }
}
