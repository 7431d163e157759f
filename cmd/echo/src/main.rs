//! Fiber-per-connection TCP echo server.
//!
//! Every connection gets its own fiber; reads park on the reactor
//! instead of blocking a worker thread.
//!
//! ```text
//! WEFT_ECHO_PORT=9900 cargo run -p weft-echo
//! printf 'hello\n' | nc 127.0.0.1 9900
//! ```

use std::os::unix::io::RawFd;
use weft::env::env_get;
use weft::{kinfo, kwarn, IoEvent, IoManager, Runtime};

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn make_listener(port: u16) -> RawFd {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0, "socket() failed");
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
            },
            sin_zero: [0; 8],
        };
        let rc = libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(rc, 0, "bind() failed");
        assert_eq!(libc::listen(fd, 128), 0, "listen() failed");
        set_nonblocking(fd);
        fd
    }
}

/// Echo until EOF. Runs inside a fiber on the reactor pool.
fn serve_connection(io: &IoManager, fd: RawFd) {
    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            let mut written = 0usize;
            while written < n as usize {
                let w = unsafe {
                    libc::write(
                        fd,
                        buf[written..].as_ptr() as *const libc::c_void,
                        n as usize - written,
                    )
                };
                if w > 0 {
                    written += w as usize;
                } else if errno_is_wouldblock() {
                    if io.wait_event(fd, IoEvent::Write).is_err() {
                        break;
                    }
                } else {
                    kwarn!("write on fd {} failed", fd);
                    unsafe { libc::close(fd) };
                    return;
                }
            }
            continue;
        }
        if n == 0 {
            break; // peer closed
        }
        if errno_is_wouldblock() {
            if io.wait_event(fd, IoEvent::Read).is_err() {
                break;
            }
            continue;
        }
        kwarn!("read on fd {} failed", fd);
        break;
    }
    unsafe { libc::close(fd) };
    kinfo!("connection fd {} closed", fd);
}

fn errno_is_wouldblock() -> bool {
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EINTR)
    )
}

fn main() {
    let port: u16 = env_get("WEFT_ECHO_PORT", 9900u64) as u16;
    let rt = Runtime::new(4, "echo").expect("runtime startup failed");
    let listen_fd = make_listener(port);
    kinfo!("echo server listening on 127.0.0.1:{}", port);

    rt.block_on(move || {
        let io = IoManager::current().expect("not on a reactor worker");
        loop {
            let fd = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd >= 0 {
                set_nonblocking(fd);
                kinfo!("accepted connection fd {}", fd);
                let io_conn = io.clone();
                weft::spawn(move || serve_connection(&io_conn, fd));
                continue;
            }
            if errno_is_wouldblock() {
                if io.wait_event(listen_fd, IoEvent::Read).is_err() {
                    break;
                }
                continue;
            }
            kwarn!("accept failed, shutting down");
            break;
        }
    });
}
