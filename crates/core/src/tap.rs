//! External interface I/O.
//!
//! [`LinkPort`] is the seam between a bridge's I/O tasks and the OS: the
//! production implementation is a tap device attached by name, tests use an
//! in-memory pair. Creation and teardown of the interfaces themselves is
//! outside the emulator; [`TapDevice::attach`] expects the device to be
//! provisionable via `/dev/net/tun` (pre-created persistent taps included).

use std::{
    future::Future,
    io,
    os::fd::{AsRawFd, OwnedFd},
};

use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

/// Largest frame read off an interface in one go; tap frames are bounded
/// by the device MTU plus the Ethernet header.
const READ_BUF_LEN: usize = 65_536;

/// One raw-frame port on the external side of a bridge.
pub trait LinkPort: Send + Sync + 'static {
    /// Waits for the next frame from the external side.
    fn recv_frame(&self) -> impl Future<Output = io::Result<Bytes>> + Send;

    /// Writes one frame to the external side.
    fn send_frame(&self, frame: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// A tap device attached through `/dev/net/tun`.
#[derive(Debug)]
pub struct TapDevice {
    name: String,
    fd: AsyncFd<OwnedFd>,
}

impl TapDevice {
    /// Attaches to the named tap device in frame mode (`IFF_TAP`, no
    /// packet-info header) and registers it with the tokio reactor.
    ///
    /// Must be called from within a runtime. Fails if the name does not
    /// fit an interface name, the clone device cannot be opened, or the
    /// ioctl is refused (missing device or missing capability).
    pub fn attach(name: &str) -> io::Result<Self> {
        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name {name:?} does not fit IFNAMSIZ"),
            ));
        }

        let clone = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;
        let fd = OwnedFd::from(clone);

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

        // SAFETY: fd is a valid tun clone descriptor and ifr is a properly
        // initialized ifreq; the kernel only reads it.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETIFF as _, &mut ifr) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        set_nonblocking(&fd)?;
        Ok(Self {
            name: name.to_owned(),
            fd: AsyncFd::new(fd)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: plain fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl LinkPort for TapDevice {
    fn recv_frame(&self) -> impl Future<Output = io::Result<Bytes>> + Send {
        async move {
            loop {
                let mut guard = self.fd.readable().await?;
                let mut buf = vec![0u8; READ_BUF_LEN];
                match guard.try_io(|inner| {
                    // SAFETY: buf outlives the call and its length is passed.
                    let n = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(Ok(n)) => {
                        buf.truncate(n);
                        return Ok(Bytes::from(buf));
                    }
                    Ok(Err(err)) => return Err(err),
                    Err(_would_block) => continue,
                }
            }
        }
    }

    fn send_frame(&self, frame: &[u8]) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| {
                    // SAFETY: frame is valid for the length passed.
                    let n = unsafe {
                        libc::write(
                            inner.as_raw_fd(),
                            frame.as_ptr() as *const libc::c_void,
                            frame.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    // Tap writes are packet-atomic; a short write does not
                    // happen on a frame-mode device.
                    Ok(Ok(_)) => return Ok(()),
                    Ok(Err(err)) => return Err(err),
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

/// In-memory stand-in for a tap device.
///
/// The port side behaves like [`TapDevice`]; the paired [`MemoryLinkHost`]
/// plays the external host, injecting frames toward the bridge and
/// observing what the bridge wrote out.
pub struct MemoryLink {
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    tx: mpsc::Sender<Bytes>,
}

/// The external-host side of a [`MemoryLink`].
pub struct MemoryLinkHost {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl MemoryLink {
    /// Builds a connected port/host pair with the given queue depth.
    pub fn pair(capacity: usize) -> (MemoryLink, MemoryLinkHost) {
        let (inject_tx, inject_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            MemoryLink {
                rx: tokio::sync::Mutex::new(inject_rx),
                tx: out_tx,
            },
            MemoryLinkHost {
                tx: inject_tx,
                rx: out_rx,
            },
        )
    }
}

impl LinkPort for MemoryLink {
    fn recv_frame(&self) -> impl Future<Output = io::Result<Bytes>> + Send {
        async move {
            self.rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "link host closed"))
        }
    }

    fn send_frame(&self, frame: &[u8]) -> impl Future<Output = io::Result<()>> + Send {
        let frame = Bytes::copy_from_slice(frame);
        async move {
            self.tx
                .send(frame)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link host closed"))
        }
    }
}

impl MemoryLinkHost {
    /// Pushes a frame toward the bridge, as a host writing on its tap.
    pub async fn inject(&self, frame: Bytes) -> io::Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link port closed"))
    }

    /// Next frame the bridge wrote out, or `None` once the port is gone.
    pub async fn written(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`written`](Self::written).
    pub fn try_written(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}
