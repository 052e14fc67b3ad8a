//! FLUTE receiver: ingests ALC/LCT datagrams from a UDP socket, discovers
//! the FDT and reassembles the announced files.

use crate::ipsec::{self, EspProvisioner};
use crate::tools::error::{FluteError, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

mod session;

pub use session::{ReceiverSession, SharedObject};

/// Called with every fully received object
pub type CompletionCallback = Box<dyn Fn(SharedObject) + Send + Sync>;

/// Largest datagram accepted from the socket
const MAX_DATAGRAM_SIZE: usize = 2048;

/// Kernel receive buffer requested for the session socket
const RECV_BUFFER_SIZE: usize = 16 * 1024 * 1024;

///
/// Configuration of a [`Receiver`]
///
#[derive(Clone, Default)]
pub struct Config {
    /// Host IPsec collaborator used by [`Receiver::enable_ipsec`]
    pub esp_provisioner: Option<Arc<dyn EspProvisioner>>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("esp_provisioner", &self.esp_provisioner.is_some())
            .finish()
    }
}

struct ReceiverInner {
    session: Mutex<ReceiverSession>,
    completion_cb: Mutex<Option<CompletionCallback>>,
    running: AtomicBool,
    socket: tokio::net::UdpSocket,
}

///
/// FLUTE session receiver.
///
/// Binds `(iface, port)`, joins the multicast group and dispatches incoming
/// datagrams on the injected runtime. Completed objects are delivered
/// through the completion callback; without one they stay in the session,
/// observable with [`Receiver::file_list`] and reclaimed by the maintenance
/// calls.
///
pub struct Receiver {
    inner: Arc<ReceiverInner>,
    mcast_address: IpAddr,
    config: Config,
    task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("mcast_address", &self.mcast_address)
            .field("config", &self.config)
            .finish()
    }
}

impl Receiver {
    ///
    /// Join the session `(mcast_address, port, tsi)` on the interface with
    /// address `iface` and start dispatching on `handle`
    ///
    pub fn new(
        iface: IpAddr,
        mcast_address: IpAddr,
        port: u16,
        tsi: u64,
        config: Config,
        handle: &tokio::runtime::Handle,
    ) -> Result<Self> {
        let socket = Self::create_socket(iface, mcast_address, port, handle)?;

        let inner = Arc::new(ReceiverInner {
            session: Mutex::new(ReceiverSession::new(tsi)),
            completion_cb: Mutex::new(None),
            running: AtomicBool::new(true),
            socket,
        });

        let task = handle.spawn(Self::receive_loop(inner.clone()));

        Ok(Receiver {
            inner,
            mcast_address,
            config,
            task,
        })
    }

    fn create_socket(
        iface: IpAddr,
        mcast_address: IpAddr,
        port: u16,
        handle: &tokio::runtime::Handle,
    ) -> Result<tokio::net::UdpSocket> {
        let domain = match iface {
            IpAddr::V4(_) => socket2::Domain::IPV4,
            IpAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if let Err(error) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            log::warn!("fail to size the receive buffer: {}", error);
        }
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(iface, port).into())?;

        match (mcast_address, iface) {
            (IpAddr::V4(mcast), IpAddr::V4(iface)) if mcast.is_multicast() => {
                socket.join_multicast_v4(&mcast, &iface)?;
                socket.set_multicast_loop_v4(true)?;
            }
            (IpAddr::V6(mcast), IpAddr::V6(_)) if mcast.is_multicast() => {
                socket.join_multicast_v6(&mcast, 0)?;
                socket.set_multicast_loop_v6(true)?;
            }
            _ => {}
        }

        let _guard = handle.enter();
        Ok(tokio::net::UdpSocket::from_std(socket.into())?)
    }

    /// Local address of the session socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Install the inbound ESP state and policy for this session
    pub fn enable_ipsec(&self, spi: u32, aes_hex_key: &str) -> Result<()> {
        ipsec::enable_esp(
            self.config.esp_provisioner.as_deref(),
            spi,
            self.mcast_address,
            ipsec::Direction::In,
            aes_hex_key,
        )
    }

    /// Register the function called with every fully received object
    pub fn register_completion_callback<F>(&self, callback: F)
    where
        F: Fn(SharedObject) + Send + Sync + 'static,
    {
        *self.inner.completion_cb.lock().unwrap() = Some(Box::new(callback));
    }

    /// Snapshot of the objects of the session
    pub fn file_list(&self) -> Vec<SharedObject> {
        self.inner.session.lock().unwrap().file_list()
    }

    /// Drop objects that received no completion for `max_age_seconds`
    pub fn remove_expired_files(&self, max_age_seconds: u64) {
        self.inner.session.lock().unwrap().remove_expired_files(
            Duration::from_secs(max_age_seconds),
            SystemTime::now(),
        );
    }

    /// Drop every object with this content location
    pub fn remove_file_with_content_location(&self, location: &str) {
        self.inner
            .session
            .lock()
            .unwrap()
            .remove_file_with_content_location(location);
    }

    /// Stop the dispatcher, the next receive observes the flag and returns
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
    }

    async fn receive_loop(inner: Arc<ReceiverInner>) {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            if !inner.running.load(Ordering::Relaxed) {
                log::debug!("stopping reception");
                return;
            }

            let received = inner.socket.recv_from(&mut buffer).await;
            let len = match received {
                Ok((len, _src)) => len,
                Err(error) => {
                    log::error!("receive_from error: {}", error);
                    return;
                }
            };
            log::trace!("received {} bytes", len);

            if !inner.running.load(Ordering::Relaxed) {
                return;
            }

            let deliver = inner.completion_cb.lock().unwrap().is_some();
            let completed = inner.session.lock().unwrap().push(&buffer[..len], deliver);
            match completed {
                Ok(objects) => {
                    if !objects.is_empty() {
                        let callback = inner.completion_cb.lock().unwrap();
                        if let Some(callback) = callback.as_ref() {
                            objects.into_iter().for_each(|object| callback(object));
                        }
                    }
                }
                Err(FluteError::SessionMismatch(reason)) => {
                    log::debug!("discarding packet: {}", reason)
                }
                Err(error) => log::warn!("failed to decode ALC/FLUTE packet: {}", error),
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Relaxed);
        self.task.abort();
    }
}
