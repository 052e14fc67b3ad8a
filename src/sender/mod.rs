//! FLUTE transmitter: turns submitted objects into paced ALC/LCT packets
//! over UDP multicast.

use crate::common::oti::FecScheme;
use crate::ipsec::{self, EspProvisioner};
use crate::tools::{
    self,
    error::{FluteError, Result},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod session;

pub use session::{PacketBatch, SenderSession};

/// Called with the TOI of every fully transmitted object
pub type CompletionCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Worst case ALC header: LCT base + CCI + TSI/TOI + EXT_FDT + EXT_FTI
const ALC_HEADER_SIZE: u32 = 32;
const UDP_HEADER_SIZE: u32 = 8;
const SBN_ESI_SIZE: u32 = 4;

/// Backoff of the pacer when no object has symbols to transmit
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

///
/// Configuration of a [`Transmitter`]
///
#[derive(Clone)]
pub struct Config {
    /// Path MTU the packets are sized for
    pub mtu: u16,
    /// Transmit budget in kilobit per second, 0 disables pacing
    pub rate_limit_kbps: u32,
    /// FEC scheme applied to data objects
    pub fec_scheme: FecScheme,
    /// Period of the FDT carousel
    pub fdt_repeat_interval: Duration,
    /// Host IPsec collaborator used by [`Transmitter::enable_ipsec`]
    pub esp_provisioner: Option<Arc<dyn EspProvisioner>>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("mtu", &self.mtu)
            .field("rate_limit_kbps", &self.rate_limit_kbps)
            .field("fec_scheme", &self.fec_scheme)
            .field("fdt_repeat_interval", &self.fdt_repeat_interval)
            .field("esp_provisioner", &self.esp_provisioner.is_some())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: 1500,
            rate_limit_kbps: 0,
            fec_scheme: FecScheme::CompactNoCode,
            fdt_repeat_interval: Duration::from_secs(5),
            esp_provisioner: None,
        }
    }
}

struct TransmitterInner {
    session: Mutex<SenderSession>,
    socket: tokio::net::UdpSocket,
    endpoint: SocketAddr,
    rate_limit_kbps: u32,
    completion_cb: Mutex<Option<CompletionCallback>>,
    running: AtomicBool,
}

///
/// FLUTE session sender.
///
/// Owns one UDP socket and two timers on the injected runtime: the packet
/// pacer and the FDT carousel. Objects submitted with [`Transmitter::send`]
/// are announced in the FDT, paced onto the wire and reported through the
/// completion callback once fully transmitted.
///
pub struct Transmitter {
    inner: Arc<TransmitterInner>,
    config: Config,
    pacer: tokio::task::JoinHandle<()>,
    fdt_timer: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmitter")
            .field("endpoint", &self.inner.endpoint)
            .field("config", &self.config)
            .finish()
    }
}

impl Transmitter {
    ///
    /// Create a transmitter for the session `(address, port, tsi)` and start
    /// its pacer on `handle`
    ///
    pub fn new(
        address: IpAddr,
        port: u16,
        tsi: u64,
        config: Config,
        handle: &tokio::runtime::Handle,
    ) -> Result<Self> {
        let ip_header_size: u32 = match address {
            IpAddr::V4(_) => 20,
            IpAddr::V6(_) => 40,
        };
        let max_payload = (config.mtu as u32)
            .checked_sub(ip_header_size + UDP_HEADER_SIZE + ALC_HEADER_SIZE + SBN_ESI_SIZE)
            .filter(|&len| len > 0)
            .ok_or_else(|| FluteError::Config(format!("MTU {} is too small", config.mtu)))?;

        let session = SenderSession::new(
            tsi,
            max_payload,
            config.fec_scheme,
            config.fdt_repeat_interval.as_secs(),
        )?;

        let endpoint = SocketAddr::new(address, port);
        let socket = Self::create_socket(&endpoint, handle)?;

        let inner = Arc::new(TransmitterInner {
            session: Mutex::new(session),
            socket,
            endpoint,
            rate_limit_kbps: config.rate_limit_kbps,
            completion_cb: Mutex::new(None),
            running: AtomicBool::new(true),
        });

        let pacer = handle.spawn(Self::pacer_loop(inner.clone()));
        let fdt_timer = handle.spawn(Self::fdt_tick_loop(
            inner.clone(),
            config.fdt_repeat_interval,
        ));

        Ok(Transmitter {
            inner,
            config,
            pacer,
            fdt_timer,
        })
    }

    fn create_socket(
        endpoint: &SocketAddr,
        handle: &tokio::runtime::Handle,
    ) -> Result<tokio::net::UdpSocket> {
        let domain = match endpoint {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if endpoint.is_ipv4() {
            socket.set_multicast_loop_v4(true)?;
        } else {
            socket.set_multicast_loop_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        let bind_addr: SocketAddr = match endpoint {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
            SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
        };
        socket.bind(&bind_addr.into())?;

        let _guard = handle.enter();
        Ok(tokio::net::UdpSocket::from_std(socket.into())?)
    }

    /// Install the outbound ESP state and policy for this session
    pub fn enable_ipsec(&self, spi: u32, aes_hex_key: &str) -> Result<()> {
        ipsec::enable_esp(
            self.config.esp_provisioner.as_deref(),
            spi,
            self.inner.endpoint.ip(),
            ipsec::Direction::Out,
            aes_hex_key,
        )
    }

    ///
    /// Submit one object for delivery, returns its TOI.
    ///
    /// `expires` is an epoch timestamp published in the FDT entry, see
    /// [`Transmitter::seconds_since_epoch`].
    ///
    pub fn send(
        &self,
        content_location: &url::Url,
        content_type: &str,
        expires: u64,
        data: Vec<u8>,
    ) -> Result<u64> {
        let mut session = self.inner.session.lock().unwrap();
        session.send(
            content_location,
            content_type,
            expires,
            data,
            tools::seconds_since_epoch(),
        )
    }

    /// Current time as Unix seconds
    pub fn seconds_since_epoch() -> u64 {
        tools::seconds_since_epoch()
    }

    /// Register the function called with the TOI of every fully
    /// transmitted object
    pub fn register_completion_callback<F>(&self, callback: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        *self.inner.completion_cb.lock().unwrap() = Some(Box::new(callback));
    }

    /// Number of objects in transfer, the FDT included
    pub fn nb_objects(&self) -> usize {
        self.inner.session.lock().unwrap().nb_objects()
    }

    async fn pacer_loop(inner: Arc<TransmitterInner>) {
        while inner.running.load(Ordering::Relaxed) {
            let batch = inner.session.lock().unwrap().next_packet();
            let batch = match batch {
                Some(batch) => batch,
                None => {
                    tokio::time::sleep(IDLE_BACKOFF).await;
                    continue;
                }
            };

            let sent = inner.socket.send_to(&batch.data, inner.endpoint).await;
            if let Err(error) = &sent {
                log::debug!("send_to error: {}", error);
            }

            let completed = inner.session.lock().unwrap().mark_sent(
                batch.toi,
                &batch.symbols,
                sent.is_ok(),
                tools::seconds_since_epoch(),
            );

            match completed {
                Ok(tois) => {
                    if !tois.is_empty() {
                        let callback = inner.completion_cb.lock().unwrap();
                        if let Some(callback) = callback.as_ref() {
                            tois.iter().for_each(|toi| callback(*toi));
                        }
                    }
                }
                Err(error) => log::warn!("fail to account transmission: {}", error),
            }

            if inner.rate_limit_kbps == 0 {
                tokio::task::yield_now().await;
            } else {
                let secs =
                    (batch.data.len() as f64 * 8.0) / (inner.rate_limit_kbps as f64 * 1000.0);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            }
        }
    }

    async fn fdt_tick_loop(inner: Arc<TransmitterInner>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        while inner.running.load(Ordering::Relaxed) {
            interval.tick().await;
            let refreshed = inner
                .session
                .lock()
                .unwrap()
                .refresh_fdt(tools::seconds_since_epoch());
            if let Err(error) = refreshed {
                log::warn!("fail to refresh the FDT: {}", error);
            }
        }
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Relaxed);
        self.pacer.abort();
        self.fdt_timer.abort();
    }
}
