//! Interface addressing and stack tunables

use core::net::Ipv4Addr;
use core::time::Duration;

/// Network configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Local IP address
    pub ip_addr: Ipv4Addr,
    /// Subnet mask
    pub netmask: Ipv4Addr,
    /// Default gateway
    pub gateway: Option<Ipv4Addr>,
}

impl NetworkConfig {
    pub fn new(ip_addr: Ipv4Addr, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Self {
        Self {
            ip_addr,
            netmask,
            gateway,
        }
    }

    /// Check if configuration is usable (IP is not 0.0.0.0)
    pub fn is_valid(&self) -> bool {
        !self.ip_addr.is_unspecified()
    }
}

impl Default for NetworkConfig {
    /// Unconfigured interface
    fn default() -> Self {
        Self {
            ip_addr: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: None,
        }
    }
}

/// Address resolution tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpConfig {
    /// Packets held per unresolved address before sends are refused
    pub max_pending_per_ip: usize,
    /// Age after which an unanswered pending queue is discarded
    pub pending_timeout: Option<Duration>,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            max_pending_per_ip: 16,
            pending_timeout: Some(Duration::from_secs(3)),
        }
    }
}

/// TCP tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConfig {
    /// Maximum segment size we send and advertise
    pub mss: u16,
    /// Retransmission timeout before any backoff
    pub initial_rto: Duration,
    /// Upper bound for the backed-off timeout
    pub max_rto: Duration,
    /// Retransmissions of one segment before the connection is aborted
    pub max_retries: u32,
    /// Length of TIME_WAIT (2 x MSL)
    pub time_wait: Duration,
    /// How long a closed connection waits in FIN_WAIT_2 for the peer's FIN
    pub fin_wait2_timeout: Duration,
    /// Receive buffer capacity; also the largest advertised window
    pub recv_buffer: usize,
    /// Send buffer capacity
    pub send_buffer: usize,
    /// Backlog used when `listen` is given zero
    pub default_backlog: usize,
    /// Base of the initial sequence number generator
    pub isn_seed: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: 1460,
            initial_rto: Duration::from_millis(1000),
            max_rto: Duration::from_secs(120),
            max_retries: 6,
            time_wait: Duration::from_secs(60),
            fin_wait2_timeout: Duration::from_secs(60),
            recv_buffer: 8192,
            send_buffer: 16384,
            default_backlog: 8,
            isn_seed: 0x1000_0000,
        }
    }
}

/// UDP tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpConfig {
    /// Datagrams held per socket before new ones are dropped
    pub rx_queue_len: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self { rx_queue_len: 64 }
    }
}

/// Everything a [`NetStack`](crate::net::stack::NetStack) is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    pub network: NetworkConfig,
    /// Clock advance per call to `tick`; at least one microsecond
    pub tick_period: Duration,
    /// Capacity of the driver receive queue
    pub frame_queue_len: usize,
    /// Deadline applied to suspending socket calls
    pub socket_timeout: Option<Duration>,
    pub arp: ArpConfig,
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
}

impl StackConfig {
    pub fn new(network: NetworkConfig) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_frame_queue_len(mut self, len: usize) -> Self {
        self.frame_queue_len = len;
        self
    }

    pub fn with_arp(mut self, arp: ArpConfig) -> Self {
        self.arp = arp;
        self
    }

    pub fn with_tcp(mut self, tcp: TcpConfig) -> Self {
        self.tcp = tcp;
        self
    }

    pub fn with_udp(mut self, udp: UdpConfig) -> Self {
        self.udp = udp;
        self
    }

    /// Usable address and a tick the microsecond clock can represent
    pub fn is_valid(&self) -> bool {
        self.network.is_valid() && self.tick_period >= Duration::from_micros(1)
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            tick_period: Duration::from_millis(10),
            frame_queue_len: 64,
            socket_timeout: None,
            arp: ArpConfig::default(),
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
        }
    }
}
