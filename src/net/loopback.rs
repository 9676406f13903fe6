//! Loopback and crossover network devices
//!
//! A [`LoopbackDevice`] echoes every transmitted frame back as a received
//! one, so a single stack can talk to itself without hardware.
//! [`LoopbackDevice::pair`] builds two ends of a virtual cable instead: what
//! one end transmits, the other receives.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::drivers::net::{LinkStatus, MAX_FRAME_SIZE, NetworkDevice, TransmitError};
use crate::net::ethernet::MacAddress;

type FrameQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// In-memory network device
pub struct LoopbackDevice {
    mac: MacAddress,
    /// Frames waiting to be received by this end
    rx_queue: FrameQueue,
    /// Where transmitted frames go; the same queue as `rx_queue` for loopback
    tx_queue: FrameQueue,
    /// Maximum queue size to prevent unbounded memory growth
    max_queue_size: usize,
    link: LinkStatus,
    name: &'static str,
}

impl LoopbackDevice {
    /// Create a loopback device
    ///
    /// # Arguments
    /// * `mac` - Address the device reports
    /// * `max_queue_size` - Maximum number of frames held before transmit fails
    pub fn new(mac: MacAddress, max_queue_size: usize) -> Self {
        let queue: FrameQueue = Arc::new(Mutex::new(VecDeque::with_capacity(max_queue_size)));
        Self {
            mac,
            rx_queue: queue.clone(),
            tx_queue: queue,
            max_queue_size,
            link: LinkStatus::Up,
            name: "lo (loopback)",
        }
    }

    /// Two devices joined back to back
    pub fn pair(mac_a: MacAddress, mac_b: MacAddress, max_queue_size: usize) -> (Self, Self) {
        let a_to_b: FrameQueue = Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a: FrameQueue = Arc::new(Mutex::new(VecDeque::new()));

        let a = Self {
            mac: mac_a,
            rx_queue: b_to_a.clone(),
            tx_queue: a_to_b.clone(),
            max_queue_size,
            link: LinkStatus::Up,
            name: "veth0",
        };
        let b = Self {
            mac: mac_b,
            rx_queue: a_to_b,
            tx_queue: b_to_a,
            max_queue_size,
            link: LinkStatus::Up,
            name: "veth1",
        };
        (a, b)
    }

    /// Take the link down or up; transmit fails while it is down
    pub fn set_link(&mut self, link: LinkStatus) {
        self.link = link;
    }

    /// Frames waiting to be received
    pub fn pending(&self) -> usize {
        self.rx_queue.lock().len()
    }

    /// Remove every frame waiting to be received, as if lost on the wire
    pub fn take_pending(&mut self) -> Vec<Vec<u8>> {
        self.rx_queue.lock().drain(..).collect()
    }
}

impl NetworkDevice for LoopbackDevice {
    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<(), TransmitError> {
        if self.link != LinkStatus::Up {
            return Err(TransmitError::NotReady);
        }
        if packet.len() > MAX_FRAME_SIZE {
            return Err(TransmitError::PacketTooLarge);
        }

        let mut queue = self.tx_queue.lock();
        if queue.len() >= self.max_queue_size {
            return Err(TransmitError::BufferFull);
        }
        queue.push_back(packet.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.rx_queue.lock().pop_front()
    }

    fn link_status(&self) -> LinkStatus {
        self.link
    }

    fn device_name(&self) -> &str {
        self.name
    }
}
