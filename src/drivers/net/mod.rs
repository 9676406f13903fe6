// Network Device Abstraction Layer
//
// The driver boundary of the stack: a NIC driver implements `NetworkDevice`
// for transmission and pushes received frames through a `FrameSink`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use crossbeam_queue::ArrayQueue;
use thiserror::Error;

use crate::net::ethernet::MacAddress;

/// link status of a network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
    Unknown,
}

/// Errors that can occur during packet transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransmitError {
    /// Packet too large for the device
    #[error("packet too large for device")]
    PacketTooLarge,
    /// TX buffer is full, try again later
    #[error("transmit buffer full")]
    BufferFull,
    /// Device is not ready
    #[error("device not ready")]
    NotReady,
    /// Hardware error during transmission
    #[error("hardware error")]
    HardwareError,
}

/// Errors that can occur when a driver hands a frame to the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReceiveError {
    /// The stack's receive queue is full; the frame was dropped
    #[error("receive queue full")]
    QueueFull,
    /// Frame is larger than any valid Ethernet frame
    #[error("frame too large")]
    PacketTooLarge,
}

/// Network device trait that all network drivers must implement
pub trait NetworkDevice: Send {
    /// Get the MAC address of this device
    fn mac_address(&self) -> MacAddress;

    /// Transmit a packet
    ///
    /// # Arguments
    /// * `packet` - The raw Ethernet frame to transmit (including header)
    ///
    /// # Returns
    /// * `Ok(())` if the packet was queued for transmission
    /// * `Err(TransmitError)` if transmission failed
    fn transmit(&mut self, packet: &[u8]) -> Result<(), TransmitError>;

    /// Receive a packet if one is available
    ///
    /// Drivers that deliver frames from interrupt context through a
    /// [`FrameSink`] can leave this returning `None`.
    fn receive(&mut self) -> Option<Vec<u8>>;

    /// Get the current link status
    fn link_status(&self) -> LinkStatus;

    /// Get device name/identifier
    fn device_name(&self) -> &str;

    /// Check if the device is initialized and ready
    fn is_ready(&self) -> bool {
        self.link_status() == LinkStatus::Up
    }
}

impl<T: NetworkDevice + ?Sized> NetworkDevice for Box<T> {
    fn mac_address(&self) -> MacAddress {
        (**self).mac_address()
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<(), TransmitError> {
        (**self).transmit(packet)
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        (**self).receive()
    }

    fn link_status(&self) -> LinkStatus {
        (**self).link_status()
    }

    fn device_name(&self) -> &str {
        (**self).device_name()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

/// Largest frame a sink accepts (header + MTU + FCS + VLAN slack)
pub const MAX_FRAME_SIZE: usize = 1522;

/// Receive path handed to a driver once at init.
///
/// `deliver` is lock-free and may be called from an interrupt handler; the
/// stack drains the queue in arrival order on its next `poll`.
#[derive(Clone)]
pub struct FrameSink {
    queue: Arc<ArrayQueue<Vec<u8>>>,
}

impl FrameSink {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    /// Hand a received frame to the stack
    pub fn deliver(&self, frame: &[u8]) -> Result<(), ReceiveError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ReceiveError::PacketTooLarge);
        }
        self.queue
            .push(frame.to_vec())
            .map_err(|_| ReceiveError::QueueFull)
    }

    /// Number of frames waiting to be processed
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn pop(&self) -> Option<Vec<u8>> {
        self.queue.pop()
    }
}
