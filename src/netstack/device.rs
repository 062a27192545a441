//! Channel-backed smoltcp device
//!
//! The virtual interface exchanges raw IP packets with the WireGuard device
//! through in-memory queues: packets decapsulated by WireGuard are pushed
//! into the receive queue, packets produced by the stack are drained from
//! the transmit queue and handed to WireGuard for encapsulation.

use smoltcp::phy::{self, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use std::collections::VecDeque;

pub(crate) struct ChannelDevice {
    mtu: usize,
    rx_queue: VecDeque<Vec<u8>>,
    tx_queue: VecDeque<Vec<u8>>,
}

impl ChannelDevice {
    pub(crate) fn new(mtu: usize) -> Self {
        Self {
            mtu,
            rx_queue: VecDeque::new(),
            tx_queue: VecDeque::new(),
        }
    }

    /// Queue an inbound (decapsulated) IP packet for the stack
    pub(crate) fn push_rx(&mut self, packet: Vec<u8>) {
        self.rx_queue.push_back(packet);
    }

    /// Take the next outbound IP packet produced by the stack
    pub(crate) fn pop_tx(&mut self) -> Option<Vec<u8>> {
        self.tx_queue.pop_front()
    }

    pub(crate) fn has_rx(&self) -> bool {
        !self.rx_queue.is_empty()
    }
}

impl phy::Device for ChannelDevice {
    type RxToken<'a>
        = RxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.rx_queue.pop_front()?;
        Some((
            RxToken(packet),
            TxToken {
                queue: &mut self.tx_queue,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxToken {
            queue: &mut self.tx_queue,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

pub(crate) struct RxToken(Vec<u8>);

impl phy::RxToken for RxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = self.0;
        f(&mut packet)
    }
}

pub(crate) struct TxToken<'a> {
    queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> phy::TxToken for TxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = vec![0u8; len];
        let result = f(&mut packet);
        self.queue.push_back(packet);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::phy::{Device, RxToken as _, TxToken as _};

    #[test]
    fn rx_packets_round_trip() {
        let mut device = ChannelDevice::new(1330);
        device.push_rx(vec![0x45, 0, 0, 20]);
        assert!(device.has_rx());

        let (rx, _tx) = device.receive(Instant::now()).unwrap();
        let first = rx.consume(|buf| buf[0]);
        assert_eq!(first, 0x45);
        assert!(!device.has_rx());
    }

    #[test]
    fn tx_packets_are_queued() {
        let mut device = ChannelDevice::new(1330);
        let tx = device.transmit(Instant::now()).unwrap();
        tx.consume(4, |buf| buf.copy_from_slice(&[1, 2, 3, 4]));
        assert_eq!(device.pop_tx(), Some(vec![1, 2, 3, 4]));
        assert_eq!(device.pop_tx(), None);
    }

    #[test]
    fn reports_ip_medium_and_mtu() {
        let device = ChannelDevice::new(1420);
        let caps = device.capabilities();
        assert_eq!(caps.medium, Medium::Ip);
        assert_eq!(caps.max_transmission_unit, 1420);
    }
}
