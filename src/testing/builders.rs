//! Fluent builders for test packets and batches.

use crate::packet::{Packet, PacketBatch};

/// Byte offset of the trailing test tag, when present.
const TAG_TAIL: usize = 1;

/// A fluent builder assembling packet bytes layer by layer.
///
/// # Example
///
/// ```
/// use flowctx::testing::PacketBuilder;
///
/// let p = PacketBuilder::new()
///     .ethernet(0x0806)
///     .aggregate(0xBEEF)
///     .build();
/// assert_eq!(p.bytes()[12..14], [0x08, 0x06]);
/// ```
#[derive(Default)]
pub struct PacketBuilder {
    bytes: Vec<u8>,
    aggregate: u32,
    tag: Option<u8>,
}

impl PacketBuilder {
    /// An empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a 14-byte Ethernet header with the given EtherType.
    #[must_use]
    pub fn ethernet(mut self, ethertype: u16) -> Self {
        self.bytes.extend_from_slice(&[0u8; 12]);
        self.bytes.extend_from_slice(&ethertype.to_be_bytes());
        self
    }

    /// Append a 20-byte IPv4 header with the given protocol and
    /// addresses.
    ///
    /// # Panics
    ///
    /// Panics on a malformed address literal.
    #[must_use]
    pub fn ipv4(mut self, proto: u8, src: &str, dst: &str) -> Self {
        let src: std::net::Ipv4Addr = src.parse().expect("valid source address");
        let dst: std::net::Ipv4Addr = dst.parse().expect("valid destination address");
        let mut header = [0u8; 20];
        header[0] = 0x45;
        header[8] = 64; // ttl
        header[9] = proto;
        header[12..16].copy_from_slice(&src.octets());
        header[16..20].copy_from_slice(&dst.octets());
        self.bytes.extend_from_slice(&header);
        self
    }

    /// Append transport source and destination ports.
    #[must_use]
    pub fn ports(mut self, sport: u16, dport: u16) -> Self {
        self.bytes.extend_from_slice(&sport.to_be_bytes());
        self.bytes.extend_from_slice(&dport.to_be_bytes());
        self
    }

    /// Append raw bytes.
    #[must_use]
    pub fn payload(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Set the aggregate annotation.
    #[must_use]
    pub fn aggregate(mut self, aggregate: u32) -> Self {
        self.aggregate = aggregate;
        self
    }

    /// Mark the packet with a test tag readable via [`packet_tag`].
    #[must_use]
    pub fn tag(mut self, tag: u8) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Build the packet.
    #[must_use]
    pub fn build(self) -> Packet {
        let mut bytes = self.bytes;
        if let Some(tag) = self.tag {
            bytes.push(tag);
        }
        let mut p = Packet::new(bytes);
        p.set_aggregate(self.aggregate);
        p
    }
}

/// Read the test tag of a packet built with [`PacketBuilder::tag`].
#[must_use]
pub fn packet_tag(p: &Packet) -> u8 {
    p.bytes()[p.len() - TAG_TAIL]
}

/// Builder collecting packets into a [`PacketBatch`].
#[derive(Default)]
pub struct BatchBuilder {
    packets: Vec<Packet>,
}

impl BatchBuilder {
    /// An empty batch builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one packet.
    #[must_use]
    pub fn add(mut self, p: Packet) -> Self {
        self.packets.push(p);
        self
    }

    /// Append each packet produced by `f` over `items`.
    #[must_use]
    pub fn add_each<T>(mut self, items: &[T], f: impl Fn(&T) -> Packet) -> Self {
        for item in items {
            self.packets.push(f(item));
        }
        self
    }

    /// Build the batch.
    #[must_use]
    pub fn build(self) -> PacketBatch {
        PacketBatch::from_packets(self.packets)
    }
}
