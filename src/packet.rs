//! Packet and batch abstractions consumed by the classification engine.
//!
//! The engine only needs three things from a packet: raw byte access at an
//! offset, a length, and a small fixed annotation area. The annotation area
//! carries the 32-bit *aggregate* value (a flow hash set by an upstream
//! element; 0 means "unclassified, bypass the cache"), the VLAN tag, a
//! packet-type tag and a pointer-sized destructor argument used by embedders
//! to recover the backing buffer.
//!
//! Batches are ordered runs of packets. The dispatchers cut and re-form
//! batches so that every emitted batch shares a single flow control block.

/// Coarse packet type tag, set by the receiving element.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PacketType {
    /// Unicast traffic addressed to this host.
    #[default]
    Host,
    /// Broadcast traffic.
    Broadcast,
    /// Multicast traffic.
    Multicast,
    /// Traffic captured for another host.
    OtherHost,
    /// Locally generated traffic.
    Outgoing,
}

/// Fixed-size annotation area carried by every packet.
#[derive(Clone, Copy, Debug, Default)]
pub struct Annotations {
    /// 32-bit aggregate (flow hash). Zero means unclassified.
    pub aggregate: u32,
    /// VLAN TCI, zero when untagged.
    pub vlan: u16,
    /// Packet type tag.
    pub packet_type: PacketType,
    /// Opaque destructor argument (backing-buffer handle on DPDK).
    pub destructor_arg: usize,
}

/// An owned packet: a byte buffer plus annotations.
#[derive(Clone, Debug)]
pub struct Packet {
    data: Vec<u8>,
    /// Annotation area, freely writable by elements.
    pub anno: Annotations,
}

impl Packet {
    /// Wrap a byte buffer into a packet with default annotations.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            anno: Annotations::default(),
        }
    }

    /// Wrap a byte buffer and set the aggregate annotation.
    #[must_use]
    pub fn with_aggregate(data: Vec<u8>, aggregate: u32) -> Self {
        Self {
            data,
            anno: Annotations {
                aggregate,
                ..Annotations::default()
            },
        }
    }

    /// Packet length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length packet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw packet bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable packet bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The aggregate annotation.
    #[must_use]
    pub fn aggregate(&self) -> u32 {
        self.anno.aggregate
    }

    /// Set the aggregate annotation.
    pub fn set_aggregate(&mut self, aggregate: u32) {
        self.anno.aggregate = aggregate;
    }
}

/// An ordered run of packets.
///
/// The engine receives input batches, classifies every packet and re-forms
/// output batches so each one maps to a single FCB.
#[derive(Clone, Debug, Default)]
pub struct PacketBatch {
    packets: Vec<Packet>,
}

impl PacketBatch {
    /// An empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch started from a single packet.
    #[must_use]
    pub fn start_head(p: Packet) -> Self {
        Self { packets: vec![p] }
    }

    /// Build a batch from packets in order.
    #[must_use]
    pub fn from_packets(packets: Vec<Packet>) -> Self {
        Self { packets }
    }

    /// Number of packets in the batch.
    #[must_use]
    pub fn count(&self) -> usize {
        self.packets.len()
    }

    /// True when the batch holds no packets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Append a packet at the tail.
    pub fn push(&mut self, p: Packet) {
        self.packets.push(p);
    }

    /// First packet, if any.
    #[must_use]
    pub fn first(&self) -> Option<&Packet> {
        self.packets.first()
    }

    /// Last packet, if any.
    #[must_use]
    pub fn tail(&self) -> Option<&Packet> {
        self.packets.last()
    }

    /// Iterate over the packets in order.
    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    /// Consume the batch, yielding its packets in order.
    #[must_use]
    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }
}

impl IntoIterator for PacketBatch {
    type Item = Packet;
    type IntoIter = std::vec::IntoIter<Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.into_iter()
    }
}

impl FromIterator<Packet> for PacketBatch {
    fn from_iter<T: IntoIterator<Item = Packet>>(iter: T) -> Self {
        Self {
            packets: iter.into_iter().collect(),
        }
    }
}
