//! Pooled packet buffers.
//!
//! A [`PacketBuf`] owns its storage while a single producer fills it and
//! advances the header offsets. Freezing it into a [`SharedPacket`] hands it
//! to any number of consumers; the storage goes back to the pool when the
//! last reference is dropped.

use crate::protocol::ZoneId;
use crate::{Error, Result};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Default buffer capacity: a full Ethernet frame plus the wire header and slack
pub const DEFAULT_BUF_SIZE: usize = 1528;

/// Default number of idle buffers the pool keeps around
pub const DEFAULT_MAX_CACHED: usize = 4096;

/// Immutable, reference-counted packet handed to ports and queues
pub type SharedPacket = Arc<PacketBuf>;

// ============================================================================
// Pool
// ============================================================================

#[derive(Debug)]
struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
    max_cached: usize,
}

impl PoolShared {
    fn recycle(&self, mut storage: Vec<u8>) {
        storage.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_cached {
                free.push(storage);
            }
        }
    }
}

/// Free list of fixed-size packet buffers
#[derive(Debug, Clone)]
pub struct PacketPool {
    shared: Arc<PoolShared>,
}

impl PacketPool {
    pub fn new(buf_size: usize, max_cached: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
                buf_size,
                max_cached,
            }),
        }
    }

    /// Take a cleared buffer from the pool, allocating when none is idle.
    pub fn acquire(&self) -> PacketBuf {
        let storage = self
            .shared
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| Vec::with_capacity(self.shared.buf_size));
        PacketBuf::with_storage(storage, self.shared.buf_size, Some(self.shared.clone()))
    }

    /// Convenience: acquire and fill with `bytes`.
    pub fn acquire_from(&self, bytes: &[u8]) -> Result<PacketBuf> {
        let mut buf = self.acquire();
        buf.store(bytes)?;
        Ok(buf)
    }

    pub fn buf_size(&self) -> usize {
        self.shared.buf_size
    }

    /// Idle buffers currently cached
    pub fn available(&self) -> usize {
        self.shared.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUF_SIZE, DEFAULT_MAX_CACHED)
    }
}

// ============================================================================
// Buffer
// ============================================================================

/// A packet buffer with mac/network/transport header cursors.
///
/// Network and transport offsets are stored as absolute positions in the
/// data; the setters take them relative to the previous layer.
pub struct PacketBuf {
    data: Vec<u8>,
    capacity: usize,
    mac: usize,
    network: usize,
    transport: usize,
    zone: ZoneId,
    outbound: bool,
    pool: Option<Arc<PoolShared>>,
}

impl PacketBuf {
    fn with_storage(data: Vec<u8>, capacity: usize, pool: Option<Arc<PoolShared>>) -> Self {
        Self {
            data,
            capacity,
            mac: 0,
            network: 0,
            transport: 0,
            zone: 0,
            outbound: false,
            pool,
        }
    }

    /// An unpooled buffer holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let capacity = bytes.len().max(DEFAULT_BUF_SIZE);
        let mut buf = Self::with_storage(Vec::with_capacity(capacity), capacity, None);
        buf.data.extend_from_slice(bytes);
        buf
    }

    /// Overwrite the content with `bytes`.
    pub fn store(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.capacity {
            return Err(Error::BufferOverflow {
                need: bytes.len(),
                avail: self.capacity,
            });
        }
        self.data.clear();
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Grow the data by `n` zeroed bytes and return them for writing.
    pub fn reserve_tail(&mut self, n: usize) -> Result<&mut [u8]> {
        let start = self.data.len();
        if start + n > self.capacity {
            return Err(Error::BufferOverflow {
                need: n,
                avail: self.capacity - start,
            });
        }
        self.data.resize(start + n, 0);
        Ok(&mut self.data[start..])
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The last `n` bytes
    pub fn tail(&self, n: usize) -> &[u8] {
        &self.data[self.data.len().saturating_sub(n)..]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Truncate or zero-extend the data.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.capacity {
            return Err(Error::BufferOverflow {
                need: len,
                avail: self.capacity,
            });
        }
        self.data.resize(len, 0);
        Ok(())
    }

    pub fn set_mac_offset(&mut self, offset: usize) {
        self.mac = offset;
        self.network = offset;
        self.transport = offset;
    }

    /// Network header starts `offset` bytes after the mac header.
    pub fn set_network_offset(&mut self, offset: usize) {
        self.network = self.mac + offset;
        self.transport = self.network;
    }

    /// Transport header starts `offset` bytes after the network header.
    pub fn set_transport_offset(&mut self, offset: usize) {
        self.transport = self.network + offset;
    }

    pub fn network_offset(&self) -> usize {
        self.network
    }

    pub fn transport_offset(&self) -> usize {
        self.transport
    }

    pub fn mac_data(&self) -> &[u8] {
        &self.data[self.mac.min(self.data.len())..]
    }

    pub fn network_data(&self) -> &[u8] {
        &self.data[self.network.min(self.data.len())..]
    }

    pub fn transport_data(&self) -> &[u8] {
        &self.data[self.transport.min(self.data.len())..]
    }

    pub fn network_data_mut(&mut self) -> &mut [u8] {
        let at = self.network.min(self.data.len());
        &mut self.data[at..]
    }

    pub fn transport_data_mut(&mut self) -> &mut [u8] {
        let at = self.transport.min(self.data.len());
        &mut self.data[at..]
    }

    /// Network header and transport region borrowed mutably at once
    pub fn split_network_transport_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let end = self.data.len();
        let network = self.network.min(end);
        let transport = self.transport.clamp(network, end);
        let (head, transport_data) = self.data.split_at_mut(transport);
        (&mut head[network..], transport_data)
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn set_zone(&mut self, zone: ZoneId) {
        self.zone = zone;
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn set_outbound(&mut self, outbound: bool) {
        self.outbound = outbound;
    }

    /// Hand the buffer off for shared, read-only use.
    pub fn freeze(self) -> SharedPacket {
        Arc::new(self)
    }
}

/// Number of live references to a shared packet
pub fn ref_count(pkt: &SharedPacket) -> usize {
    Arc::strong_count(pkt)
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuf")
            .field("len", &self.data.len())
            .field("network", &self.network)
            .field("transport", &self.transport)
            .field("zone", &self.zone)
            .field("outbound", &self.outbound)
            .finish()
    }
}
