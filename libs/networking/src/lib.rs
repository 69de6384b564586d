//! Host-local network identity pools for microVMs.
//!
//! This library provides the pure building blocks of address management:
//! - IPv4 subnet math (network, gateway, broadcast, netmask)
//! - MAC addresses and locally administered MAC prefixes
//! - TAP interface names bounded by `IFNAMSIZ`
//! - [`Pool`], a fixed-range bitmap allocator generic over a [`SlotCodec`]
//!
//! Pools never derive a value from how many things currently exist. Every
//! value maps to one slot of a fixed range, and a slot is handed out only if
//! it has never been used or was explicitly released.
//!
//! Nothing here is thread-safe on its own; callers that share pools put them
//! behind a lock.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid MAC address or MAC prefix.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Invalid network interface name.
    #[error("invalid interface name: {0}")]
    InvalidInterfaceName(String),

    /// Pool has no free slot left.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    /// Value is outside the range managed by the pool.
    #[error("{value} is outside pool {pool}")]
    OutOfRange { pool: String, value: String },

    /// Value is already allocated.
    #[error("{0} is already allocated")]
    InUse(String),
}

// ============================================================================
// Slot bitmap
// ============================================================================

/// Fixed-capacity bitmap of in-use slots.
///
/// Allocation scans forward from a rotating cursor, so a slot that was just
/// released is handed out again only after the rest of the range has been
/// tried.
#[derive(Debug, Clone)]
pub struct SlotBitmap {
    words: Vec<u64>,
    capacity: usize,
    in_use: usize,
    cursor: usize,
}

impl SlotBitmap {
    /// Create an empty bitmap with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
            in_use: 0,
            cursor: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently set.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.capacity - self.in_use
    }

    /// Whether `slot` is set.
    pub fn is_set(&self, slot: usize) -> bool {
        slot < self.capacity && self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// Claim the next free slot after the cursor.
    pub fn claim_next(&mut self) -> Option<usize> {
        if self.in_use == self.capacity {
            return None;
        }

        for step in 0..self.capacity {
            let slot = (self.cursor + step) % self.capacity;
            if !self.is_set(slot) {
                self.set(slot);
                self.cursor = (slot + 1) % self.capacity;
                return Some(slot);
            }
        }

        None
    }

    /// Claim a specific slot. Returns false if it is taken or out of range.
    pub fn claim(&mut self, slot: usize) -> bool {
        if slot >= self.capacity || self.is_set(slot) {
            return false;
        }
        self.set(slot);
        true
    }

    /// Release a slot. Returns false if it was not set (no-op).
    pub fn release(&mut self, slot: usize) -> bool {
        if !self.is_set(slot) {
            return false;
        }
        self.words[slot / 64] &= !(1 << (slot % 64));
        self.in_use -= 1;
        true
    }

    fn set(&mut self, slot: usize) {
        self.words[slot / 64] |= 1 << (slot % 64);
        self.in_use += 1;
    }
}

// ============================================================================
// Generic pool
// ============================================================================

/// Maps between pool slots and the values handed out for them.
pub trait SlotCodec {
    /// Value type handed out by the pool.
    type Value: Clone + fmt::Display;

    /// Human-readable label used in errors (e.g. the CIDR).
    fn label(&self) -> String;

    /// Number of slots this codec can represent.
    fn capacity(&self) -> usize;

    /// Value for a slot. `slot` is always `< capacity()`.
    fn encode(&self, slot: usize) -> Self::Value;

    /// Slot for a value, if the value belongs to this range.
    fn decode(&self, value: &Self::Value) -> Option<usize>;
}

/// Bitmap-backed pool over the range described by a [`SlotCodec`].
#[derive(Debug, Clone)]
pub struct Pool<C: SlotCodec> {
    codec: C,
    slots: SlotBitmap,
}

impl<C: SlotCodec> Pool<C> {
    /// Create a pool covering the full range of `codec`.
    pub fn new(codec: C) -> Self {
        let slots = SlotBitmap::new(codec.capacity());
        Self { codec, slots }
    }

    /// The codec describing this pool's range.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Allocate a free value.
    pub fn allocate(&mut self) -> Result<C::Value, NetworkError> {
        let slot = self
            .slots
            .claim_next()
            .ok_or_else(|| NetworkError::PoolExhausted(self.codec.label()))?;
        Ok(self.codec.encode(slot))
    }

    /// Claim a specific value (used when rebuilding state after a restart).
    pub fn claim(&mut self, value: &C::Value) -> Result<(), NetworkError> {
        let slot = self
            .codec
            .decode(value)
            .ok_or_else(|| NetworkError::OutOfRange {
                pool: self.codec.label(),
                value: value.to_string(),
            })?;
        if !self.slots.claim(slot) {
            return Err(NetworkError::InUse(value.to_string()));
        }
        Ok(())
    }

    /// Release a value. Releasing a free or foreign value is a no-op.
    pub fn release(&mut self, value: &C::Value) -> bool {
        match self.codec.decode(value) {
            Some(slot) => self.slots.release(slot),
            None => false,
        }
    }

    /// Whether a value is currently allocated.
    pub fn is_allocated(&self, value: &C::Value) -> bool {
        self.codec
            .decode(value)
            .is_some_and(|slot| self.slots.is_set(slot))
    }

    /// Whether a value belongs to this pool's range.
    pub fn contains(&self, value: &C::Value) -> bool {
        self.codec.decode(value).is_some()
    }

    /// Number of allocated values.
    pub fn in_use(&self) -> usize {
        self.slots.in_use()
    }

    /// Number of free values.
    pub fn available(&self) -> usize {
        self.slots.available()
    }

    /// Total number of values in the range.
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }
}

// ============================================================================
// IPv4 subnets
// ============================================================================

/// IPv4 subnet used as a guest address range.
///
/// The network address, the first host address (reserved for the host-side
/// gateway) and the broadcast address are never allocatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

/// Number of addresses at the start of a subnet that are never handed out
/// (network ID and gateway).
const RESERVED_LOW: u32 = 2;

/// Shortest accepted prefix. Bounds the allocation bitmap at 64K slots.
pub const MIN_PREFIX_LEN: u8 = 16;

impl Ipv4Subnet {
    /// Create a subnet. The address is masked to the prefix.
    ///
    /// Prefixes longer than /30 leave no allocatable address and are rejected,
    /// as are prefixes shorter than [`MIN_PREFIX_LEN`].
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len < MIN_PREFIX_LEN {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} is too short (min {})",
                prefix_len, MIN_PREFIX_LEN
            )));
        }
        if prefix_len > 30 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} leaves no allocatable addresses (max 30)",
                prefix_len
            )));
        }

        let mask = mask_bits(prefix_len);
        let network = Ipv4Addr::from(u32::from(address) & mask);

        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "192.168.100.0/24").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Host-side gateway (first host address).
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    /// Broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask_bits(self.prefix_len))
    }

    /// Dotted netmask.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_bits(self.prefix_len))
    }

    /// Check if an address is within this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_bits(self.prefix_len) == u32::from(self.network)
    }

    /// Total number of addresses in the subnet.
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix_len)
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl SlotCodec for Ipv4Subnet {
    type Value = Ipv4Addr;

    fn label(&self) -> String {
        self.to_string()
    }

    fn capacity(&self) -> usize {
        // network, gateway, broadcast
        (self.size() - 3) as usize
    }

    fn encode(&self, slot: usize) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + RESERVED_LOW + slot as u32)
    }

    fn decode(&self, value: &Ipv4Addr) -> Option<usize> {
        if !self.contains(*value) {
            return None;
        }
        let offset = u32::from(*value) - u32::from(self.network);
        let slot = offset.checked_sub(RESERVED_LOW)? as usize;
        (slot < self.capacity()).then_some(slot)
    }
}

fn mask_bits(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

/// Pool of guest IPv4 addresses.
pub type Ipv4Pool = Pool<Ipv4Subnet>;

// ============================================================================
// MAC addresses
// ============================================================================

/// Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Create from raw octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets.
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Locally administered bit (bit 1 of the first octet).
    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// Unicast (bit 0 of the first octet clear).
    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets = parse_hex_octets::<6>(s)?;
        Ok(Self(octets))
    }
}

fn parse_hex_octets<const N: usize>(s: &str) -> Result<[u8; N], NetworkError> {
    let mut out = [0u8; N];
    let mut parts = s.split(':');
    for octet in out.iter_mut() {
        let part = parts
            .next()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| NetworkError::InvalidMac(s.to_string()))?;
        *octet =
            u8::from_str_radix(part, 16).map_err(|_| NetworkError::InvalidMac(s.to_string()))?;
    }
    if parts.next().is_some() {
        return Err(NetworkError::InvalidMac(s.to_string()));
    }
    Ok(out)
}

/// Largest number of MACs a 3-octet prefix can address (suffix 0 excluded).
pub const MAC_SUFFIX_MAX: usize = 0xFF_FFFF;

/// MAC range `{prefix}:{suffix}` where the prefix is three octets and the
/// suffix runs from 1 to `size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacRange {
    prefix: [u8; 3],
    size: usize,
}

impl MacRange {
    /// Create a range. The prefix must be locally administered and unicast.
    pub fn new(prefix: [u8; 3], size: usize) -> Result<Self, NetworkError> {
        if prefix[0] & 0x02 == 0 || prefix[0] & 0x01 != 0 {
            return Err(NetworkError::InvalidMac(format!(
                "prefix {:02x}:{:02x}:{:02x} must be locally administered unicast",
                prefix[0], prefix[1], prefix[2]
            )));
        }
        if size == 0 || size > MAC_SUFFIX_MAX {
            return Err(NetworkError::InvalidMac(format!(
                "range size {} must be between 1 and {}",
                size, MAC_SUFFIX_MAX
            )));
        }
        Ok(Self { prefix, size })
    }

    /// Parse a `aa:bb:cc` prefix.
    pub fn parse_prefix(s: &str) -> Result<[u8; 3], NetworkError> {
        parse_hex_octets::<3>(s)
    }
}

impl SlotCodec for MacRange {
    type Value = MacAddr;

    fn label(&self) -> String {
        format!(
            "{:02x}:{:02x}:{:02x}:xx:xx:xx",
            self.prefix[0], self.prefix[1], self.prefix[2]
        )
    }

    fn capacity(&self) -> usize {
        self.size
    }

    fn encode(&self, slot: usize) -> MacAddr {
        let suffix = (slot + 1) as u32;
        MacAddr([
            self.prefix[0],
            self.prefix[1],
            self.prefix[2],
            (suffix >> 16) as u8,
            (suffix >> 8) as u8,
            suffix as u8,
        ])
    }

    fn decode(&self, value: &MacAddr) -> Option<usize> {
        let o = value.octets();
        if o[..3] != self.prefix {
            return None;
        }
        let suffix = (usize::from(o[3]) << 16) | (usize::from(o[4]) << 8) | usize::from(o[5]);
        (1..=self.size).contains(&suffix).then(|| suffix - 1)
    }
}

/// Pool of guest MAC addresses.
pub type MacPool = Pool<MacRange>;

// ============================================================================
// TAP interface names
// ============================================================================

/// Longest interface name the kernel accepts (`IFNAMSIZ - 1`).
pub const IFNAME_MAX_LEN: usize = 15;

/// Validated host network interface name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TapName(String);

impl TapName {
    /// Validate an interface name.
    pub fn new(name: impl Into<String>) -> Result<Self, NetworkError> {
        let name = name.into();
        let valid_chars = name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
        if name.is_empty() || name.len() > IFNAME_MAX_LEN || !valid_chars {
            return Err(NetworkError::InvalidInterfaceName(name));
        }
        Ok(Self(name))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TapName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// TAP naming scheme `{prefix}{index}` for `index in 0..size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapRange {
    prefix: String,
    size: usize,
}

impl TapRange {
    /// Create a range, checking that the longest generated name still fits
    /// in an interface name.
    pub fn new(prefix: &str, size: usize) -> Result<Self, NetworkError> {
        if size == 0 {
            return Err(NetworkError::InvalidInterfaceName(format!(
                "{prefix}: TAP range must not be empty"
            )));
        }
        // validates charset and length of the widest name
        TapName::new(format!("{}{}", prefix, size - 1))?;
        Ok(Self {
            prefix: prefix.to_string(),
            size,
        })
    }
}

impl SlotCodec for TapRange {
    type Value = TapName;

    fn label(&self) -> String {
        format!("{}[0..{}]", self.prefix, self.size)
    }

    fn capacity(&self) -> usize {
        self.size
    }

    fn encode(&self, slot: usize) -> TapName {
        TapName(format!("{}{}", self.prefix, slot))
    }

    fn decode(&self, value: &TapName) -> Option<usize> {
        let digits = value.as_str().strip_prefix(self.prefix.as_str())?;
        // reject non-canonical forms such as "tap01"
        if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
            return None;
        }
        let index: usize = digits.parse().ok()?;
        (index < self.size).then_some(index)
    }
}

/// Pool of TAP interface names.
pub type TapPool = Pool<TapRange>;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_ipv4_subnet() {
        let subnet = Ipv4Subnet::from_cidr("192.168.100.17/24").unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(192, 168, 100, 0));
        assert_eq!(subnet.gateway(), Ipv4Addr::new(192, 168, 100, 1));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(192, 168, 100, 255));
        assert_eq!(subnet.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 100, 200)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 168, 101, 2)));
    }

    #[test]
    fn test_ipv4_subnet_rejects_tiny_prefix() {
        assert!(Ipv4Subnet::from_cidr("10.0.0.0/31").is_err());
        assert!(Ipv4Subnet::from_cidr("10.0.0.0").is_err());
        assert!(Ipv4Subnet::from_cidr("10.0.0/24").is_err());
    }

    #[test]
    fn test_ipv4_subnet_rejects_wide_prefix() {
        for cidr in ["0.0.0.0/0", "10.0.0.0/8", "10.0.0.0/15"] {
            assert!(
                matches!(Ipv4Subnet::from_cidr(cidr), Err(NetworkError::InvalidPrefix(_))),
                "{cidr} accepted"
            );
        }
        assert!(Ipv4Subnet::new(Ipv4Addr::new(10, 0, 0, 0), MIN_PREFIX_LEN - 1).is_err());

        let widest = Ipv4Subnet::from_cidr("10.0.0.0/16").unwrap();
        assert_eq!(Ipv4Pool::new(widest).capacity(), 65_533);
    }

    #[test]
    fn test_ipv4_pool_excludes_reserved_addresses() {
        let subnet = Ipv4Subnet::from_cidr("10.0.0.0/29").unwrap();
        let mut pool = Ipv4Pool::new(subnet);
        assert_eq!(pool.capacity(), 5);

        let mut handed_out = Vec::new();
        while let Ok(ip) = pool.allocate() {
            handed_out.push(ip);
        }

        assert_eq!(handed_out.len(), 5);
        assert!(!handed_out.contains(&subnet.network()));
        assert!(!handed_out.contains(&subnet.gateway()));
        assert!(!handed_out.contains(&subnet.broadcast()));
        assert_eq!(handed_out[0], Ipv4Addr::new(10, 0, 0, 2));
        assert!(matches!(pool.allocate(), Err(NetworkError::PoolExhausted(_))));
    }

    #[test]
    fn test_ipv4_pool_claim_rejects_reserved() {
        let subnet = Ipv4Subnet::from_cidr("10.0.0.0/24").unwrap();
        let mut pool = Ipv4Pool::new(subnet);

        assert!(matches!(
            pool.claim(&subnet.gateway()),
            Err(NetworkError::OutOfRange { .. })
        ));
        assert!(pool.claim(&Ipv4Addr::new(10, 0, 0, 9)).is_ok());
        assert!(matches!(
            pool.claim(&Ipv4Addr::new(10, 0, 0, 9)),
            Err(NetworkError::InUse(_))
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let subnet = Ipv4Subnet::from_cidr("10.0.0.0/24").unwrap();
        let mut pool = Ipv4Pool::new(subnet);
        let ip = pool.allocate().unwrap();

        assert!(pool.release(&ip));
        assert!(!pool.release(&ip));
        assert!(!pool.release(&Ipv4Addr::new(172, 16, 0, 1)));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_released_slot_is_not_immediately_reused() {
        let subnet = Ipv4Subnet::from_cidr("10.0.0.0/24").unwrap();
        let mut pool = Ipv4Pool::new(subnet);
        let first = pool.allocate().unwrap();
        pool.release(&first);

        let second = pool.allocate().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_mac_range() {
        let prefix = MacRange::parse_prefix("02:fc:00").unwrap();
        let range = MacRange::new(prefix, 3).unwrap();
        let mut pool = MacPool::new(range);

        let mac = pool.allocate().unwrap();
        assert_eq!(mac.to_string(), "02:fc:00:00:00:01");
        assert!(mac.is_locally_administered());
        assert!(mac.is_unicast());

        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert!(pool.allocate().is_err());

        let foreign: MacAddr = "02:fd:00:00:00:01".parse().unwrap();
        assert!(!pool.contains(&foreign));
    }

    #[test]
    fn test_mac_range_rejects_global_prefix() {
        assert!(MacRange::new([0x00, 0x1b, 0x21], 10).is_err());
        assert!(MacRange::new([0x03, 0x00, 0x00], 10).is_err());
        assert!(MacRange::new([0x02, 0x00, 0x00], 0).is_err());
    }

    #[test]
    fn test_mac_parse() {
        let mac: MacAddr = "02:FC:00:0a:0b:0c".parse().unwrap();
        assert_eq!(mac.octets(), [0x02, 0xfc, 0x00, 0x0a, 0x0b, 0x0c]);
        assert!("02:fc:00:0a:0b".parse::<MacAddr>().is_err());
        assert!("02:fc:00:0a:0b:0c:0d".parse::<MacAddr>().is_err());
        assert!("02:fc:00:0a:0b:zz".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_tap_range() {
        let range = TapRange::new("fc-tap", 256).unwrap();
        let mut pool = TapPool::new(range);

        let tap = pool.allocate().unwrap();
        assert_eq!(tap.as_str(), "fc-tap0");

        let foreign = TapName::new("fc-tap01").unwrap();
        assert!(!pool.contains(&foreign));
        let out_of_range = TapName::new("fc-tap256").unwrap();
        assert!(!pool.contains(&out_of_range));
    }

    #[test]
    fn test_tap_range_respects_ifnamsiz() {
        assert!(TapRange::new("very-long-tap-", 100).is_err());
        assert!(TapRange::new("tap", 1000).is_ok());
        assert!(TapRange::new("tap/", 10).is_err());
        assert!(TapName::new("").is_err());
    }

    proptest! {
        #[test]
        fn pool_never_hands_out_a_held_value(ops in proptest::collection::vec(any::<Option<u8>>(), 1..200)) {
            let subnet = Ipv4Subnet::from_cidr("10.1.0.0/28").unwrap();
            let mut pool = Ipv4Pool::new(subnet);
            let mut held: Vec<Ipv4Addr> = Vec::new();

            for op in ops {
                match op {
                    // allocate
                    None => match pool.allocate() {
                        Ok(ip) => {
                            prop_assert!(!held.contains(&ip));
                            held.push(ip);
                        }
                        Err(_) => prop_assert_eq!(held.len(), pool.capacity()),
                    },
                    // release one of the held values
                    Some(i) if !held.is_empty() => {
                        let ip = held.swap_remove(usize::from(i) % held.len());
                        prop_assert!(pool.release(&ip));
                    }
                    Some(_) => {}
                }
                prop_assert_eq!(pool.in_use(), held.len());
                let unique: HashSet<_> = held.iter().collect();
                prop_assert_eq!(unique.len(), held.len());
            }
        }
    }
}
