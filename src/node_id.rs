//! 160-bit node identifiers and the XOR distance metric.
//!
//! Every participant in the overlay is addressed by a [`NodeId`]: an
//! opaque 160-bit value. The only structure the DHT relies on is the
//! XOR metric — `distance(a, b) = a ^ b` interpreted as a 160-bit
//! unsigned magnitude — which is symmetric and satisfies the triangle
//! inequality, so closeness is well defined and lookups can exploit
//! longest-common-prefix ordering.
//!
//! The application layer addresses peers by string id. That mapping is
//! total and deterministic: a peer id is the lowercase hex rendering
//! of the node id bytes, and [`NodeId::from_hex`] is the inverse.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of bytes in a node identifier (160 bits).
pub const NODE_ID_LEN: usize = 20;

/// Number of bits in the keyspace, which is also the bucket count.
pub const NODE_ID_BITS: usize = NODE_ID_LEN * 8;

/// XOR distance between two identifiers, as a 160-bit magnitude.
pub type Distance = [u8; NODE_ID_LEN];

/// Key type for DHT storage. Keys share the identifier keyspace so
/// values can be placed on the nodes closest to them.
pub type Key = [u8; NODE_ID_LEN];

/// Derive a storage key from arbitrary bytes.
///
/// Keys are the first [`NODE_ID_LEN`] bytes of the blake3 hash of the
/// content, which keys the store by byte content rather than identity.
pub fn key_for_bytes(data: &[u8]) -> Key {
    let digest = blake3::hash(data);
    let mut key = [0u8; NODE_ID_LEN];
    key.copy_from_slice(&digest.as_bytes()[..NODE_ID_LEN]);
    key
}

/// An opaque 160-bit overlay identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Generate a uniformly random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        if getrandom::getrandom(&mut bytes).is_err() {
            // Entropy source unavailable; fall back to the thread RNG.
            use rand::RngCore;
            rand::thread_rng().fill_bytes(&mut bytes);
        }
        Self(bytes)
    }

    /// XOR distance to another identifier.
    pub fn xor_distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Render as the application-layer peer id (lowercase hex).
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse the application-layer peer id back into a node id.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != NODE_ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut out = [0u8; NODE_ID_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Total order on XOR distances (big-endian magnitude comparison).
///
/// ```
/// use lattica::node_id::{distance_cmp, NodeId};
/// use std::cmp::Ordering;
///
/// let target = NodeId::random();
/// let (a, b) = (NodeId::random(), NodeId::random());
/// let da = target.xor_distance(&a);
/// let db = target.xor_distance(&b);
/// if distance_cmp(&da, &db) == Ordering::Less {
///     // a is closer to target than b
/// }
/// ```
pub fn distance_cmp(a: &Distance, b: &Distance) -> std::cmp::Ordering {
    for i in 0..NODE_ID_LEN {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

/// Number of leading all-zero bytes in a distance.
///
/// Bucket placement counts leading zeros at byte granularity: any
/// distance whose first byte is nonzero sorts into the topmost bucket.
pub fn leading_zero_bytes(dist: &Distance) -> usize {
    dist.iter().take_while(|byte| **byte == 0).count()
}

/// Bucket index for a remote identifier relative to `self_id`.
///
/// Index `NODE_ID_BITS - 1 - 8 * leading_zero_bytes(distance)`,
/// clamped into `[0, NODE_ID_BITS - 1]`. A zero distance (the local
/// node itself) has no bucket; callers must refuse it before indexing.
pub fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    let dist = self_id.xor_distance(other);
    let lz = 8 * leading_zero_bytes(&dist);
    if lz >= NODE_ID_BITS {
        // Zero distance; callers exclude the local node, but clamp
        // rather than panic if one slips through.
        return 0;
    }
    NODE_ID_BITS - 1 - lz
}

/// Generate a random identifier that falls inside the given bucket's
/// distance range relative to `self_id`.
///
/// Used by bucket refresh: a lookup toward such an id repopulates the
/// corresponding bucket.
pub fn random_id_in_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let bucket_idx = bucket_idx.min(NODE_ID_BITS - 1);
    let self_bytes = self_id.as_bytes();

    let mut distance = [0u8; NODE_ID_LEN];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self_bytes[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
        }
    }

    // A bucket at index b holds ids whose distance has its first
    // nonzero byte at position (NODE_ID_BITS - 1 - b) / 8.
    let byte_idx = (NODE_ID_BITS - 1 - bucket_idx) / 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    // Force the leading byte nonzero while keeping the rest random.
    distance[byte_idx] |= 0x80;

    let mut target = [0u8; NODE_ID_LEN];
    for i in 0..NODE_ID_LEN {
        target[i] = self_bytes[i] ^ distance[i];
    }

    NodeId::from_bytes(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    fn id_with_byte(idx: usize, b: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[idx] = b;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn distance_to_self_is_zero() {
        let a = NodeId::random();
        assert_eq!(a.xor_distance(&a), [0u8; NODE_ID_LEN]);
    }

    #[test]
    fn distance_is_symmetric() {
        for _ in 0..32 {
            let a = NodeId::random();
            let b = NodeId::random();
            assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        }
    }

    #[test]
    fn distance_satisfies_xor_triangle_inequality() {
        // d(a,b) <= d(a,c) XOR d(c,b) holds with equality under XOR.
        for _ in 0..32 {
            let a = NodeId::random();
            let b = NodeId::random();
            let c = NodeId::random();
            let ab = a.xor_distance(&b);
            let ac = a.xor_distance(&c);
            let cb = c.xor_distance(&b);
            let mut via_c = [0u8; NODE_ID_LEN];
            for i in 0..NODE_ID_LEN {
                via_c[i] = ac[i] ^ cb[i];
            }
            assert_eq!(ab, via_c);
        }
    }

    #[test]
    fn distance_cmp_orders_by_magnitude() {
        let zero = [0u8; NODE_ID_LEN];
        let mut one = [0u8; NODE_ID_LEN];
        one[NODE_ID_LEN - 1] = 1;
        let mut big = [0u8; NODE_ID_LEN];
        big[0] = 0x80;

        assert_eq!(distance_cmp(&zero, &one), Ordering::Less);
        assert_eq!(distance_cmp(&one, &big), Ordering::Less);
        assert_eq!(distance_cmp(&big, &big), Ordering::Equal);
    }

    #[test]
    fn bucket_index_counts_leading_zero_bytes() {
        let local = id_with_byte(0, 0x00);

        // First byte nonzero: topmost bucket regardless of bit position.
        assert_eq!(bucket_index(&local, &id_with_byte(0, 0x01)), 159);
        assert_eq!(bucket_index(&local, &id_with_byte(0, 0x02)), 159);
        assert_eq!(bucket_index(&local, &id_with_byte(0, 0x04)), 159);
        assert_eq!(bucket_index(&local, &id_with_byte(0, 0x80)), 159);

        // Each leading zero byte drops the index by 8.
        assert_eq!(bucket_index(&local, &id_with_byte(1, 0xff)), 151);
        assert_eq!(bucket_index(&local, &id_with_byte(2, 0x01)), 143);
        assert_eq!(bucket_index(&local, &id_with_byte(NODE_ID_LEN - 1, 0x01)), 7);
    }

    #[test]
    fn random_id_in_bucket_lands_in_bucket() {
        let local = NodeId::random();
        for bucket in (0..NODE_ID_BITS).step_by(8).map(|b| NODE_ID_BITS - 1 - b) {
            let id = random_id_in_bucket(&local, bucket);
            assert_eq!(bucket_index(&local, &id), bucket, "bucket {bucket}");
        }
    }

    #[test]
    fn hex_round_trip_is_total() {
        let id = NodeId::random();
        let rendered = id.to_hex();
        assert_eq!(rendered.len(), NODE_ID_LEN * 2);
        assert_eq!(NodeId::from_hex(&rendered).unwrap(), id);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(NodeId::from_hex("abcd").is_err());
        assert!(NodeId::from_hex(&"ff".repeat(NODE_ID_LEN + 1)).is_err());
    }

    #[test]
    fn key_for_bytes_is_deterministic() {
        assert_eq!(key_for_bytes(b"profile:alice"), key_for_bytes(b"profile:alice"));
        assert_ne!(key_for_bytes(b"profile:alice"), key_for_bytes(b"profile:bob"));
    }
}
