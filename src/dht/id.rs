use crate::caps::Entropy;

/// 160 bit Kademlia node id, same keyspace as torrent info hashes
pub type NodeId = [u8; 20];

pub fn random_id(entropy: &dyn Entropy) -> NodeId {
    let mut id = [0u8; 20];
    entropy.fill(&mut id);
    id
}

/// XOR metric between two ids
pub fn distance(a: &NodeId, b: &NodeId) -> NodeId {
    let mut out = [0u8; 20];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Compare two ids by closeness to `target`
pub fn cmp_distance(target: &NodeId, a: &NodeId, b: &NodeId) -> std::cmp::Ordering {
    distance(target, a).cmp(&distance(target, b))
}

/// Random id inside an aligned bucket range `[min, min + mask]`
pub fn random_id_in_range(min: &NodeId, mask: &NodeId, entropy: &dyn Entropy) -> NodeId {
    let mut id = random_id(entropy);
    for i in 0..20 {
        id[i] = (id[i] & mask[i]) | min[i];
    }
    id
}
