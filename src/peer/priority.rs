use std::{hash::Hasher, net::SocketAddr};

/// Canonical peer priority (BEP 40). Mixes both endpoint addresses with
/// crc32-c so that every pair of peers agrees on the same value; used to
/// rank swarm candidates deterministically.
pub fn canonical_peer_priority(mut e1: SocketAddr, mut e2: SocketAddr) -> u32 {
    let mut hasher = crc32c::Crc32cHasher::new(Default::default());
    if e1.ip() == e2.ip() {
        if e1.port() > e2.port() {
            std::mem::swap(&mut e1, &mut e2);
        }
        hasher.write_u16(e1.port());
        hasher.write_u16(e2.port());
        return hasher.finish() as u32;
    }
    if let (SocketAddr::V6(mut e1), SocketAddr::V6(mut e2)) = (e1, e2) {
        if e1 > e2 {
            std::mem::swap(&mut e1, &mut e2);
        }
        let mut offset = 0xff;
        let mut b1 = e1.ip().octets();
        let mut b2 = e2.ip().octets();
        for i in 0..b1.len() {
            if offset == 0xff && b1[i] != b2[i] {
                offset = (i + 1).max(5);
            } else if i > offset {
                b1[i] &= 0x55;
                b2[i] &= 0x55;
            }
        }

        hasher.write(&b1);
        hasher.write(&b2);
        return hasher.finish() as u32;
    }

    if let (SocketAddr::V4(mut e1), SocketAddr::V4(mut e2)) = (e1, e2) {
        if e1 > e2 {
            std::mem::swap(&mut e1, &mut e2);
        }
        let mut b1 = e1.ip().octets();
        let mut b2 = e2.ip().octets();
        let mask = if b1[..2] != b2[..2] {
            [0xff, 0xff, 0x55, 0x55]
        } else if b1[..3] != b2[..3] {
            [0xff, 0xff, 0xff, 0x55]
        } else {
            [0xff, 0xff, 0xff, 0xff]
        };
        for ((b1, b2), mask) in b1.iter_mut().zip(&mut b2).zip(mask) {
            *b1 &= mask;
            *b2 &= mask;
        }

        hasher.write(&b1);
        hasher.write(&b2);
        return hasher.finish() as u32;
    }
    tracing::error!("Peer priority cannot be made of ipv4 and ipv6");
    0
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::canonical_peer_priority;

    #[test]
    fn peer_priority_reference_values() {
        let client = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(123, 213, 32, 10)), 0);
        let peer1 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(98, 76, 54, 32)), 0);
        let peer2 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(123, 213, 32, 234)), 0);
        assert_eq!(canonical_peer_priority(client, peer1), 0xec2d7224);
        assert_eq!(canonical_peer_priority(client, peer2), 0x99568189);
    }

    #[test]
    fn peer_priority_is_symmetric() {
        let a = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881);
        let b = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(172, 16, 5, 7)), 51413);
        assert_eq!(
            canonical_peer_priority(a, b),
            canonical_peer_priority(b, a)
        );
    }
}
