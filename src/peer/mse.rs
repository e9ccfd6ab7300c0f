//! Message Stream Encryption / Protocol Encryption handshake.
//!
//! Both ends derive a shared secret over the 768-bit MSE DH group, prove
//! knowledge of the torrent's info hash (the SKEY), and agree on either
//! rc4 or plaintext for the rest of the stream. Driven synchronously from
//! the connection state machine: feed inbound bytes, get outbound bytes
//! and eventually an established cipher pair.

use anyhow::{bail, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crypto_bigint::{
    modular::constant_mod::{Residue, ResidueParams},
    Encoding, U768,
};
use rc4::{consts::U20, Key, KeyInit, Rc4, StreamCipher};

use crate::caps::Entropy;

crypto_bigint::impl_modulus!(
    P,
    U768,
    "ffffffffffffffffc90fdaa22168c234c4c6628b80dc1cd129024e088a67cc74020bbea63b139b22514a08798e3404ddef9519b3cd3a431b302b0a6df25f14374fe1356d6d51c245e485b576625e7ec6f44c42e9a63a36210000000000090563"
);
const TWO: U768 = U768::from_u8(2);
const G: Residue<P, { P::LIMBS }> = crypto_bigint::const_residue!(TWO, P);

pub const DH_KEY_BYTES: usize = 768 / 8;
const MAX_PADDING: usize = 512;

const VC: [u8; 8] = [0u8; 8];
pub const CRYPTO_PLAINTEXT: u32 = 0x01;
pub const CRYPTO_RC4: u32 = 0x02;

const RC4_KEY_A: &[u8] = b"keyA"; // A-to-B traffic
const RC4_KEY_B: &[u8] = b"keyB"; // B-to-A traffic
const RC4_DISCARD: usize = 1024;

fn sha1_concat(parts: &[&[u8]]) -> [u8; 20] {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn generate_private_key(entropy: &dyn Entropy) -> U768 {
    let mut bytes = [0u8; DH_KEY_BYTES];
    entropy.fill(&mut bytes);
    // Clear the top bit to stay below the modulus
    bytes[0] &= 0x7f;
    U768::from_be_slice(&bytes)
}

fn compute_public_key(private_key: &U768) -> U768 {
    G.pow(private_key).retrieve()
}

fn compute_secret(peer_public_key: &U768, private_key: &U768) -> U768 {
    let peer_public_key = crypto_bigint::const_residue!(peer_public_key, P);
    peer_public_key.pow(private_key).retrieve()
}

/// Rc4 stream with the spec'd first kilobyte of keystream dropped
pub struct MseRc4(Rc4<U20>);

impl std::fmt::Debug for MseRc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MseRc4").finish()
    }
}

impl MseRc4 {
    fn new(key: &[u8; 20]) -> Self {
        let mut rc4 = Rc4::new(Key::<U20>::from_slice(key));
        let mut discard = [0u8; RC4_DISCARD];
        rc4.apply_keystream(&mut discard);
        Self(rc4)
    }

    pub fn apply(&mut self, buffer: &mut [u8]) {
        self.0.apply_keystream(buffer);
    }

    /// `(decrypt, encrypt)` pair for the connecting side
    fn connect_pair(secret: &[u8; DH_KEY_BYTES], skey: &[u8]) -> (Self, Self) {
        let key_a = sha1_concat(&[RC4_KEY_A, secret, skey]);
        let key_b = sha1_concat(&[RC4_KEY_B, secret, skey]);
        (Self::new(&key_b), Self::new(&key_a))
    }

    /// `(decrypt, encrypt)` pair for the accepting side
    fn accept_pair(secret: &[u8; DH_KEY_BYTES], skey: &[u8]) -> (Self, Self) {
        let key_a = sha1_concat(&[RC4_KEY_A, secret, skey]);
        let key_b = sha1_concat(&[RC4_KEY_B, secret, skey]);
        (Self::new(&key_a), Self::new(&key_b))
    }
}

/// Stream ciphers once the handshake settled. Plaintext when the peers
/// agreed on CRYPTO_PLAINTEXT.
#[derive(Debug)]
pub struct Established {
    pub decrypt: Option<MseRc4>,
    pub encrypt: Option<MseRc4>,
}

impl Established {
    pub fn plaintext() -> Self {
        Self {
            decrypt: None,
            encrypt: None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypt.is_some()
    }

    pub fn decrypt(&mut self, buffer: &mut [u8]) {
        if let Some(cipher) = &mut self.decrypt {
            cipher.apply(buffer);
        }
    }

    pub fn encrypt(&mut self, buffer: &mut [u8]) {
        if let Some(cipher) = &mut self.encrypt {
            cipher.apply(buffer);
        }
    }
}

#[derive(Debug)]
pub enum Progress {
    /// Need more inbound bytes
    Pending,
    /// Handshake is done; leftovers are already decrypted stream bytes
    Established(Established),
}

fn put_random_padding(buffer: &mut BytesMut, entropy: &dyn Entropy) {
    let mut padding = [0u8; MAX_PADDING];
    let size = entropy.random_u32() as usize % (MAX_PADDING + 1);
    entropy.fill(&mut padding[..size]);
    buffer.put_slice(&padding[..size]);
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Incremental search for `pattern` within the first `upper_bound` bytes
/// of the stream. Consumes scanned bytes from `buf`.
#[derive(Debug)]
struct Resync {
    pattern: Vec<u8>,
    upper_bound: usize,
    scanned: usize,
}

impl Resync {
    fn new(pattern: Vec<u8>, upper_bound: usize) -> Self {
        Self {
            pattern,
            upper_bound,
            scanned: 0,
        }
    }

    fn step(&mut self, buf: &mut BytesMut) -> anyhow::Result<bool> {
        if buf.len() < self.pattern.len() {
            return Ok(false);
        }
        match find_subslice(buf, &self.pattern) {
            Some(i) => {
                let end = i + self.pattern.len();
                ensure!(
                    self.scanned + end <= self.upper_bound,
                    "synchronization marker not found within {} bytes",
                    self.upper_bound
                );
                buf.advance(end);
                Ok(true)
            }
            None => {
                ensure!(
                    self.scanned + buf.len() <= self.upper_bound,
                    "synchronization marker not found within {} bytes",
                    self.upper_bound
                );
                let keep = self.pattern.len() - 1;
                let consume = buf.len() - keep;
                self.scanned += consume;
                buf.advance(consume);
                Ok(false)
            }
        }
    }
}

#[derive(Debug)]
enum InitiatorState {
    AwaitPubKey,
    AwaitVc(Resync),
    AwaitSelect,
    AwaitPadding { select: u32, padding: Option<usize> },
    Done,
}

/// Connecting side of the handshake
#[derive(Debug)]
pub struct Initiator {
    info_hash: [u8; 20],
    private_key: U768,
    decrypt: Option<MseRc4>,
    encrypt: Option<MseRc4>,
    state: InitiatorState,
    crypto_provide: u32,
}

impl Initiator {
    /// Returns the handshake driver and the first outbound message
    pub fn new(info_hash: [u8; 20], entropy: &dyn Entropy) -> (Self, Bytes) {
        let private_key = generate_private_key(entropy);
        let public_key = compute_public_key(&private_key);
        let mut first = BytesMut::with_capacity(DH_KEY_BYTES + MAX_PADDING);
        first.put_slice(&public_key.to_be_bytes());
        put_random_padding(&mut first, entropy);
        (
            Self {
                info_hash,
                private_key,
                decrypt: None,
                encrypt: None,
                state: InitiatorState::AwaitPubKey,
                crypto_provide: CRYPTO_PLAINTEXT | CRYPTO_RC4,
            },
            first.freeze(),
        )
    }

    /// Feed inbound bytes. Anything the other end must see is appended to
    /// `out`.
    pub fn on_data(&mut self, buf: &mut BytesMut, out: &mut BytesMut) -> anyhow::Result<Progress> {
        loop {
            match &mut self.state {
                InitiatorState::AwaitPubKey => {
                    if buf.len() < DH_KEY_BYTES {
                        return Ok(Progress::Pending);
                    }
                    let peer_public = U768::from_be_slice(&buf[..DH_KEY_BYTES]);
                    buf.advance(DH_KEY_BYTES);
                    let secret = compute_secret(&peer_public, &self.private_key).to_be_bytes();
                    let (decrypt, encrypt) = MseRc4::connect_pair(&secret, &self.info_hash);
                    self.decrypt = Some(decrypt);
                    self.encrypt = Some(encrypt);

                    // HASH('req1', S), HASH('req2', SKEY) xor HASH('req3', S)
                    out.put_slice(&sha1_concat(&[b"req1", &secret]));
                    let mut hash_2 = sha1_concat(&[b"req2", &self.info_hash]);
                    let hash_3 = sha1_concat(&[b"req3", &secret]);
                    for (a, b) in hash_2.iter_mut().zip(hash_3) {
                        *a ^= b;
                    }
                    out.put_slice(&hash_2);

                    // ENCRYPT(VC, crypto_provide, len(padC), padC, len(IA))
                    let start = out.len();
                    out.put_slice(&VC);
                    out.put_u32(self.crypto_provide);
                    out.put_u16(0); // empty padC
                    out.put_u16(0); // empty IA
                    let encrypt = self.encrypt.as_mut().unwrap();
                    encrypt.apply(&mut out[start..]);

                    // the expected VC arrives encrypted with the peer's key
                    let mut vc = VC;
                    self.decrypt.as_mut().unwrap().apply(&mut vc);
                    self.state =
                        InitiatorState::AwaitVc(Resync::new(vc.to_vec(), MAX_PADDING + VC.len()));
                }
                InitiatorState::AwaitVc(resync) => {
                    if !resync.step(buf)? {
                        return Ok(Progress::Pending);
                    }
                    self.state = InitiatorState::AwaitSelect;
                }
                InitiatorState::AwaitSelect => {
                    if buf.len() < 4 {
                        return Ok(Progress::Pending);
                    }
                    self.decrypt.as_mut().unwrap().apply(&mut buf[..4]);
                    let select = buf.get_u32();
                    ensure!(
                        select & self.crypto_provide != 0,
                        "peer selected crypto we did not provide: {select:#x}"
                    );
                    self.state = InitiatorState::AwaitPadding {
                        select,
                        padding: None,
                    };
                }
                InitiatorState::AwaitPadding { select, padding } => {
                    if padding.is_none() {
                        if buf.len() < 2 {
                            return Ok(Progress::Pending);
                        }
                        self.decrypt.as_mut().unwrap().apply(&mut buf[..2]);
                        let len = buf.get_u16() as usize;
                        ensure!(len <= MAX_PADDING, "padD is too long: {len}");
                        *padding = Some(len);
                    }
                    let pad_len = padding.unwrap();
                    if buf.len() < pad_len {
                        return Ok(Progress::Pending);
                    }
                    self.decrypt.as_mut().unwrap().apply(&mut buf[..pad_len]);
                    buf.advance(pad_len);

                    let established = if *select & CRYPTO_RC4 != 0 {
                        let mut decrypt = self.decrypt.take().unwrap();
                        // leftover stream bytes are already encrypted
                        decrypt.apply(&mut buf[..]);
                        Established {
                            decrypt: Some(decrypt),
                            encrypt: self.encrypt.take(),
                        }
                    } else {
                        Established::plaintext()
                    };
                    self.state = InitiatorState::Done;
                    return Ok(Progress::Established(established));
                }
                InitiatorState::Done => bail!("handshake is already finished"),
            }
        }
    }
}

#[derive(Debug)]
enum ResponderState {
    AwaitPubKey,
    AwaitReq1(Resync),
    AwaitSkeyHash,
    AwaitProvide,
    AwaitPadC { padding: Option<usize> },
    AwaitInitial { length: Option<usize> },
    Done,
}

/// Accepting side of the handshake. Needs the info hashes of every
/// torrent we serve to resolve the SKEY proof.
#[derive(Debug)]
pub struct Responder {
    known_hashes: Vec<[u8; 20]>,
    private_key: U768,
    secret: [u8; DH_KEY_BYTES],
    decrypt: Option<MseRc4>,
    encrypt: Option<MseRc4>,
    state: ResponderState,
    selected: u32,
    /// Which torrent the peer asked for
    pub info_hash: Option<[u8; 20]>,
}

impl Responder {
    pub fn new(known_hashes: Vec<[u8; 20]>, entropy: &dyn Entropy) -> Self {
        Self {
            known_hashes,
            private_key: generate_private_key(entropy),
            secret: [0; DH_KEY_BYTES],
            decrypt: None,
            encrypt: None,
            state: ResponderState::AwaitPubKey,
            selected: 0,
            info_hash: None,
        }
    }

    pub fn on_data(
        &mut self,
        buf: &mut BytesMut,
        out: &mut BytesMut,
        entropy: &dyn Entropy,
    ) -> anyhow::Result<Progress> {
        loop {
            match &mut self.state {
                ResponderState::AwaitPubKey => {
                    if buf.len() < DH_KEY_BYTES {
                        return Ok(Progress::Pending);
                    }
                    let peer_public = U768::from_be_slice(&buf[..DH_KEY_BYTES]);
                    buf.advance(DH_KEY_BYTES);
                    let public_key = compute_public_key(&self.private_key);
                    out.put_slice(&public_key.to_be_bytes());
                    put_random_padding(out, entropy);

                    self.secret = compute_secret(&peer_public, &self.private_key).to_be_bytes();
                    let req1 = sha1_concat(&[b"req1", &self.secret]);
                    self.state = ResponderState::AwaitReq1(Resync::new(
                        req1.to_vec(),
                        MAX_PADDING + req1.len(),
                    ));
                }
                ResponderState::AwaitReq1(resync) => {
                    if !resync.step(buf)? {
                        return Ok(Progress::Pending);
                    }
                    self.state = ResponderState::AwaitSkeyHash;
                }
                ResponderState::AwaitSkeyHash => {
                    if buf.len() < 20 {
                        return Ok(Progress::Pending);
                    }
                    let secret = self.secret;
                    let mut obfuscated = [0u8; 20];
                    obfuscated.copy_from_slice(&buf[..20]);
                    buf.advance(20);
                    let hash_3 = sha1_concat(&[b"req3", &secret]);
                    let mut matched = None;
                    for info_hash in &self.known_hashes {
                        let mut expected = sha1_concat(&[b"req2", info_hash]);
                        for (a, b) in expected.iter_mut().zip(hash_3) {
                            *a ^= b;
                        }
                        if expected == obfuscated {
                            matched = Some(*info_hash);
                            break;
                        }
                    }
                    let Some(info_hash) = matched else {
                        bail!("skey proof does not match any known torrent");
                    };
                    self.info_hash = Some(info_hash);
                    let (decrypt, encrypt) = MseRc4::accept_pair(&secret, &info_hash);
                    self.decrypt = Some(decrypt);
                    self.encrypt = Some(encrypt);
                    self.state = ResponderState::AwaitProvide;
                }
                ResponderState::AwaitProvide => {
                    if buf.len() < VC.len() + 4 {
                        return Ok(Progress::Pending);
                    }
                    let decrypt = self.decrypt.as_mut().unwrap();
                    decrypt.apply(&mut buf[..VC.len() + 4]);
                    ensure!(&buf[..VC.len()] == VC, "verification constant mismatch");
                    buf.advance(VC.len());
                    let provide = buf.get_u32();
                    let select = if provide & CRYPTO_RC4 != 0 {
                        CRYPTO_RC4
                    } else if provide & CRYPTO_PLAINTEXT != 0 {
                        CRYPTO_PLAINTEXT
                    } else {
                        bail!("peer provided no supported crypto: {provide:#x}");
                    };
                    self.selected = select;

                    // ENCRYPT(VC, crypto_select, len(padD))
                    let start = out.len();
                    out.put_slice(&VC);
                    out.put_u32(select);
                    out.put_u16(0);
                    self.encrypt.as_mut().unwrap().apply(&mut out[start..]);
                    self.state = ResponderState::AwaitPadC { padding: None };
                }
                ResponderState::AwaitPadC { padding } => {
                    if padding.is_none() {
                        if buf.len() < 2 {
                            return Ok(Progress::Pending);
                        }
                        self.decrypt.as_mut().unwrap().apply(&mut buf[..2]);
                        let len = buf.get_u16() as usize;
                        ensure!(len <= MAX_PADDING, "padC is too long: {len}");
                        *padding = Some(len);
                    }
                    let pad_len = padding.unwrap();
                    if buf.len() < pad_len {
                        return Ok(Progress::Pending);
                    }
                    self.decrypt.as_mut().unwrap().apply(&mut buf[..pad_len]);
                    buf.advance(pad_len);
                    self.state = ResponderState::AwaitInitial { length: None };
                }
                ResponderState::AwaitInitial { length } => {
                    if length.is_none() {
                        if buf.len() < 2 {
                            return Ok(Progress::Pending);
                        }
                        self.decrypt.as_mut().unwrap().apply(&mut buf[..2]);
                        let len = buf.get_u16() as usize;
                        *length = Some(len);
                    }
                    let initial_len = length.unwrap();
                    if buf.len() < initial_len {
                        return Ok(Progress::Pending);
                    }
                    // The initial payload is always carried under rc4;
                    // later bytes only when rc4 was selected.
                    let mut decrypt = self.decrypt.take().unwrap();
                    decrypt.apply(&mut buf[..initial_len]);
                    let established = if self.selected & CRYPTO_RC4 != 0 {
                        decrypt.apply(&mut buf[initial_len..]);
                        Established {
                            decrypt: Some(decrypt),
                            encrypt: self.encrypt.take(),
                        }
                    } else {
                        Established::plaintext()
                    };
                    self.state = ResponderState::Done;
                    return Ok(Progress::Established(established));
                }
                ResponderState::Done => bail!("handshake is already finished"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use crate::caps::memory::SeededEntropy;

    use super::*;

    fn run_handshake(known: Vec<[u8; 20]>, info_hash: [u8; 20]) -> anyhow::Result<()> {
        let entropy_a = SeededEntropy::new(11);
        let entropy_b = SeededEntropy::new(22);
        let (mut initiator, first) = Initiator::new(info_hash, &entropy_a);
        let mut responder = Responder::new(known, &entropy_b);

        let mut a_to_b = BytesMut::from(&first[..]);
        let mut b_to_a = BytesMut::new();

        let mut a_done = None;
        let mut b_done = None;
        // enough rounds for both sides to settle
        for _ in 0..8 {
            if b_done.is_none() {
                let mut out = BytesMut::new();
                if let Progress::Established(e) =
                    responder.on_data(&mut a_to_b, &mut out, &entropy_b)?
                {
                    b_done = Some(e);
                }
                b_to_a.extend_from_slice(&out);
            }
            if a_done.is_none() {
                let mut out = BytesMut::new();
                if let Progress::Established(e) = initiator.on_data(&mut b_to_a, &mut out)? {
                    a_done = Some(e);
                }
                a_to_b.extend_from_slice(&out);
            }
        }
        let mut a = a_done.expect("initiator finished");
        let mut b = b_done.expect("responder finished");
        assert!(a.is_encrypted());
        assert!(b.is_encrypted());
        assert_eq!(responder.info_hash, Some(info_hash));

        // bytes survive a full encrypt/decrypt round in both directions
        let mut payload = b"\x13BitTorrent protocol".to_vec();
        a.encrypt(&mut payload);
        b.decrypt(&mut payload);
        assert_eq!(&payload, b"\x13BitTorrent protocol");
        let mut reply = b"pong".to_vec();
        b.encrypt(&mut reply);
        a.decrypt(&mut reply);
        assert_eq!(&reply, b"pong");
        Ok(())
    }

    #[test]
    fn full_handshake_establishes_rc4() {
        let info_hash = [7u8; 20];
        run_handshake(vec![[1u8; 20], info_hash], info_hash).unwrap();
    }

    #[test]
    fn unknown_info_hash_is_rejected() {
        let info_hash = [7u8; 20];
        assert!(run_handshake(vec![[1u8; 20]], info_hash).is_err());
    }
}
