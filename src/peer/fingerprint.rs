use anyhow::Context;

/// Azureus style prefix we stamp on generated peer ids
const ID_PREFIX: &[u8; 8] = b"-RP0100-";

pub fn generate_peer_id(entropy: &dyn crate::caps::Entropy) -> [u8; 20] {
    let mut id = [0u8; 20];
    entropy.fill(&mut id);
    id[..ID_PREFIX.len()].copy_from_slice(ID_PREFIX);
    id
}

/// Client name decoded from a peer id. Covers the three encodings that
/// are actually seen in the wild.
#[derive(Debug, Clone, Default)]
pub struct Fingerprint {
    name: Box<[u8]>,
    major: u32,
    minor: u32,
    revision: u32,
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{name} {major}.{minor}.{revision}",
            name = self.client_name(),
            major = self.major,
            minor = self.minor,
            revision = self.revision,
        )
    }
}

impl Fingerprint {
    fn parse_azureus_style(id: &[u8; 20]) -> anyhow::Result<Self> {
        anyhow::ensure!(id[0] == b'-', "first byte must be dash");
        anyhow::ensure!(id[7] == b'-', "8th byte must be dash");
        anyhow::ensure!(id[1].is_ascii());
        anyhow::ensure!(id[2].is_ascii());

        let name: [u8; 2] = [id[1], id[2]];
        let major = char::from(id[3]).to_digit(10).context("parse major")?;
        let minor = char::from(id[4]).to_digit(10).context("parse minor")?;
        let revision = char::from(id[5]).to_digit(10).context("parse revision")?;

        Ok(Self {
            name: Box::new(name),
            major,
            minor,
            revision,
        })
    }

    fn parse_shadow_style(id: &[u8; 20]) -> anyhow::Result<Self> {
        let first = char::from(id[0]);
        anyhow::ensure!(first.is_alphanumeric());
        anyhow::ensure!(&id[4..6] == b"--");
        let major = char::from(id[1]).to_digit(10).context("major version")?;
        let minor = char::from(id[2]).to_digit(10).context("minor version")?;
        let revision = char::from(id[3]).to_digit(10).context("revision version")?;

        Ok(Self {
            name: Box::new([id[0]]),
            major,
            minor,
            revision,
        })
    }

    fn parse_mainline_style(id: &[u8; 20]) -> anyhow::Result<Self> {
        let str = std::str::from_utf8(id)?;
        let (first_char, rest) = str
            .chars()
            .next()
            .zip(str.get(1..))
            .context("split off first char")?;
        anyhow::ensure!(first_char.is_ascii_graphic());
        let parts: Vec<_> = rest.splitn(4, '-').collect();
        anyhow::ensure!(parts.len() == 4);
        let major = parts[0].parse().context("parse major")?;
        let minor = parts[1].parse().context("parse minor")?;
        let revision = parts[2].parse().context("parse revision")?;
        Ok(Self {
            name: Box::new([first_char as u8]),
            major,
            minor,
            revision,
        })
    }

    pub fn client_name(&self) -> &'static str {
        match &self.name[..] {
            b"AZ" => "Azureus",
            b"BC" => "BitComet",
            b"BI" => "BiglyBT",
            b"BT" => "BitTorrent",
            b"DE" => "Deluge",
            b"FW" => "FrostWire",
            b"KT" => "KTorrent",
            b"LR" => "LibreTorrent",
            b"LT" => "libtorrent",
            b"M" => "Mainline",
            b"RP" => "riptide",
            b"S" => "Shadow",
            b"T" => "BitTornado",
            b"TR" => "Transmission",
            b"UM" => "uTorrent Mac",
            b"UT" => "uTorrent",
            b"lt" => "rTorrent",
            b"qB" => "qBittorrent",
            _ => "Unknown",
        }
    }
}

impl TryFrom<&[u8; 20]> for Fingerprint {
    type Error = anyhow::Error;

    fn try_from(value: &[u8; 20]) -> Result<Self, Self::Error> {
        Self::parse_azureus_style(value)
            .or_else(|_| Self::parse_shadow_style(value))
            .or_else(|_| Self::parse_mainline_style(value))
    }
}

/// Best effort client name for display purposes
pub fn client_name(peer_id: &[u8; 20]) -> &'static str {
    Fingerprint::try_from(peer_id)
        .map(|fp| fp.client_name())
        .unwrap_or("Unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn azureus_style_id() {
        let id = *b"-qB4520-abcdefghijkl";
        let fp = Fingerprint::try_from(&id).unwrap();
        assert_eq!(fp.client_name(), "qBittorrent");
        assert_eq!(fp.to_string(), "qBittorrent 4.5.2");
        assert_eq!(client_name(b"-TR4000-abcdefghijkl"), "Transmission");
    }

    #[test]
    fn shadow_style_id() {
        let id = *b"S587--------romeo889";
        let fp = Fingerprint::try_from(&id).unwrap();
        assert_eq!(fp.client_name(), "Shadow");
        assert_eq!(fp.to_string(), "Shadow 5.8.7");
    }

    #[test]
    fn unparsable_id_is_unknown() {
        assert_eq!(client_name(&[0u8; 20]), "Unknown");
    }

    #[test]
    fn generated_id_identifies_as_us() {
        let entropy = crate::caps::memory::SeededEntropy::new(7);
        let id = generate_peer_id(&entropy);
        assert_eq!(&id[..8], b"-RP0100-");
        assert_eq!(client_name(&id), "riptide");
        let other = generate_peer_id(&entropy);
        assert_ne!(id, other);
    }
}
