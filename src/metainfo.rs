use std::{
    fmt::Display,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use reqwest::Url;
use serde::{de::Visitor, Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Sha1 of the bencoded info dictionary, the content identity of a torrent
pub type InfoHash = [u8; 20];

pub fn hex_hash(hash: &InfoHash) -> String {
    hex::encode(hash)
}

/// Represestation of the single file when [SizeDescriptor] variant is Files
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

impl bendy::encoding::ToBencode for File {
    const MAX_DEPTH: usize = 2;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.length)?;
            e.emit_pair(b"path", &self.path)
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeDescriptor {
    Files(Vec<File>),
    Length(u64),
}

/// Torrent output file that is normalized and safe against path attack
#[derive(Clone, Debug)]
pub struct OutputFile {
    length: u64,
    path: PathBuf,
}

impl OutputFile {
    pub fn new(length: u64, path: PathBuf) -> Self {
        Self { length, path }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Info dictionary is a unique descriptor of the particular torrent.
/// Sha1 hash of the info dictionary is a unique identifier for the torrent.
#[derive(Debug, Clone, Deserialize)]
pub struct Info {
    #[serde(skip)]
    pub raw: bytes::Bytes,
    #[serde(flatten)]
    pub file_descriptor: SizeDescriptor,
    /// In the single file case is the name of a file, in the multiple file case, it's the name of a directory.
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub pieces: Hashes,
}

impl bendy::decoding::FromBencode for Info {
    fn decode_bencode_object(
        object: bendy::decoding::Object,
    ) -> Result<Self, bendy::decoding::Error> {
        let dict_dec = object.try_into_dictionary()?;
        let raw = bytes::Bytes::copy_from_slice(dict_dec.into_raw()?);

        let mut info: Info = serde_bencode::from_bytes(&raw)?;
        info.raw = raw;
        Ok(info)
    }
}

impl Display for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        writeln!(
            f,
            "Pieces amount: {}x{} = {} bytes",
            self.pieces.len(),
            self.piece_length,
            self.total_size(),
        )?;
        let output_files = self.output_files("");
        writeln!(f, "Files ({}):", output_files.len())?;
        for file in output_files {
            writeln!(f, "   {}: {} bytes", file.path.display(), file.length())?;
        }
        Ok(())
    }
}

impl Info {
    pub fn total_size(&self) -> u64 {
        match &self.file_descriptor {
            SizeDescriptor::Files(files) => files.iter().map(|f| f.length).sum(),
            SizeDescriptor::Length(length) => *length,
        }
    }

    pub fn output_files(&self, output_dir: impl AsRef<Path>) -> Vec<OutputFile> {
        let base = output_dir.as_ref().join(&self.name);
        match &self.file_descriptor {
            SizeDescriptor::Files(files) => files
                .iter()
                .map(|f| {
                    OutputFile::new(
                        f.length,
                        base.join(sanitize_path(PathBuf::from_iter(f.path.iter()))),
                    )
                })
                .collect(),
            SizeDescriptor::Length(length) => {
                vec![OutputFile::new(*length, base)]
            }
        }
    }

    pub fn files_amount(&self) -> usize {
        match &self.file_descriptor {
            SizeDescriptor::Files(f) => f.len(),
            SizeDescriptor::Length(_) => 1,
        }
    }

    pub fn pieces_amount(&self) -> usize {
        self.pieces.len()
    }

    /// Helper to get piece length with consideration of the last piece
    pub fn piece_size(&self, piece_i: usize) -> u32 {
        crate::utils::piece_size(piece_i, self.piece_length, self.total_size())
    }

    pub fn hash(&self) -> InfoHash {
        crate::utils::sha1(&self.raw)
    }

    pub fn hex_hash(&self) -> String {
        hex::encode(self.hash())
    }

    pub fn as_bytes(&self) -> bytes::Bytes {
        self.raw.clone()
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        bendy::decoding::FromBencode::from_bencode(bytes)
            .map_err(|e| Error::new(ErrorKind::MetainfoInvalid, e.to_string()))
    }
}

/// List of piece hashes
#[derive(Debug, Clone)]
pub struct Hashes(pub Arc<[[u8; 20]]>);

impl Hashes {
    pub fn get_hash(&self, piece: usize) -> Option<&[u8; 20]> {
        self.0.get(piece)
    }
}

impl Deref for Hashes {
    type Target = [[u8; 20]];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

struct HashesVisitor;

impl Visitor<'_> for HashesVisitor {
    type Value = Hashes;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("Value that length can be divided by 20")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        if v.len() % 20 != 0 {
            return Err(serde::de::Error::custom(
                "payload is not multiple of 20 bytes long",
            ));
        }
        let chunks = v
            .chunks_exact(20)
            .map(|chunk| <[u8; 20]>::try_from(chunk).unwrap())
            .collect();
        Ok(Hashes(chunks))
    }
}

impl<'de> Deserialize<'de> for Hashes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_seq(HashesVisitor)
    }
}

impl Serialize for Hashes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0.concat())
    }
}

/// Metainfo (.torrent) file
#[derive(Debug)]
pub struct TorrentFile {
    pub info: Info,
    /// The URL of the tracker.
    pub announce: String,
    pub encoding: Option<String>,
    /// List of trackers
    pub announce_list: Option<Vec<Vec<String>>>,
    pub creation_date: Option<u64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
}

impl bendy::decoding::FromBencode for TorrentFile {
    fn decode_bencode_object(
        object: bendy::decoding::Object,
    ) -> Result<Self, bendy::decoding::Error> {
        use bendy::decoding::Error;
        use bendy::decoding::ResultExt;

        let mut announce = None;
        let mut announce_list = None;
        let mut encoding = None;
        let mut comment = None;
        let mut creation_date = None;
        let mut created_by = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some((tag, value)) = dict_dec.next_pair()? {
            match tag {
                b"announce" => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                b"announce-list" => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce-list")
                        .map(Some)?;
                }
                b"comment" => {
                    comment = String::decode_bencode_object(value)
                        .context("comment")
                        .map(Some)?;
                }
                b"creation date" => {
                    creation_date = u64::decode_bencode_object(value)
                        .context("creation_date")
                        .map(Some)?;
                }
                b"created by" => {
                    created_by = String::decode_bencode_object(value)
                        .context("created_by")
                        .map(Some)?;
                }
                b"encoding" => {
                    encoding = String::decode_bencode_object(value)
                        .context("encoding")
                        .map(Some)?;
                }
                b"info" => {
                    info = Info::decode_bencode_object(value).context("info").map(Some)?;
                }
                _ => {
                    tracing::debug!(
                        "Unexpected field in .torrent file: {}",
                        String::from_utf8_lossy(tag)
                    );
                }
            }
        }

        let announce = announce.ok_or_else(|| Error::missing_field("announce"))?;
        let info = info.ok_or_else(|| Error::missing_field("info"))?;

        Ok(Self {
            announce,
            announce_list,
            info,
            encoding,
            comment,
            creation_date,
            created_by,
        })
    }
}

impl TorrentFile {
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> crate::error::Result<Self> {
        bendy::decoding::FromBencode::from_bencode(bytes.as_ref())
            .map_err(|e| Error::new(ErrorKind::MetainfoInvalid, e.to_string()))
    }

    /// Get all trackers contained in file
    pub fn all_trackers(&self) -> Vec<Url> {
        let mut trackers =
            Vec::with_capacity(1 + self.announce_list.as_ref().map_or(0, |l| l.len()));
        if let Ok(url) = Url::parse(&self.announce) {
            trackers.push(url);
        } else {
            tracing::error!(
                self.announce,
                "failed to parse announce url in .torrent file"
            );
        }
        if let Some(list) = &self.announce_list {
            trackers.extend(
                list.iter()
                    .flatten()
                    .filter(|url| **url != self.announce)
                    .filter_map(|url| Url::parse(url).ok()),
            );
        };
        trackers
    }
}

/// Prevent traversal attack on path by ignoring suspicious components
fn sanitize_path(path: PathBuf) -> PathBuf {
    use std::path::Component;
    let mut normalized_path = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) => {
                tracing::warn!("Path starts with prefix component");
            }
            Component::RootDir => {
                tracing::warn!("Path starts with root directory component");
            }
            Component::CurDir | Component::ParentDir => {
                tracing::warn!("Path contains relative directory component");
            }
            Component::Normal(component) => normalized_path.push(component),
        }
    }
    normalized_path
}
