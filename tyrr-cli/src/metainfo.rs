//! Minimal metainfo (.torrent) parser: just enough bencode to produce a
//! [`Manifest`] and the SHA-1 of the raw info dictionary.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use thiserror::Error;

use tyrr_common::{FileSpec, InfoHash, Manifest};

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("failed to read torrent file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed bencode at byte {0}")]
    Malformed(usize),
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("pieces string is not a multiple of 20 bytes")]
    BadPieces,
}

#[derive(Debug)]
enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Vec<(Vec<u8>, Value)>),
}

impl Value {
    fn as_int(&self, field: &'static str) -> Result<i64, MetainfoError> {
        match self {
            Value::Int(v) => Ok(*v),
            _ => Err(MetainfoError::WrongType(field)),
        }
    }

    fn as_bytes(&self, field: &'static str) -> Result<&[u8], MetainfoError> {
        match self {
            Value::Bytes(v) => Ok(v),
            _ => Err(MetainfoError::WrongType(field)),
        }
    }

    fn as_str(&self, field: &'static str) -> Result<String, MetainfoError> {
        Ok(String::from_utf8_lossy(self.as_bytes(field)?).into_owned())
    }

    fn as_list(&self, field: &'static str) -> Result<&[Value], MetainfoError> {
        match self {
            Value::List(v) => Ok(v),
            _ => Err(MetainfoError::WrongType(field)),
        }
    }

    fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_slice() == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

struct Parser<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.raw.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8, MetainfoError> {
        let b = self.peek().ok_or(MetainfoError::Malformed(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn parse_value(&mut self) -> Result<Value, MetainfoError> {
        match self.peek().ok_or(MetainfoError::Malformed(self.pos))? {
            b'i' => {
                self.pos += 1;
                Ok(Value::Int(self.parse_int(b'e')?))
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek() != Some(b'e') {
                    items.push(self.parse_value()?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut pairs = Vec::new();
                while self.peek() != Some(b'e') {
                    let key = self.parse_bytes()?;
                    let value = self.parse_value()?;
                    pairs.push((key, value));
                }
                self.pos += 1;
                Ok(Value::Dict(pairs))
            }
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_bytes()?)),
            _ => Err(MetainfoError::Malformed(self.pos)),
        }
    }

    fn parse_int(&mut self, terminator: u8) -> Result<i64, MetainfoError> {
        let start = self.pos;
        let mut value: i64 = 0;
        let negative = if self.peek() == Some(b'-') {
            self.pos += 1;
            true
        } else {
            false
        };
        let mut digits = 0;
        loop {
            let b = self.bump()?;
            if b == terminator {
                break;
            }
            if !b.is_ascii_digit() {
                return Err(MetainfoError::Malformed(start));
            }
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as i64))
                .ok_or(MetainfoError::Malformed(start))?;
            digits += 1;
        }
        if digits == 0 {
            return Err(MetainfoError::Malformed(start));
        }
        Ok(if negative { -value } else { value })
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, MetainfoError> {
        let len = self.parse_int(b':')? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.raw.len())
            .ok_or(MetainfoError::Malformed(self.pos))?;
        let bytes = self.raw[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }
}

pub fn load(path: &Path) -> Result<Manifest, MetainfoError> {
    parse(&std::fs::read(path)?)
}

pub fn parse(raw: &[u8]) -> Result<Manifest, MetainfoError> {
    let mut parser = Parser::new(raw);
    if parser.bump()? != b'd' {
        return Err(MetainfoError::Malformed(0));
    }

    let mut announce = None;
    let mut announce_list = Vec::new();
    let mut info = None;
    let mut info_span = 0..0;

    while parser.peek() != Some(b'e') {
        let key = parser.parse_bytes()?;
        let start = parser.pos;
        let value = parser.parse_value()?;
        let end = parser.pos;
        match key.as_slice() {
            b"announce" => announce = Some(value.as_str("announce")?),
            b"announce-list" => {
                for tier in value.as_list("announce-list")? {
                    let urls: Vec<String> = tier
                        .as_list("announce-list tier")?
                        .iter()
                        .filter_map(|url| url.as_str("tracker url").ok())
                        .collect();
                    if !urls.is_empty() {
                        announce_list.push(urls);
                    }
                }
            }
            b"info" => {
                info = Some(value);
                info_span = start..end;
            }
            _ => {}
        }
    }

    let info = info.ok_or(MetainfoError::Missing("info"))?;
    let digest: [u8; 20] = Sha1::digest(&raw[info_span]).into();
    let info_hash = InfoHash::new(digest);

    let name = info
        .get(b"name")
        .ok_or(MetainfoError::Missing("name"))?
        .as_str("name")?;
    let piece_length = info
        .get(b"piece length")
        .ok_or(MetainfoError::Missing("piece length"))?
        .as_int("piece length")? as u32;

    let pieces_raw = info
        .get(b"pieces")
        .ok_or(MetainfoError::Missing("pieces"))?
        .as_bytes("pieces")?;
    if pieces_raw.len() % 20 != 0 {
        return Err(MetainfoError::BadPieces);
    }
    let piece_hashes: Vec<[u8; 20]> = pieces_raw
        .chunks_exact(20)
        .map(|chunk| chunk.try_into().expect("chunks_exact yields 20 bytes"))
        .collect();

    let private = matches!(info.get(b"private").map(|v| v.as_int("private")), Some(Ok(1)));

    let files = match info.get(b"files") {
        None => {
            let length = info
                .get(b"length")
                .ok_or(MetainfoError::Missing("length"))?
                .as_int("length")? as u64;
            vec![FileSpec {
                path: PathBuf::from(&name),
                length,
            }]
        }
        Some(list) => {
            let mut files = Vec::new();
            for entry in list.as_list("files")? {
                let length = entry
                    .get(b"length")
                    .ok_or(MetainfoError::Missing("files.length"))?
                    .as_int("files.length")? as u64;
                let mut path = PathBuf::from(&name);
                for part in entry
                    .get(b"path")
                    .ok_or(MetainfoError::Missing("files.path"))?
                    .as_list("files.path")?
                {
                    path.push(part.as_str("files.path element")?);
                }
                files.push(FileSpec { path, length });
            }
            files
        }
    };
    let total_length = files.iter().map(|f| f.length).sum();

    if announce_list.is_empty() {
        if let Some(url) = announce {
            announce_list.push(vec![url]);
        }
    }

    Ok(Manifest {
        info_hash,
        name,
        piece_length,
        piece_hashes,
        total_length,
        files,
        private,
        announce_list,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce19:http://tr.example/a4:infod");
        raw.extend_from_slice(b"6:lengthi64e4:name8:test.bin12:piece lengthi32e");
        raw.extend_from_slice(b"6:pieces40:");
        raw.extend_from_slice(&[0u8; 40]);
        raw.extend_from_slice(b"ee");
        raw
    }

    #[test]
    fn parses_single_file_manifest() {
        let raw = single_file_torrent();
        let manifest = parse(&raw).unwrap();

        assert_eq!(manifest.name, "test.bin");
        assert_eq!(manifest.piece_length, 32);
        assert_eq!(manifest.num_pieces(), 2);
        assert_eq!(manifest.total_length, 64);
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.announce_list, vec![vec![
            "http://tr.example/a".to_string()
        ]]);

        // info-hash covers exactly the raw info dictionary
        let info_start = raw.windows(5).position(|w| w == b"infod").unwrap() + 4;
        let info_raw = &raw[info_start..raw.len() - 1];
        let digest: [u8; 20] = Sha1::digest(info_raw).into();
        assert_eq!(manifest.info_hash, InfoHash::new(digest));
    }

    #[test]
    fn parses_multi_file_layout() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d4:infod");
        raw.extend_from_slice(b"5:filesl");
        raw.extend_from_slice(b"d6:lengthi10e4:pathl5:a.txteed6:lengthi22e4:pathl3:sub5:b.bineee");
        raw.extend_from_slice(b"4:name3:dir12:piece lengthi16e6:pieces40:");
        raw.extend_from_slice(&[0u8; 40]);
        raw.extend_from_slice(b"ee");

        let manifest = parse(&raw).unwrap();
        assert_eq!(manifest.total_length, 32);
        assert_eq!(manifest.files[0].path, PathBuf::from("dir/a.txt"));
        assert_eq!(manifest.files[1].path, PathBuf::from("dir/sub/b.bin"));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse(b"").is_err());
        assert!(parse(b"le").is_err());
        assert!(parse(b"d4:infoi3ee").is_err());
        assert!(parse(b"d4:spam4:eggse").is_err()); // no info dict
    }
}
