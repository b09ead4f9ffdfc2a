use std::collections::BTreeMap;
use std::str;

use crate::bencoding::Value;
use anyhow::{bail, Result};

#[derive(PartialEq, Debug)]
pub struct InfoDict {
    pub name: String,           // suggested file name, advisory only
    pub piece_length: u64,      // number of bytes in each piece
    pub pieces: Vec<[u8; 20]>,  // SHA1 of each piece
    pub length: u64,            // length of the file in bytes
}

pub fn get_infodict(info_dict: &BTreeMap<Vec<u8>, Value>) -> Result<InfoDict> {
    let name = match info_dict.get(b"name".as_slice()) {
        Some(Value::Str(name_vec)) => match str::from_utf8(name_vec) {
            Ok(a) => a.to_string(),
            _ => bail!("The .torrent file \"info.name\" kv is not an UTF8 string"),
        },
        _ => bail!("The .torrent file does not contain a valid \"info.name\""),
    };
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
        bail!("The .torrent file \"info.name\" is not a valid file name: {name:?}");
    }

    let piece_length = match info_dict.get(b"piece length".as_slice()) {
        Some(Value::Int(a)) if *a > 0 => *a as u64,
        Some(Value::Int(_)) => bail!("The .torrent file \"info.piece length\" kv must be > 0"),
        _ => bail!("The .torrent file does not contain a valid \"info.piece length\""),
    };

    let pieces = match info_dict.get(b"pieces".as_slice()) {
        Some(Value::Str(pieces_byte_vec)) => {
            if pieces_byte_vec.len() % 20 != 0 {
                bail!(
                    "The .torrent file contains \"info.pieces\" that is not a string of length divisible by 20"
                );
            }
            pieces_byte_vec
                .chunks_exact(20)
                .map(|c| {
                    let mut piece = [0; 20];
                    piece.copy_from_slice(c);
                    piece
                })
                .collect::<Vec<[u8; 20]>>()
        }
        _ => bail!("The .torrent file does not contain a valid \"info.pieces\""),
    };

    if info_dict.contains_key(b"files".as_slice()) {
        bail!("The .torrent file describes a multi-file torrent, only single-file torrents are supported");
    }
    let length = match info_dict.get(b"length".as_slice()) {
        Some(Value::Int(a)) if *a >= 0 => *a as u64,
        Some(Value::Int(_)) => bail!("The .torrent file \"info.length\" kv cannot be < 0"),
        _ => bail!("The .torrent file does not contain a valid \"info.length\""),
    };

    let expected_pieces = length.div_ceil(piece_length);
    if pieces.len() as u64 != expected_pieces {
        bail!(
            "The .torrent file has {} piece hashes but a length of {length} with pieces of {piece_length} bytes needs {expected_pieces}",
            pieces.len()
        );
    }

    Ok(InfoDict {
        name,
        piece_length,
        pieces,
        length,
    })
}
