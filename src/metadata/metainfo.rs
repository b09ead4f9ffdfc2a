use crate::{bencoding::Value, util::pretty_info_hash};
use anyhow::{bail, Result};
use sha1::{Digest, Sha1};
use size::{Size, Style};
use std::{fmt, str};

use super::infodict::{self, InfoDict};

#[derive(PartialEq, Debug)]
pub struct Metainfo {
    announce_list: Vec<Vec<String>>, // tiers of announce urls
    info_hash: [u8; 20], // SHA1 hash of the value of the info key from the Metainfo file
    info: InfoDict,
}

impl fmt::Display for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "name: {}\nannounces: {:?}\nlength: {}\npiece length: {}\nn. pieces: {}\ninfo_hash: {}",
            self.info.name,
            self.announce_list,
            Size::from_bytes(self.info.length),
            Size::from_bytes(self.info.piece_length)
                .format()
                .with_style(Style::Abbreviated),
            self.num_pieces(),
            pretty_info_hash(self.info_hash),
        )
    }
}

impl Metainfo {
    pub fn new(source: &[u8]) -> Result<Self> {
        let torrent_map = match Value::decode(source)? {
            Value::Dict(m, _, _) => m,
            _ => bail!("The .torrent file is invalid: it does not contain a dict"),
        };

        let mut announces = Vec::new();
        match torrent_map.get(b"announce-list".as_slice()) {
            None => {}
            Some(Value::List(announce_list)) => {
                for tier in announce_list {
                    let Value::List(announces_in_tier) = tier else {
                        bail!("The .torrent file \"announce-list\" does not contain a list of lists");
                    };
                    let mut tier_list = Vec::new();
                    for announce_url in announces_in_tier {
                        match announce_url {
                            Value::Str(announce_vec) => match str::from_utf8(announce_vec) {
                                Ok(a) => tier_list.push(a.to_string()),
                                Err(_) => bail!("The .torrent file \"announce-list\" has an element in a tier list that is not an UTF-8 string"),
                            },
                            _ => bail!("The .torrent file \"announce-list\" has an element in a tier list that is not a string"),
                        }
                    }
                    if !tier_list.is_empty() {
                        announces.push(tier_list);
                    }
                }
            }
            Some(_) => bail!(
                "The .torrent file has a \"announce-list\" field but it does not contain a list"
            ),
        }

        if announces.is_empty() {
            if let Some(Value::Str(announce_vec)) = torrent_map.get(b"announce".as_slice()) {
                match str::from_utf8(announce_vec) {
                    Ok(a) => announces.push(vec![a.to_string()]),
                    _ => bail!("The .torrent file \"announce\" is not an UTF8 string"),
                }
            }
        }

        let (info_dict, info_hash) = match torrent_map.get(b"info".as_slice()) {
            Some(Value::Dict(a, s, e)) => {
                let mut info_hash = [0; 20];
                info_hash.copy_from_slice(&Sha1::digest(&source[*s..*e]));
                (a, info_hash)
            }
            _ => bail!("The .torrent file does not contain a valid \"info\""),
        };

        Ok(Metainfo {
            announce_list: announces,
            info_hash,
            info: infodict::get_infodict(info_dict)?,
        })
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn announce_urls(&self) -> &Vec<Vec<String>> {
        &self.announce_list
    }

    pub fn piece_length(&self) -> u64 {
        self.info.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.info.length
    }

    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len()
    }

    pub fn piece_hashes(&self) -> &Vec<[u8; 20]> {
        &self.info.pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrent(info: &[u8]) -> Vec<u8> {
        let mut source = b"d8:announce23:http://tracker.test/ann4:info".to_vec();
        source.extend_from_slice(info);
        source.push(b'e');
        source
    }

    fn single_file_info(length: u64, piece_length: u64, hashes: usize) -> Vec<u8> {
        let mut info = format!("d6:lengthi{length}e4:name8:file.bin12:piece lengthi{piece_length}e6:pieces{}:", hashes * 20).into_bytes();
        info.extend(vec![7u8; hashes * 20]);
        info.push(b'e');
        info
    }

    #[test]
    fn parses_single_file_torrent() {
        let info = single_file_info(40000, 16384, 3);
        let source = torrent(&info);
        let metainfo = Metainfo::new(&source).unwrap();
        assert_eq!(metainfo.name(), "file.bin");
        assert_eq!(metainfo.total_length(), 40000);
        assert_eq!(metainfo.piece_length(), 16384);
        assert_eq!(metainfo.num_pieces(), 3);
        assert_eq!(metainfo.piece_hashes()[2], [7u8; 20]);
        assert_eq!(
            metainfo.announce_urls(),
            &vec![vec!["http://tracker.test/ann".to_string()]]
        );
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(&Sha1::digest(&info));
        assert_eq!(metainfo.info_hash(), expected_hash);
    }

    #[test]
    fn piece_count_must_match_length() {
        let source = torrent(&single_file_info(40000, 16384, 2));
        assert!(Metainfo::new(&source).is_err());
    }

    #[test]
    fn multi_file_torrent_is_rejected() {
        let info = b"d5:filesld6:lengthi1e4:pathl1:aeee4:name1:x12:piece lengthi1e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        assert!(Metainfo::new(&torrent(info)).is_err());
    }

    #[test]
    fn announce_list_takes_precedence() {
        let mut source =
            b"d8:announce7:http://13:announce-listll8:http://a8:http://bel8:http://cee4:info"
                .to_vec();
        source.extend(single_file_info(10, 10, 1));
        source.push(b'e');
        let metainfo = Metainfo::new(&source).unwrap();
        assert_eq!(
            metainfo.announce_urls(),
            &vec![
                vec!["http://a".to_string(), "http://b".to_string()],
                vec!["http://c".to_string()]
            ]
        );
    }
}
