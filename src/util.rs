use core::str;
use std::ascii;

use rand::Rng;

const PEER_ID_PREFIX: &str = "-TA0001-";

pub fn force_string(v: &[u8]) -> String {
    match str::from_utf8(v) {
        Ok(s) => s.to_string(),
        Err(_) => format!(
            "<non_utf-8>{}",
            v.iter()
                .flat_map(|b| ascii::escape_default(*b))
                .map(char::from)
                .collect::<String>()
        ),
    }
}

pub fn pretty_info_hash(info_hash: [u8; 20]) -> String {
    hex::encode(info_hash)
}

// Azureus-style peer id: client prefix followed by random digits
pub fn generate_peer_id() -> [u8; 20] {
    let mut rng = rand::rng();
    let mut peer_id = [0u8; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX.as_bytes());
    for b in peer_id[PEER_ID_PREFIX.len()..].iter_mut() {
        *b = b'0' + rng.random_range(0..10);
    }
    peer_id
}
