use sha1::{Digest, Sha1};

pub mod io;

pub fn to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&byte| format!("{byte:02x}")).collect()
}

pub fn sha1_hash(bytes: &[u8]) -> [u8; 20] {
    Sha1::digest(bytes).into()
}
