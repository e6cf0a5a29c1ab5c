//! The two participants of a couch channel: one controller per channel and
//! any number of remotes.

pub mod controller;
pub mod remote;

use rand::Rng;

const CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Half of a join code: the channel name or its secret.
pub const CODE_PART_LEN: usize = 3;

pub(crate) fn random_code_part() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_PART_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
