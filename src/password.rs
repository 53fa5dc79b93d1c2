//! Password generation for guest accounts.

use rand::Rng;
use rand::rngs::OsRng;

/// Letters, digits, and a symbol set that survives shell quoting and
/// `chpasswd` unchanged.
pub const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%_-+";

/// A `length`-character password drawn uniformly from [`PASSWORD_ALPHABET`]
/// using the operating system's CSPRNG.
pub fn generate_password(length: usize) -> String {
    (0..length)
        .map(|_| PASSWORD_ALPHABET[OsRng.gen_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}
