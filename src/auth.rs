//! Credential verification for the mysql_native_password scheme.

use crate::config::AccountConfig;
use crate::protocol::mysql::SCRAMBLE_LEN;
use rand::Rng;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// mysql_native_password scramble:
/// `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`.
///
/// An empty password scrambles to an empty response.
pub fn scramble_password(salt: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = sha1(password);
    let stage2 = sha1(&stage1);

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let token: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(token.iter()).map(|(a, b)| a ^ b).collect()
}

/// Random challenge for one connection. Bytes are in `1..=127` so the
/// NUL-terminated second half of the greeting stays intact.
pub fn generate_salt() -> [u8; SCRAMBLE_LEN] {
    let mut rng = rand::rng();
    let mut salt = [0u8; SCRAMBLE_LEN];
    for b in salt.iter_mut() {
        *b = rng.random_range(1..=127u8);
    }
    salt
}

/// Decides whether a client's handshake credentials are acceptable.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, user: &str, salt: &[u8], auth_response: &[u8]) -> bool;
}

/// Fixed set of user/password pairs, typically from the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticAccounts {
    accounts: HashMap<String, String>,
}

impl StaticAccounts {
    pub fn new<I, U, P>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            accounts: accounts
                .into_iter()
                .map(|(u, p)| (u.into(), p.into()))
                .collect(),
        }
    }

    pub fn from_config(accounts: &[AccountConfig]) -> Self {
        Self::new(accounts.iter().map(|a| (a.user.clone(), a.password.clone())))
    }
}

impl CredentialVerifier for StaticAccounts {
    fn verify(&self, user: &str, salt: &[u8], auth_response: &[u8]) -> bool {
        match self.accounts.get(user) {
            Some(password) => scramble_password(salt, password.as_bytes()) == auth_response,
            None => false,
        }
    }
}
