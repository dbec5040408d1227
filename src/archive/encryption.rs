//! Age encryption detection and stream unwrapping (§4.1). `ErrEncrypted`
//! surfaces when the stream is age-encrypted but no identity was given.

use age::secrecy::Secret;
use anyhow::{Context, Result, bail};
use std::io::Read;

const AGE_MAGIC: &[u8] = b"age-encryption.org/v1";
const ARMOR_MAGIC: &[u8] = b"-----BEGIN AGE ENCRYPTED FILE-----";

pub fn looks_encrypted(head: &[u8]) -> bool {
    head.starts_with(AGE_MAGIC) || head.starts_with(ARMOR_MAGIC)
}

pub enum Identity {
    Passphrase(String),
    X25519(age::x25519::Identity),
}

impl Identity {
    pub fn parse_keyfile(contents: &str) -> Result<Vec<Identity>> {
        contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| {
                l.parse::<age::x25519::Identity>()
                    .map(Identity::X25519)
                    .map_err(|e| anyhow::anyhow!("bad age identity line: {e}"))
            })
            .collect()
    }
}

/// Unwrap an age-encrypted stream. `identities` is empty for a passphrase
/// decrypt, in which case the first element of `passphrase` is used.
pub fn wrap_decrypt<'a, R: Read + 'a>(
    reader: R,
    identities: &[Identity],
    passphrase: Option<&str>,
) -> Result<Box<dyn Read + 'a>> {
    let decryptor = age::Decryptor::new(reader).context("parse age header")?;
    match decryptor {
        age::Decryptor::Recipients(d) => {
            let recipients: Vec<&dyn age::Identity> = identities
                .iter()
                .filter_map(|i| match i {
                    Identity::X25519(x) => Some(x as &dyn age::Identity),
                    Identity::Passphrase(_) => None,
                })
                .collect();
            if recipients.is_empty() {
                bail!("archive is age-encrypted but no matching identity was supplied");
            }
            let r = d.decrypt(recipients.into_iter()).context("age decrypt")?;
            Ok(Box::new(r))
        }
        age::Decryptor::Passphrase(d) => {
            let pass =
                passphrase.ok_or_else(|| anyhow::anyhow!("archive is passphrase-encrypted"))?;
            let r = d
                .decrypt(&Secret::new(pass.to_string()), None)
                .context("age passphrase decrypt")?;
            Ok(Box::new(r))
        }
    }
}
