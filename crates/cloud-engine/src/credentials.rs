//! Root-user credential generation for the reset-root-user operation: a
//! random password, crypt-hashed, and a fresh Ed25519 SSH keypair. The
//! plaintext password and private key exist only as the transient return
//! value.

use cloud_core::error::{EngineError, EngineResult};
use cloud_core::model::RootUser;
use rand::Rng;
use sha_crypt::{sha512_simple, Sha512Params};
use ssh_key::{Algorithm, LineEnding, PrivateKey};

pub struct GeneratedRootUser {
    pub plaintext_password: String,
    pub ssh_private_key_openssh: String,
    pub root_user: RootUser,
}

pub fn generate_root_user() -> EngineResult<GeneratedRootUser> {
    let plaintext_password = random_password(24);
    let password_hash = sha512_simple(&plaintext_password, &Sha512Params::default())
        .map_err(|e| EngineError::ResourceUnavailable(format!("password hashing failed: {e:?}")))?;

    let private_key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| EngineError::ResourceUnavailable(format!("ssh keypair generation failed: {e}")))?;
    let ssh_public_key = private_key
        .public_key()
        .to_openssh()
        .map_err(|e| EngineError::ResourceUnavailable(format!("ssh public key encoding failed: {e}")))?;
    let ssh_private_key_openssh = private_key
        .to_openssh(LineEnding::LF)
        .map_err(|e| EngineError::ResourceUnavailable(format!("ssh private key encoding failed: {e}")))?
        .to_string();

    Ok(GeneratedRootUser {
        plaintext_password,
        ssh_private_key_openssh,
        root_user: RootUser { password_hash, ssh_public_key },
    })
}

fn random_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

/// Strip non-Latin-1 characters from a banner before writing it to a
/// guest.
pub fn sanitize_banner(banner: &str) -> String {
    banner.chars().filter(|c| (*c as u32) <= 0xFF).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_credentials() {
        let a = generate_root_user().unwrap();
        let b = generate_root_user().unwrap();
        assert_ne!(a.plaintext_password, b.plaintext_password);
        assert_ne!(a.root_user.ssh_public_key, b.root_user.ssh_public_key);
        assert!(a.root_user.ssh_public_key.starts_with("ssh-ed25519"));
        assert!(a.ssh_private_key_openssh.contains("BEGIN OPENSSH PRIVATE KEY"));
    }

    #[test]
    fn banner_sanitization_strips_non_latin1() {
        let sanitized = sanitize_banner("hello \u{1F600} world \u{0301}");
        assert_eq!(sanitized, "hello  world ");
    }
}
