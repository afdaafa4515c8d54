//! Argon2id password hashing with timing-equalized failure paths.

use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng as SaltRng, PasswordHash, PasswordHasher, SaltString},
    Algorithm, Argon2, Params, PasswordVerifier, Version,
};
use rand::{rngs::OsRng, Rng};

/// Hard-coded operand for [`Hasher::dummy_verify`]. The hash is a well-formed
/// PHC string with the production parameters, so verifying the fixed plaintext
/// against it costs one full Argon2id evaluation and nothing observable leaks
/// about whether a phone number exists.
const DUMMY_PASSWORD: &str = "fieldlock-dummy-credential";
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=65536,t=3,p=4$MDEyMzQ1Njc4OWFiY2RlZg$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

/// Alphabet for generated passwords. Ambiguous glyphs (0/O, 1/l/I) are left
/// out so operators can read a password over the phone.
const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnpqrstuvwxyz23456789!@#$%^&*-_=+";

#[derive(Debug, Clone)]
pub struct HasherConfig {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

#[derive(Clone)]
pub struct Hasher {
    params: Params,
}

impl Hasher {
    /// # Errors
    /// Returns an error if the configured parameters are outside Argon2 bounds.
    pub fn new(config: &HasherConfig) -> Result<Self> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|err| anyhow!("invalid argon2 parameters: {err}"))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash a password into a self-describing PHC string. Parameters and salt
    /// travel inside the string, so they can be rotated without a schema change.
    ///
    /// # Errors
    /// Returns an error if hashing fails.
    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut SaltRng);
        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| anyhow!("hash password: {err}"))?;
        Ok(hash.to_string())
    }

    /// Verify a password against a stored PHC string. The parameters encoded
    /// in the string drive the recomputation; comparison is constant-time
    /// inside the `argon2` crate.
    ///
    /// # Errors
    /// Returns `Ok(false)` on mismatch and an error only when the stored
    /// encoding itself is malformed.
    pub fn verify(&self, password: &str, encoded: &str) -> Result<bool> {
        let parsed =
            PasswordHash::new(encoded).map_err(|err| anyhow!("malformed password hash: {err}"))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(err) => Err(anyhow!("verify password: {err}")),
        }
    }

    /// Burn one full hash evaluation against a fixed operand. Called on the
    /// unknown-phone login branch so its wall time matches the wrong-password
    /// branch within noise.
    pub fn dummy_verify(&self) {
        let _ = self.verify(DUMMY_PASSWORD, DUMMY_HASH);
    }
}

/// Generate an `len`-character password from a printable alphabet using the
/// OS CSPRNG. The plaintext is handed to the caller exactly once and never
/// persisted.
pub fn generate_random_password(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..PASSWORD_ALPHABET.len());
            PASSWORD_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small parameters keep the test suite fast; production defaults stay at
    // 64 MiB / 3 / 4.
    fn test_hasher() -> Hasher {
        Hasher::new(&HasherConfig {
            memory_kib: 16,
            iterations: 1,
            parallelism: 1,
        })
        .expect("test parameters are valid")
    }

    #[test]
    fn hash_then_verify_round_trip() {
        let hasher = test_hasher();
        let encoded = hasher.hash("CorrectHorse8").expect("hash");
        assert!(encoded.starts_with("$argon2id$"));
        assert!(hasher.verify("CorrectHorse8", &encoded).expect("verify"));
        assert!(!hasher.verify("wrong-password", &encoded).expect("verify"));
    }

    #[test]
    fn hashes_are_salted() {
        let hasher = test_hasher();
        let first = hasher.hash("CorrectHorse8").expect("hash");
        let second = hasher.hash("CorrectHorse8").expect("hash");
        assert_ne!(first, second);
    }

    #[test]
    fn verify_rejects_malformed_encoding() {
        let hasher = test_hasher();
        assert!(hasher.verify("whatever", "not-a-phc-string").is_err());
    }

    #[test]
    fn dummy_hash_is_well_formed() {
        // The dummy operand must parse, carry the production parameters, and
        // fail verification without an encoding error.
        let parsed = PasswordHash::new(DUMMY_HASH).expect("dummy hash parses");
        assert_eq!(parsed.algorithm.as_str(), "argon2id");
        let hasher = test_hasher();
        assert!(!hasher.verify(DUMMY_PASSWORD, DUMMY_HASH).expect("verify"));
    }

    #[test]
    fn generated_passwords_use_the_alphabet() {
        let password = generate_random_password(16);
        assert_eq!(password.len(), 16);
        assert!(password
            .bytes()
            .all(|b| PASSWORD_ALPHABET.contains(&b)));
        assert_ne!(generate_random_password(16), password);
    }
}
