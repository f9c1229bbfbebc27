use crate::Secret;
use blake2::Blake2b;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{digest::consts::U32, Digest, Sha256};
use std::{fmt, str::FromStr};

const LENGTH: usize = 32;

type Blake2b256 = Blake2b<U32>;

/// The hash function binding the two escrows of one order.
///
/// Both escrows of an order MUST use the same function; it is fixed at
/// order creation and must match the on-chain verifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "sha-256")]
    Sha256,
    #[serde(rename = "blake2b-256")]
    Blake2b256,
}

impl HashAlgorithm {
    pub fn hash_of(&self, secret: &Secret) -> SecretHash {
        let hash: [u8; LENGTH] = match self {
            HashAlgorithm::Sha256 => Sha256::digest(secret.as_raw_secret()).into(),
            HashAlgorithm::Blake2b256 => Blake2b256::digest(secret.as_raw_secret()).into(),
        };

        SecretHash(hash)
    }

    /// Constant-time check that `preimage` hashes to `expected`.
    pub fn verify(&self, preimage: &Secret, expected: &SecretHash) -> bool {
        constant_time_eq(&self.hash_of(preimage).0, &expected.0)
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => f.write_str("sha-256"),
            HashAlgorithm::Blake2b256 => f.write_str("blake2b-256"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("unknown hash algorithm: {0}")]
pub struct UnknownAlgorithm(String);

impl FromStr for HashAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha-256" => Ok(HashAlgorithm::Sha256),
            "blake2b-256" => Ok(HashAlgorithm::Blake2b256),
            other => Err(UnknownAlgorithm(other.to_owned())),
        }
    }
}

fn constant_time_eq(lhs: &[u8; LENGTH], rhs: &[u8; LENGTH]) -> bool {
    let mut acc = 0u8;
    for (l, r) in lhs.iter().zip(rhs.iter()) {
        acc |= l ^ r;
    }

    acc == 0
}

#[derive(PartialEq, Clone, Copy, Debug, thiserror::Error)]
#[error("invalid length, expected: {expected:?}, got: {got:?}")]
pub struct InvalidLength {
    expected: usize,
    got: usize,
}

#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct SecretHash([u8; LENGTH]);

impl SecretHash {
    pub fn from_vec(vec: &[u8]) -> Result<Self, InvalidLength> {
        if vec.len() != LENGTH {
            return Err(InvalidLength {
                expected: LENGTH,
                got: vec.len(),
            });
        }
        let mut data = [0; LENGTH];
        data.copy_from_slice(&vec[..LENGTH]);

        Ok(SecretHash(data))
    }

    pub fn as_raw(&self) -> &[u8; LENGTH] {
        &self.0
    }

    pub fn into_raw(self) -> [u8; LENGTH] {
        self.0
    }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&format!("SecretHash({:x})", self))
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&format!("{:x}", self))
    }
}

impl fmt::LowerHex for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(hex::encode(self.0).as_str())
    }
}

impl From<[u8; LENGTH]> for SecretHash {
    fn from(hash: [u8; LENGTH]) -> Self {
        SecretHash(hash)
    }
}

impl From<SecretHash> for [u8; 32] {
    fn from(secret_hash: SecretHash) -> [u8; 32] {
        secret_hash.0
    }
}

impl Serialize for SecretHash {
    fn serialize<S>(&self, serializer: S) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:x}", self))
    }
}

impl<'de> Deserialize<'de> for SecretHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'vde> de::Visitor<'vde> for Visitor {
            type Value = SecretHash;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
                formatter.write_str("a hex encoded 32 byte value")
            }

            fn visit_str<E>(self, v: &str) -> Result<SecretHash, E>
            where
                E: de::Error,
            {
                SecretHash::from_str(v).map_err(|_| {
                    de::Error::invalid_value(de::Unexpected::Str(v), &"hex encoded bytes")
                })
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

#[derive(PartialEq, Clone, Copy, Debug, thiserror::Error)]
pub enum FromStrError {
    #[error("failed to decode bytes as hex")]
    HexDecode(#[from] hex::FromHexError),
    #[error("failed to construct secret hash from bytes")]
    FromVec(#[from] InvalidLength),
}

impl FromStr for SecretHash {
    type Err = FromStrError;

    fn from_str(s: &str) -> Result<Self, <Self as FromStr>::Err> {
        let vec = hex::decode(s)?;
        let secret_hash = Self::from_vec(&vec)?;

        Ok(secret_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hash_of_known_secret() {
        let bytes = b"hello world, you are beautiful!!";
        let secret = Secret::from(*bytes);

        assert_eq!(
            HashAlgorithm::Sha256.hash_of(&secret).to_string(),
            "68d627971643a6f97f27c58957826fcba853ec2077fd10ec6b93d8e61deb4cec"
        );
    }

    #[test]
    fn the_two_algorithms_disagree() {
        let secret = Secret::from(*b"hello world, you are beautiful!!");

        assert_ne!(
            HashAlgorithm::Sha256.hash_of(&secret),
            HashAlgorithm::Blake2b256.hash_of(&secret)
        );
    }

    #[test]
    fn verify_accepts_the_preimage() {
        let secret = Secret::random();
        let hash = HashAlgorithm::Blake2b256.hash_of(&secret);

        assert!(HashAlgorithm::Blake2b256.verify(&secret, &hash));
    }

    #[test]
    fn verify_rejects_a_different_preimage() {
        let hash = HashAlgorithm::Sha256.hash_of(&Secret::random());

        assert!(!HashAlgorithm::Sha256.verify(&Secret::random(), &hash));
    }

    #[test]
    fn algorithm_round_trips_through_config_notation() {
        assert_eq!("sha-256".parse(), Ok(HashAlgorithm::Sha256));
        assert_eq!("blake2b-256".parse(), Ok(HashAlgorithm::Blake2b256));
        assert!("keccak-256".parse::<HashAlgorithm>().is_err());
    }
}
