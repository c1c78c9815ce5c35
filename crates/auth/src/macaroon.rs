//! Bearer credential tokens with an HMAC signature chain
//!
//! A token carries its root key id, a random nonce, the permissions it
//! grants and a list of first-party caveats. The signature starts as
//! `HMAC(root_key, identifier)` and each caveat folds into it as
//! `HMAC(sig, caveat)`, so any holder can attenuate a token by appending
//! caveats but nobody can remove one without the root key.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::AuthError;
use crate::permissions::Permission;
use crate::store::RootKey;

type HmacSha256 = Hmac<Sha256>;

pub const MACAROON_VERSION: u8 = 1;
const NONCE_LEN: usize = 16;

/// A restriction every call presenting the token must satisfy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caveat {
    /// Only valid when presented from this address
    IpAddr(IpAddr),
    /// Only valid before this instant
    TimeBefore(DateTime<Utc>),
}

impl fmt::Display for Caveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caveat::IpAddr(ip) => write!(f, "ipaddr {ip}"),
            Caveat::TimeBefore(t) => write!(f, "time-before {}", t.to_rfc3339()),
        }
    }
}

impl FromStr for Caveat {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (condition, value) = s
            .split_once(' ')
            .ok_or_else(|| AuthError::InvalidMacaroon(format!("malformed caveat: {s}")))?;

        match condition {
            "ipaddr" => value
                .parse()
                .map(Caveat::IpAddr)
                .map_err(|e| AuthError::InvalidMacaroon(format!("bad ipaddr caveat: {e}"))),
            "time-before" => DateTime::parse_from_rfc3339(value)
                .map(|t| Caveat::TimeBefore(t.with_timezone(&Utc)))
                .map_err(|e| AuthError::InvalidMacaroon(format!("bad time-before caveat: {e}"))),
            other => Err(AuthError::InvalidMacaroon(format!(
                "unknown caveat condition: {other}"
            ))),
        }
    }
}

impl Caveat {
    /// Check this caveat against the context of a call
    pub fn check(&self, peer: Option<IpAddr>, now: DateTime<Utc>) -> Result<(), AuthError> {
        match self {
            Caveat::IpAddr(allowed) => match peer {
                Some(ip) if ip == *allowed => Ok(()),
                Some(ip) => Err(AuthError::unauthorized(format!(
                    "macaroon locked to {allowed}, presented from {ip}"
                ))),
                None => Err(AuthError::unauthorized(format!(
                    "macaroon locked to {allowed}, caller address unknown"
                ))),
            },
            Caveat::TimeBefore(deadline) if now < *deadline => Ok(()),
            Caveat::TimeBefore(deadline) => Err(AuthError::unauthorized(format!(
                "macaroon expired at {}",
                deadline.to_rfc3339()
            ))),
        }
    }
}

#[derive(Serialize)]
struct Identifier<'a> {
    version: u8,
    root_key_id: &'a str,
    nonce: &'a str,
    permissions: &'a [Permission],
}

#[derive(Serialize, Deserialize)]
struct WireMacaroon {
    version: u8,
    root_key_id: String,
    nonce: String,
    permissions: Vec<Permission>,
    caveats: Vec<String>,
    signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macaroon {
    root_key_id: String,
    nonce: String,
    permissions: Vec<Permission>,
    caveats: Vec<Caveat>,
    signature: Vec<u8>,
}

impl Macaroon {
    /// Mint a new token signed with `root_key`
    pub fn bake(root_key_id: &str, root_key: &RootKey, permissions: Vec<Permission>) -> Result<Self, AuthError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut macaroon = Self {
            root_key_id: root_key_id.to_string(),
            nonce: hex::encode(nonce),
            permissions,
            caveats: Vec::new(),
            signature: Vec::new(),
        };
        macaroon.signature = macaroon.root_signature(root_key)?;
        Ok(macaroon)
    }

    /// Attenuate the token; no root key needed
    pub fn add_caveat(&mut self, caveat: Caveat) -> Result<(), AuthError> {
        self.signature = chain(&self.signature, caveat.to_string().as_bytes())?;
        self.caveats.push(caveat);
        Ok(())
    }

    pub fn with_caveat(mut self, caveat: Caveat) -> Result<Self, AuthError> {
        self.add_caveat(caveat)?;
        Ok(self)
    }

    pub fn root_key_id(&self) -> &str {
        &self.root_key_id
    }

    pub fn permissions(&self) -> &[Permission] {
        &self.permissions
    }

    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    /// Recompute the signature chain from `root_key` and compare
    pub fn verify_signature(&self, root_key: &RootKey) -> Result<(), AuthError> {
        let mut sig = self.root_signature(root_key)?;
        let Some((last, init)) = self.caveats.split_last() else {
            return verify_tag(root_key.as_bytes(), &self.identifier()?, &self.signature);
        };
        for caveat in init {
            sig = chain(&sig, caveat.to_string().as_bytes())?;
        }
        verify_tag(&sig, last.to_string().as_bytes(), &self.signature)
    }

    /// Whether the token grants every permission in `required`
    pub fn grants(&self, required: &[Permission]) -> bool {
        required.iter().all(|p| self.permissions.contains(p))
    }

    /// Hex encoding used in files and request metadata
    pub fn encode(&self) -> Result<String, AuthError> {
        let wire = WireMacaroon {
            version: MACAROON_VERSION,
            root_key_id: self.root_key_id.clone(),
            nonce: self.nonce.clone(),
            permissions: self.permissions.clone(),
            caveats: self.caveats.iter().map(ToString::to_string).collect(),
            signature: hex::encode(&self.signature),
        };
        let bytes = serde_json::to_vec(&wire)
            .map_err(|e| AuthError::InvalidMacaroon(e.to_string()))?;
        Ok(hex::encode(bytes))
    }

    pub fn decode(encoded: &str) -> Result<Self, AuthError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| AuthError::InvalidMacaroon(format!("not hex: {e}")))?;
        let wire: WireMacaroon = serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::InvalidMacaroon(format!("malformed: {e}")))?;

        if wire.version != MACAROON_VERSION {
            return Err(AuthError::InvalidMacaroon(format!(
                "unsupported version {}",
                wire.version
            )));
        }

        let caveats = wire
            .caveats
            .iter()
            .map(|c| c.parse())
            .collect::<Result<Vec<Caveat>, _>>()?;
        let signature = hex::decode(&wire.signature)
            .map_err(|e| AuthError::InvalidMacaroon(format!("bad signature: {e}")))?;

        Ok(Self {
            root_key_id: wire.root_key_id,
            nonce: wire.nonce,
            permissions: wire.permissions,
            caveats,
            signature,
        })
    }

    fn identifier(&self) -> Result<Vec<u8>, AuthError> {
        serde_json::to_vec(&Identifier {
            version: MACAROON_VERSION,
            root_key_id: &self.root_key_id,
            nonce: &self.nonce,
            permissions: &self.permissions,
        })
        .map_err(|e| AuthError::InvalidMacaroon(e.to_string()))
    }

    fn root_signature(&self, root_key: &RootKey) -> Result<Vec<u8>, AuthError> {
        chain(root_key.as_bytes(), &self.identifier()?)
    }
}

fn chain(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AuthError::InvalidMacaroon(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time comparison of the final link in the chain
fn verify_tag(key: &[u8], data: &[u8], expected: &[u8]) -> Result<(), AuthError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AuthError::InvalidMacaroon(e.to_string()))?;
    mac.update(data);
    mac.verify_slice(expected)
        .map_err(|_| AuthError::unauthorized("macaroon signature mismatch"))
}
