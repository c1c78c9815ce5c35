use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a swap hash in bytes
pub const HASH_SIZE: usize = 32;

/// Payment hash identifying a swap
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SwapHash([u8; HASH_SIZE]);

impl SwapHash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Hash of a swap preimage
    pub fn from_preimage(preimage: &[u8; HASH_SIZE]) -> Self {
        let digest = Sha256::digest(preimage);
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SwapHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SwapHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapHash({})", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwapHashError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid hash length: expected {HASH_SIZE} bytes, got {0}")]
    InvalidLength(usize),
}

impl FromStr for SwapHash {
    type Err = SwapHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| SwapHashError::InvalidHex(e.to_string()))?;
        let bytes: [u8; HASH_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SwapHashError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for SwapHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SwapHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Direction of a swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapType {
    /// Off-chain funds out to an on-chain address
    LoopOut,
    /// On-chain funds into a channel
    LoopIn,
}

/// Current state of a swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Initiated,
    PreimageRevealed,
    HtlcPublished,
    Success,
    Failed,
    InvoiceSettled,
}

impl SwapState {
    /// Whether the swap has reached a final state
    pub fn is_final(&self) -> bool {
        matches!(self, SwapState::Success | SwapState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapState::Initiated => "initiated",
            SwapState::PreimageRevealed => "preimage_revealed",
            SwapState::HtlcPublished => "htlc_published",
            SwapState::Success => "success",
            SwapState::Failed => "failed",
            SwapState::InvoiceSettled => "invoice_settled",
        }
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a swap ended in [`SwapState::Failed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    None,
    Offchain,
    Timeout,
    Sweep,
    InsufficientValue,
    Temporary,
    IncorrectAmount,
}

/// Economic terms agreed with the swap server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SwapTerms {
    /// Swap amount in satoshis
    pub amount: u64,

    /// Fee charged by the swap server
    pub server_cost: u64,

    /// On-chain fees paid so far
    pub onchain_cost: u64,

    /// Off-chain routing fees paid so far
    pub offchain_cost: u64,

    /// Upper bound on the server fee the client accepted
    pub max_swap_fee: u64,

    /// Upper bound on the miner fee the client accepted
    pub max_miner_fee: u64,
}

impl SwapTerms {
    pub fn total_cost(&self) -> u64 {
        self.server_cost
            .saturating_add(self.onchain_cost)
            .saturating_add(self.offchain_cost)
    }
}

/// Protocol-specific details of a swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SwapPayload {
    /// On-chain HTLC address
    pub htlc_address: String,

    /// Channels the off-chain payment may leave through (loop out)
    pub outgoing_channels: Vec<u64>,

    /// Last hop pubkey for the off-chain payment (loop in)
    pub last_hop: Option<String>,

    /// Free-form label set by the user
    pub label: String,
}

/// Record of a swap as tracked by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapInfo {
    pub swap_hash: SwapHash,
    pub swap_type: SwapType,
    pub state: SwapState,
    pub failure_reason: FailureReason,
    pub initiation_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub terms: SwapTerms,
    pub payload: SwapPayload,
}

impl SwapInfo {
    pub fn new(swap_hash: SwapHash, swap_type: SwapType, terms: SwapTerms) -> Self {
        let now = Utc::now();
        Self {
            swap_hash,
            swap_type,
            state: SwapState::Initiated,
            failure_reason: FailureReason::None,
            initiation_time: now,
            last_update: now,
            terms,
            payload: SwapPayload::default(),
        }
    }

    pub fn with_payload(mut self, payload: SwapPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Move the swap to a new state, stamping the update time
    pub fn transition(&mut self, state: SwapState) {
        self.state = state;
        self.last_update = Utc::now();
    }

    /// Mark the swap failed with the given reason
    pub fn fail(&mut self, reason: FailureReason) {
        self.failure_reason = reason;
        self.transition(SwapState::Failed);
    }
}
