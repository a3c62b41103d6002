//! Consensus and wallet collaborators over the local daemon socket.
//!
//! The consensus daemon exposes a line-oriented JSON interface on a
//! Unix socket. Each request is one JSON object terminated by a
//! newline; the reply is one JSON object on one line. The chain client
//! caches the last tip so a hiccup in the consensus daemon degrades to
//! slightly stale reads instead of failing RPCs.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use haven_contracts::{ChainClient, Wallet};
use haven_types::{ChainIndex, ContractId, Hash256, Signature};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct Request<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

#[derive(Deserialize)]
struct TipResponse {
    height: u64,
    id: String,
}

#[derive(Deserialize)]
struct BoolResponse {
    ok: bool,
}

#[derive(Deserialize)]
struct SignResponse {
    signature: String,
}

/// Chain client backed by the consensus daemon's socket.
pub struct ConsensusClient {
    socket: PathBuf,
    cached_tip: RwLock<ChainIndex>,
}

impl ConsensusClient {
    pub fn new(socket: PathBuf) -> Self {
        ConsensusClient {
            socket,
            cached_tip: RwLock::new(ChainIndex::default()),
        }
    }

    fn call(&self, request: &Request<'_>) -> anyhow::Result<String> {
        let stream = UnixStream::connect(&self.socket)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;
        let mut writer = stream.try_clone()?;
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        writer.write_all(line.as_bytes())?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader.read_line(&mut reply)?;
        Ok(reply)
    }

    /// Poll the consensus daemon and refresh the cached tip. Returns
    /// the new tip when the height advanced.
    pub fn poll_tip(&self) -> Option<ChainIndex> {
        let reply = match self.call(&Request {
            method: "tip",
            id: None,
            data: None,
        }) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(%err, "consensus tip poll failed");
                return None;
            }
        };
        let tip: TipResponse = match serde_json::from_str(&reply) {
            Ok(tip) => tip,
            Err(err) => {
                tracing::warn!(%err, "malformed consensus tip reply");
                return None;
            }
        };
        let id = Hash256::parse_hex(&tip.id).unwrap_or(Hash256::ZERO);
        let index = ChainIndex {
            height: tip.height,
            id,
        };
        let mut cached = self.cached_tip.write();
        if index.height > cached.height {
            *cached = index;
            return Some(index);
        }
        None
    }

    fn query_contract(&self, method: &str, id: &ContractId) -> bool {
        let reply = match self.call(&Request {
            method,
            id: Some(id.to_string()),
            data: None,
        }) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(%err, method, "consensus query failed");
                return false;
            }
        };
        serde_json::from_str::<BoolResponse>(&reply)
            .map(|r| r.ok)
            .unwrap_or(false)
    }
}

impl ChainClient for ConsensusClient {
    fn tip(&self) -> ChainIndex {
        *self.cached_tip.read()
    }

    fn formation_confirmed(&self, id: &ContractId) -> bool {
        self.query_contract("formation_confirmed", id)
    }

    fn proof_confirmed(&self, id: &ContractId) -> bool {
        self.query_contract("proof_confirmed", id)
    }
}

/// Wallet backed by the same daemon socket.
pub struct SocketWallet {
    client: ConsensusClient,
}

impl SocketWallet {
    pub fn new(socket: PathBuf) -> Self {
        SocketWallet {
            client: ConsensusClient::new(socket),
        }
    }
}

impl Wallet for SocketWallet {
    fn sign(&self, digest: &Hash256) -> Signature {
        let reply = self.client.call(&Request {
            method: "wallet_sign",
            id: None,
            data: Some(digest.to_string()),
        });
        let parsed = reply
            .ok()
            .and_then(|r| serde_json::from_str::<SignResponse>(&r).ok())
            .and_then(|r| hex::decode(r.signature).ok())
            .and_then(|bytes| Signature::from_slice(&bytes).ok());
        match parsed {
            Some(signature) => signature,
            None => {
                tracing::warn!("wallet signing unavailable");
                Signature::default()
            }
        }
    }

    fn broadcast(&self, txn: &[u8]) -> std::result::Result<(), String> {
        let reply = self
            .client
            .call(&Request {
                method: "wallet_broadcast",
                id: None,
                data: Some(hex::encode(txn)),
            })
            .map_err(|err| err.to_string())?;
        let ok = serde_json::from_str::<BoolResponse>(&reply)
            .map(|r| r.ok)
            .map_err(|err| err.to_string())?;
        if ok {
            Ok(())
        } else {
            Err("broadcast rejected".to_string())
        }
    }
}
