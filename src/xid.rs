//! Transaction identifiers
//!
//! A [`TransactionId`] is an XA-style XID: a format id, a global transaction
//! id and a branch qualifier. Global ids generated here are 24 bytes:
//!
//! ```text
//! +----------------+----------------+----------------+
//! | server hash(8) | epoch millis(8)|   counter(8)   |
//! +----------------+----------------+----------------+
//! ```
//!
//! The server hash lets recovery tell its own branches apart from branches
//! created by other servers sharing a resource manager. The epoch keeps ids
//! unique across restarts without consulting the log.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, TxError};

/// Format id stamped on every id this crate generates
pub const KEYSTONE_FORMAT_ID: i32 = 0x4b53_5458; // "KSTX"
/// Length of generated global ids
pub const GTRID_LEN: usize = 24;
/// Maximum global id length accepted from resource managers
pub const MAX_GTRID_LEN: usize = 64;
/// Maximum branch qualifier length
pub const MAX_BQUAL_LEN: usize = 64;

/// Global transaction id plus branch qualifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    format_id: i32,
    global_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl TransactionId {
    pub fn new(format_id: i32, global_id: &[u8], branch_qualifier: &[u8]) -> Result<Self> {
        if global_id.is_empty() || global_id.len() > MAX_GTRID_LEN {
            return Err(TxError::IllegalState(format!(
                "global id must be 1..={} bytes, got {}",
                MAX_GTRID_LEN,
                global_id.len()
            )));
        }
        if branch_qualifier.len() > MAX_BQUAL_LEN {
            return Err(TxError::IllegalState(format!(
                "branch qualifier must be at most {} bytes, got {}",
                MAX_BQUAL_LEN,
                branch_qualifier.len()
            )));
        }
        Ok(Self {
            format_id,
            global_id: global_id.to_vec(),
            branch_qualifier: branch_qualifier.to_vec(),
        })
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_id(&self) -> &[u8] {
        &self.global_id
    }

    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }

    /// The id of branch `branch` of this global transaction
    pub fn branch(&self, branch: u32) -> Self {
        Self {
            format_id: self.format_id,
            global_id: self.global_id.clone(),
            branch_qualifier: branch.to_be_bytes().to_vec(),
        }
    }

    /// The global transaction this id belongs to (branch 0)
    pub fn global(&self) -> Self {
        self.branch(0)
    }

    pub fn same_global(&self, other: &TransactionId) -> bool {
        self.format_id == other.format_id && self.global_id == other.global_id
    }

    /// Branch number if the qualifier was generated by [`TransactionId::branch`]
    pub fn branch_number(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.branch_qualifier.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Server hash embedded in a generated global id
    pub fn server_hash(&self) -> Option<[u8; 8]> {
        if self.format_id != KEYSTONE_FORMAT_ID || self.global_id.len() != GTRID_LEN {
            return None;
        }
        self.global_id[..8].try_into().ok()
    }

    /// Counter embedded in a generated global id
    pub fn sequence(&self) -> Option<u64> {
        if self.global_id.len() != GTRID_LEN {
            return None;
        }
        let bytes: [u8; 8] = self.global_id[16..24].try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Fixed binary layout: `format_id(4) | gtrid_len(1) | bqual_len(1) | gtrid | bqual`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            BytesMut::with_capacity(6 + self.global_id.len() + self.branch_qualifier.len());
        buf.put_i32(self.format_id);
        buf.put_u8(self.global_id.len() as u8);
        buf.put_u8(self.branch_qualifier.len() as u8);
        buf.put_slice(&self.global_id);
        buf.put_slice(&self.branch_qualifier);
        buf.to_vec()
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        if bytes.remaining() < 6 {
            return Err(TxError::Codec("transaction id too short".into()));
        }
        let format_id = bytes.get_i32();
        let gtrid_len = bytes.get_u8() as usize;
        let bqual_len = bytes.get_u8() as usize;
        if bytes.remaining() != gtrid_len + bqual_len {
            return Err(TxError::Codec(format!(
                "transaction id length mismatch: header says {}, found {}",
                gtrid_len + bqual_len,
                bytes.remaining()
            )));
        }
        let (gtrid, bqual) = bytes.split_at(gtrid_len);
        Self::new(format_id, gtrid, bqual)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:", self.format_id)?;
        for b in &self.global_id {
            write!(f, "{:02x}", b)?;
        }
        f.write_str(":")?;
        for b in &self.branch_qualifier {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// First 8 bytes of SHA-256 over the server name
pub fn server_hash(server_name: &str) -> [u8; 8] {
    let digest = Sha256::digest(server_name.as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Generates global ids and local transaction numbers for one server
pub struct XidFactory {
    server_hash: [u8; 8],
    epoch: u64,
    counter: AtomicU64,
    next_branch: AtomicU32,
}

impl XidFactory {
    pub fn new(server_name: &str) -> Self {
        let epoch = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(dur) => dur.as_millis() as u64,
            Err(_) => 0,
        };
        Self {
            server_hash: server_hash(server_name),
            epoch,
            counter: AtomicU64::new(1),
            next_branch: AtomicU32::new(1),
        }
    }

    pub fn server_hash(&self) -> [u8; 8] {
        self.server_hash
    }

    /// Allocate a new global transaction id and its local number
    pub fn next_global(&self) -> (u64, TransactionId) {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut gtrid = [0u8; GTRID_LEN];
        gtrid[..8].copy_from_slice(&self.server_hash);
        gtrid[8..16].copy_from_slice(&self.epoch.to_be_bytes());
        gtrid[16..].copy_from_slice(&seq.to_be_bytes());
        let xid = TransactionId {
            format_id: KEYSTONE_FORMAT_ID,
            global_id: gtrid.to_vec(),
            branch_qualifier: 0u32.to_be_bytes().to_vec(),
        };
        (seq, xid)
    }

    /// Allocate a branch number unique within this process
    pub fn next_branch(&self) -> u32 {
        self.next_branch.fetch_add(1, Ordering::SeqCst)
    }

    /// Never hand out a local number at or below `floor` (used after reading the log)
    pub fn advance_past(&self, floor: u64) {
        self.counter.fetch_max(floor + 1, Ordering::SeqCst);
    }

    /// True if `xid` was generated by a server with this hash
    pub fn owns(&self, xid: &TransactionId) -> bool {
        xid.server_hash() == Some(self.server_hash)
    }
}
