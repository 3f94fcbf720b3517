//! The on-disk swap metadata envelope.
//!
//! Every swap file starts with a typed-record envelope that identifies the
//! object the bytes belong to. The layout is a big-endian `u32` holding
//! the total envelope size (itself included), followed by records of
//! `{type: u8, length: u32, value}`. The envelope's total size is the
//! `swap_hdr_sz`; the serialized reply head and body begin right after it.
//!
//! Decoding is strict about framing (a record must fit inside the declared
//! envelope) but tolerant of record types it does not know, which keeps
//! old files readable across versions.

use std::time::{Duration, SystemTime};

use anyhow::{Result, bail};
use bytes::{BufMut, BytesMut};

use super::StoreEntry;

const T_KEY: u8 = 1;
const T_URL: u8 = 2;
const T_OBJSIZE: u8 = 3;
const T_VARY: u8 = 4;
const T_STAMPS: u8 = 5;

/// One envelope record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaRecord {
    /// Cache key the file was written under (`METHOD url`).
    Key(Vec<u8>),
    /// The stored canonical URL.
    Url(String),
    /// Object size, excluding the envelope.
    ObjectSize(u64),
    /// Variance signature of this alternate.
    Vary(String),
    /// timestamp / lastmod / expires as seconds since the epoch
    /// (`-1` = absent).
    Stamps {
        timestamp: i64,
        lastmod: i64,
        expires: i64,
    },
}

fn stamp(t: Option<SystemTime>) -> i64 {
    t.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(-1)
}

/// The records a producer writes ahead of an object.
pub fn records_for(entry: &StoreEntry, object_size: u64) -> Vec<MetaRecord> {
    let mut out = vec![
        MetaRecord::Key(key_bytes(entry)),
        MetaRecord::Url(entry.url()),
        MetaRecord::ObjectSize(object_size),
        MetaRecord::Stamps {
            timestamp: stamp(entry.timestamp()),
            lastmod: stamp(entry.lastmod()),
            expires: stamp(entry.expires()),
        },
    ];
    if let Some(v) = entry.vary_headers() {
        out.push(MetaRecord::Vary(v));
    }
    out
}

fn key_bytes(entry: &StoreEntry) -> Vec<u8> {
    format!("{} {}", entry.method(), entry.url()).into_bytes()
}

/// Serialize an envelope. The leading count covers the whole envelope,
/// itself included.
pub fn encode(records: &[MetaRecord]) -> Vec<u8> {
    let mut body = BytesMut::new();
    for rec in records {
        let (ty, value): (u8, Vec<u8>) = match rec {
            MetaRecord::Key(k) => (T_KEY, k.clone()),
            MetaRecord::Url(u) => (T_URL, u.as_bytes().to_vec()),
            MetaRecord::ObjectSize(n) => (T_OBJSIZE, n.to_be_bytes().to_vec()),
            MetaRecord::Vary(v) => (T_VARY, v.as_bytes().to_vec()),
            MetaRecord::Stamps {
                timestamp,
                lastmod,
                expires,
            } => {
                let mut v = Vec::with_capacity(24);
                v.extend_from_slice(&timestamp.to_be_bytes());
                v.extend_from_slice(&lastmod.to_be_bytes());
                v.extend_from_slice(&expires.to_be_bytes());
                (T_STAMPS, v)
            }
        };
        body.put_u8(ty);
        body.put_u32(value.len() as u32);
        body.put_slice(&value);
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&((4 + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Parse the envelope at the start of `buf`. Returns the envelope size
/// (the `swap_hdr_sz`) and the decoded records.
pub fn decode(buf: &[u8]) -> Result<(usize, Vec<MetaRecord>)> {
    if buf.len() < 4 {
        bail!("swap metadata: short read, {} bytes", buf.len());
    }
    let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if total < 4 || total > buf.len() {
        bail!(
            "swap metadata: envelope size {} inconsistent with available data",
            total
        );
    }

    let mut records = Vec::new();
    let mut pos = 4;
    while pos < total {
        if pos + 5 > total {
            bail!("swap metadata: truncated record header at {}", pos);
        }
        let ty = buf[pos];
        let len =
            u32::from_be_bytes([buf[pos + 1], buf[pos + 2], buf[pos + 3], buf[pos + 4]]) as usize;
        pos += 5;
        if pos + len > total {
            bail!("swap metadata: record of {} bytes overruns envelope", len);
        }
        let value = &buf[pos..pos + len];
        pos += len;

        let rec = match ty {
            T_KEY => MetaRecord::Key(value.to_vec()),
            T_URL => MetaRecord::Url(String::from_utf8_lossy(value).into_owned()),
            T_OBJSIZE => {
                if len != 8 {
                    bail!("swap metadata: bad object-size record length {}", len);
                }
                MetaRecord::ObjectSize(u64::from_be_bytes(value.try_into().unwrap()))
            }
            T_VARY => MetaRecord::Vary(String::from_utf8_lossy(value).into_owned()),
            T_STAMPS => {
                if len != 24 {
                    bail!("swap metadata: bad timestamp record length {}", len);
                }
                MetaRecord::Stamps {
                    timestamp: i64::from_be_bytes(value[0..8].try_into().unwrap()),
                    lastmod: i64::from_be_bytes(value[8..16].try_into().unwrap()),
                    expires: i64::from_be_bytes(value[16..24].try_into().unwrap()),
                }
            }
            other => {
                tracing::debug!(record = other, "skipping unknown swap metadata record");
                continue;
            }
        };
        records.push(rec);
    }

    Ok((total, records))
}

/// Check one record against the entry the reader is attached to. A
/// mismatch means the swap file does not hold this object.
pub fn check_consistency(rec: &MetaRecord, entry: &StoreEntry, swap_hdr_sz: usize) -> Result<()> {
    match rec {
        MetaRecord::Key(k) => {
            if *k != key_bytes(entry) {
                bail!("swap metadata: key mismatch");
            }
        }
        MetaRecord::Url(u) => {
            if *u != entry.url() {
                bail!("swap metadata: URL mismatch, '{}' != '{}'", u, entry.url());
            }
        }
        MetaRecord::ObjectSize(n) => {
            let file_sz = entry.swap_file_sz();
            if file_sz > 0 && *n != file_sz - swap_hdr_sz as u64 {
                bail!(
                    "swap metadata: object size {} != {} on disk",
                    n,
                    file_sz - swap_hdr_sz as u64
                );
            }
        }
        MetaRecord::Vary(v) => {
            if let Some(stored) = entry.vary_headers() {
                if *v != stored {
                    bail!("swap metadata: variance mismatch");
                }
            }
        }
        MetaRecord::Stamps { timestamp, .. } => {
            // informational; restore the timestamp when the entry has none
            if entry.timestamp().is_none() && *timestamp >= 0 {
                entry.set_timestamp(
                    SystemTime::UNIX_EPOCH + Duration::from_secs(*timestamp as u64),
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use http::Method;

    #[test]
    fn encode_decode_is_identity() {
        let records = vec![
            MetaRecord::Key(b"GET http://example.org/".to_vec()),
            MetaRecord::Url("http://example.org/".to_string()),
            MetaRecord::ObjectSize(1234),
            MetaRecord::Vary("accept-encoding=gzip;".to_string()),
            MetaRecord::Stamps {
                timestamp: 100,
                lastmod: -1,
                expires: 200,
            },
        ];
        let wire = encode(&records);
        let (hdr_sz, decoded) = decode(&wire).unwrap();
        assert_eq!(hdr_sz, wire.len());
        assert_eq!(decoded, records);
    }

    #[test]
    fn decode_rejects_truncated_envelopes() {
        let wire = encode(&[MetaRecord::ObjectSize(7)]);
        assert!(decode(&wire[..wire.len() - 1]).is_err());
        assert!(decode(&wire[..3]).is_err());
    }

    #[test]
    fn decode_rejects_overrunning_records() {
        let mut wire = encode(&[MetaRecord::Url("http://x/".into())]);
        // corrupt the record length so it points past the envelope
        wire[5..9].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(decode(&wire).is_err());
    }

    #[test]
    fn unknown_record_types_are_skipped() {
        let mut wire = Vec::new();
        let record = [200u8, 0, 0, 0, 1, 0xFF];
        wire.extend_from_slice(&((4 + record.len()) as u32).to_be_bytes());
        wire.extend_from_slice(&record);
        let (hdr, recs) = decode(&wire).unwrap();
        assert_eq!(hdr, wire.len());
        assert!(recs.is_empty());
    }

    #[test]
    fn consistency_catches_wrong_object() {
        let store = Store::new();
        let e = store.create_entry("http://example.org/right", &Method::GET, None, true);
        let wrong = MetaRecord::Url("http://example.org/wrong".into());
        assert!(check_consistency(&wrong, &e, 0).is_err());
        let right = MetaRecord::Url("http://example.org/right".into());
        assert!(check_consistency(&right, &e, 0).is_ok());
    }
}
