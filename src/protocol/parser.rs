//! pgoutput logical replication message parser
//! Handles parsing of the message set produced with proto_version '1'

use tracing::debug;

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::protocol::buffer::BufferReader;
use crate::protocol::messages::{
    RelationColumn, RelationInfo, TupleData, TupleValue, WalMessage,
};

/// Parse logical replication messages from an XLogData payload
pub struct MessageParser;

impl MessageParser {
    /// Decode one pgoutput message. Returns `None` for message types the
    /// pipeline does not consume (Type, logical decoding messages); unknown
    /// tags are decode errors and halt ingestion.
    pub fn parse(buffer: &[u8]) -> CdcResult<Option<WalMessage>> {
        if buffer.is_empty() {
            return Err(CdcError::decode("empty message buffer"));
        }

        let mut reader = BufferReader::new(buffer);
        let tag = reader.read_char()?;

        match tag {
            'B' => Self::parse_begin(&mut reader).map(Some),
            'C' => Self::parse_commit(&mut reader).map(Some),
            'O' => Self::parse_origin(&mut reader).map(Some),
            'R' => Self::parse_relation(&mut reader).map(Some),
            'I' => Self::parse_insert(&mut reader).map(Some),
            'U' => Self::parse_update(&mut reader).map(Some),
            'D' => Self::parse_delete(&mut reader).map(Some),
            'T' => Self::parse_truncate(&mut reader).map(Some),
            'Y' | 'M' => {
                debug!("ignoring pgoutput message with tag '{}'", tag);
                Ok(None)
            }
            other => Err(CdcError::decode_with_context(
                format!("unknown pgoutput message tag '{other}'"),
                format!("{} byte payload", buffer.len()),
            )),
        }
    }

    fn parse_begin(reader: &mut BufferReader<'_>) -> CdcResult<WalMessage> {
        let final_lsn = Lsn(reader.read_u64()?);
        let commit_time_micros = reader.read_i64()?;
        let xid = reader.read_u32()?;
        Ok(WalMessage::Begin {
            final_lsn,
            commit_time_micros,
            xid,
        })
    }

    fn parse_commit(reader: &mut BufferReader<'_>) -> CdcResult<WalMessage> {
        let flags = reader.read_u8()?;
        let commit_lsn = Lsn(reader.read_u64()?);
        let end_lsn = Lsn(reader.read_u64()?);
        let commit_time_micros = reader.read_i64()?;
        Ok(WalMessage::Commit {
            flags,
            commit_lsn,
            end_lsn,
            commit_time_micros,
        })
    }

    fn parse_origin(reader: &mut BufferReader<'_>) -> CdcResult<WalMessage> {
        let commit_lsn = Lsn(reader.read_u64()?);
        let name = reader.read_cstr()?;
        Ok(WalMessage::Origin { commit_lsn, name })
    }

    fn parse_relation(reader: &mut BufferReader<'_>) -> CdcResult<WalMessage> {
        let oid = reader.read_u32()?;
        let namespace = reader.read_cstr()?;
        let name = reader.read_cstr()?;
        let replica_identity = reader.read_char()?;
        let column_count = reader.read_i16()?;

        let mut columns = Vec::with_capacity(column_count.max(0) as usize);
        for _ in 0..column_count {
            let key_flag = reader.read_i8()?;
            let column_name = reader.read_cstr()?;
            let type_oid = reader.read_u32()?;
            let atttypmod = reader.read_i32()?;
            columns.push(RelationColumn {
                key_flag,
                name: column_name,
                type_oid,
                atttypmod,
            });
        }

        Ok(WalMessage::Relation {
            relation: RelationInfo {
                oid,
                namespace,
                name,
                replica_identity,
                columns,
            },
        })
    }

    fn parse_insert(reader: &mut BufferReader<'_>) -> CdcResult<WalMessage> {
        let relation_oid = reader.read_u32()?;
        let marker = reader.read_char()?;
        if marker != 'N' {
            return Err(CdcError::decode(format!(
                "expected 'N' tuple marker in insert, got '{marker}'"
            )));
        }
        let new_tuple = Self::parse_tuple(reader)?;
        Ok(WalMessage::Insert {
            relation_oid,
            new_tuple,
        })
    }

    fn parse_update(reader: &mut BufferReader<'_>) -> CdcResult<WalMessage> {
        let relation_oid = reader.read_u32()?;
        let marker = reader.read_char()?;

        let (key_type, old_tuple, marker) = match marker {
            'K' | 'O' => {
                let old = Self::parse_tuple(reader)?;
                (Some(marker), Some(old), reader.read_char()?)
            }
            other => (None, None, other),
        };

        if marker != 'N' {
            return Err(CdcError::decode(format!(
                "expected 'N' tuple marker in update, got '{marker}'"
            )));
        }
        let new_tuple = Self::parse_tuple(reader)?;

        Ok(WalMessage::Update {
            relation_oid,
            key_type,
            old_tuple,
            new_tuple,
        })
    }

    fn parse_delete(reader: &mut BufferReader<'_>) -> CdcResult<WalMessage> {
        let relation_oid = reader.read_u32()?;
        let key_type = reader.read_char()?;
        if key_type != 'K' && key_type != 'O' {
            return Err(CdcError::decode(format!(
                "invalid key marker in delete: '{key_type}'"
            )));
        }
        let old_tuple = Self::parse_tuple(reader)?;
        Ok(WalMessage::Delete {
            relation_oid,
            key_type,
            old_tuple,
        })
    }

    fn parse_truncate(reader: &mut BufferReader<'_>) -> CdcResult<WalMessage> {
        let relation_count = reader.read_u32()?;
        let flags = reader.read_i8()?;
        let mut relation_oids = Vec::with_capacity(relation_count as usize);
        for _ in 0..relation_count {
            relation_oids.push(reader.read_u32()?);
        }
        Ok(WalMessage::Truncate {
            relation_oids,
            flags,
        })
    }

    fn parse_tuple(reader: &mut BufferReader<'_>) -> CdcResult<TupleData> {
        let column_count = reader.read_i16()?;
        let mut values = Vec::with_capacity(column_count.max(0) as usize);

        for _ in 0..column_count {
            let kind = reader.read_char()?;
            let value = match kind {
                'n' => TupleValue::Null,
                'u' => {
                    debug!("unchanged TOAST value encountered");
                    TupleValue::UnchangedToast
                }
                't' => {
                    let len = reader.read_i32()?;
                    if len < 0 {
                        return Err(CdcError::decode("negative tuple value length"));
                    }
                    let raw = reader.read_bytes(len as usize)?;
                    TupleValue::Text(String::from_utf8_lossy(&raw).into_owned())
                }
                other => {
                    return Err(CdcError::decode(format!(
                        "unknown tuple value kind '{other}'"
                    )));
                }
            };
            values.push(value);
        }

        Ok(TupleData { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_cstr(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    }

    fn push_text_column(buf: &mut Vec<u8>, value: &str) {
        buf.push(b't');
        buf.extend_from_slice(&(value.len() as i32).to_be_bytes());
        buf.extend_from_slice(value.as_bytes());
    }

    fn relation_message() -> Vec<u8> {
        let mut buf = vec![b'R'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        push_cstr(&mut buf, "public");
        push_cstr(&mut buf, "users");
        buf.push(b'd');
        buf.extend_from_slice(&2i16.to_be_bytes());
        // id: part of key
        buf.push(1);
        push_cstr(&mut buf, "id");
        buf.extend_from_slice(&23u32.to_be_bytes());
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        // name
        buf.push(0);
        push_cstr(&mut buf, "name");
        buf.extend_from_slice(&25u32.to_be_bytes());
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        buf
    }

    #[test]
    fn test_parse_begin() {
        let mut buf = vec![b'B'];
        buf.extend_from_slice(&100u64.to_be_bytes());
        buf.extend_from_slice(&777i64.to_be_bytes());
        buf.extend_from_slice(&42u32.to_be_bytes());

        match MessageParser::parse(&buf).unwrap().unwrap() {
            WalMessage::Begin {
                final_lsn,
                commit_time_micros,
                xid,
            } => {
                assert_eq!(final_lsn, Lsn(100));
                assert_eq!(commit_time_micros, 777);
                assert_eq!(xid, 42);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_commit() {
        let mut buf = vec![b'C', 0];
        buf.extend_from_slice(&100u64.to_be_bytes());
        buf.extend_from_slice(&108u64.to_be_bytes());
        buf.extend_from_slice(&777i64.to_be_bytes());

        match MessageParser::parse(&buf).unwrap().unwrap() {
            WalMessage::Commit {
                commit_lsn,
                end_lsn,
                ..
            } => {
                assert_eq!(commit_lsn, Lsn(100));
                assert_eq!(end_lsn, Lsn(108));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_relation() {
        match MessageParser::parse(&relation_message()).unwrap().unwrap() {
            WalMessage::Relation { relation } => {
                assert_eq!(relation.oid, 16385);
                assert_eq!(relation.namespace, "public");
                assert_eq!(relation.name, "users");
                assert_eq!(relation.replica_identity, 'd');
                assert_eq!(relation.column_names(), vec!["id", "name"]);
                assert_eq!(relation.columns[0].key_flag, 1);
                assert_eq!(relation.columns[1].type_oid, 25);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_insert() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&2i16.to_be_bytes());
        push_text_column(&mut buf, "7");
        buf.push(b'n');

        match MessageParser::parse(&buf).unwrap().unwrap() {
            WalMessage::Insert {
                relation_oid,
                new_tuple,
            } => {
                assert_eq!(relation_oid, 16385);
                assert_eq!(
                    new_tuple.into_values(),
                    vec![Some("7".to_string()), None]
                );
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_with_old_image() {
        let mut buf = vec![b'U'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.push(b'O');
        buf.extend_from_slice(&1i16.to_be_bytes());
        push_text_column(&mut buf, "old");
        buf.push(b'N');
        buf.extend_from_slice(&1i16.to_be_bytes());
        push_text_column(&mut buf, "new");

        match MessageParser::parse(&buf).unwrap().unwrap() {
            WalMessage::Update {
                key_type,
                old_tuple,
                new_tuple,
                ..
            } => {
                assert_eq!(key_type, Some('O'));
                assert_eq!(
                    old_tuple.unwrap().into_values(),
                    vec![Some("old".to_string())]
                );
                assert_eq!(new_tuple.into_values(), vec![Some("new".to_string())]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_without_old_image() {
        let mut buf = vec![b'U'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&1i16.to_be_bytes());
        push_text_column(&mut buf, "new");

        match MessageParser::parse(&buf).unwrap().unwrap() {
            WalMessage::Update {
                key_type,
                old_tuple,
                ..
            } => {
                assert_eq!(key_type, None);
                assert!(old_tuple.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_delete() {
        let mut buf = vec![b'D'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.push(b'K');
        buf.extend_from_slice(&1i16.to_be_bytes());
        push_text_column(&mut buf, "7");

        match MessageParser::parse(&buf).unwrap().unwrap() {
            WalMessage::Delete {
                key_type,
                old_tuple,
                ..
            } => {
                assert_eq!(key_type, 'K');
                assert_eq!(old_tuple.into_values(), vec![Some("7".to_string())]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_truncate() {
        let mut buf = vec![b'T'];
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.push(0);
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.extend_from_slice(&16386u32.to_be_bytes());

        match MessageParser::parse(&buf).unwrap().unwrap() {
            WalMessage::Truncate { relation_oids, .. } => {
                assert_eq!(relation_oids, vec![16385, 16386]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_ignorable_and_unknown_tags() {
        let mut type_msg = vec![b'Y'];
        type_msg.extend_from_slice(&23u32.to_be_bytes());
        assert!(MessageParser::parse(&type_msg).unwrap().is_none());

        let err = MessageParser::parse(&[b'Z', 0, 0]).unwrap_err();
        assert!(matches!(err, CdcError::Decode { .. }));
    }

    #[test]
    fn test_truncated_insert_is_decode_error() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&1i16.to_be_bytes());
        buf.push(b't');
        buf.extend_from_slice(&100i32.to_be_bytes());
        buf.extend_from_slice(b"short");
        assert!(MessageParser::parse(&buf).is_err());
    }
}
