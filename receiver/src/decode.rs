//! Wire record framing and batch decoding.
//!
//! Every record the agent writes is an 8-byte native-endian length followed
//! by a protobuf payload. Current agents write a whole batch per record
//! (`TracesData` / `LogsData`); older agents wrote a single resource
//! (`ResourceSpans` / `ResourceLogs`), which is still accepted and wrapped
//! into a one-element batch.

use prost::Message;

use crate::error::DecodeError;
use crate::proto::{logs, trace};

/// Size of the record length prefix
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Return the payload of a framed record.
pub fn unframe(sample: &[u8]) -> Result<&[u8], DecodeError> {
    if sample.len() < LENGTH_PREFIX_LEN {
        return Err(DecodeError::TooShort(sample.len()));
    }

    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&sample[..LENGTH_PREFIX_LEN]);
    let declared = u64::from_ne_bytes(prefix);
    let available = sample.len() - LENGTH_PREFIX_LEN;
    if declared > available as u64 {
        return Err(DecodeError::Truncated {
            declared,
            available,
        });
    }

    Ok(&sample[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + declared as usize])
}

/// Frame `payload` the way the agent does.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u64).to_ne_bytes());
    out.extend_from_slice(payload);
    out
}

/// Which wire format a payload was decoded as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Current,
    Legacy,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::Current => "current",
            WireFormat::Legacy => "legacy",
        }
    }
}

/// A batch message with a single-resource legacy counterpart
pub trait WireBatch: Message + Default + Sized {
    type Legacy: Message + Default;

    /// Number of spans or log records in the batch
    fn item_count(&self) -> usize;

    fn from_legacy(legacy: Self::Legacy) -> Self;
}

impl WireBatch for trace::TracesData {
    type Legacy = trace::ResourceSpans;

    fn item_count(&self) -> usize {
        self.span_count()
    }

    fn from_legacy(legacy: Self::Legacy) -> Self {
        Self {
            resource_spans: vec![legacy],
        }
    }
}

impl WireBatch for logs::LogsData {
    type Legacy = logs::ResourceLogs;

    fn item_count(&self) -> usize {
        self.log_record_count()
    }

    fn from_legacy(legacy: Self::Legacy) -> Self {
        Self {
            resource_logs: vec![legacy],
        }
    }
}

/// Decode `payload` as a current batch, falling back to the legacy
/// single-resource message.
///
/// A current decode that succeeds with no items from a non-empty payload is
/// ambiguous (an unknown leading field is skipped silently), so the legacy
/// decode is tried as well and wins only if it yields items.
pub fn decode_batch<B: WireBatch>(payload: &[u8]) -> Result<(B, WireFormat), DecodeError> {
    let current = B::decode(payload);
    let settled = match &current {
        Ok(batch) => batch.item_count() > 0 || payload.is_empty(),
        Err(_) => false,
    };
    if settled {
        return current
            .map(|batch| (batch, WireFormat::Current))
            .map_err(DecodeError::from);
    }

    match B::Legacy::decode(payload) {
        Ok(legacy) => {
            let batch = B::from_legacy(legacy);
            if batch.item_count() > 0 {
                return Ok((batch, WireFormat::Legacy));
            }
            match current {
                Ok(batch) => Ok((batch, WireFormat::Current)),
                Err(_) => Ok((batch, WireFormat::Legacy)),
            }
        }
        Err(legacy_err) => match current {
            Ok(batch) => Ok((batch, WireFormat::Current)),
            Err(_) => Err(DecodeError::Proto(legacy_err)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::common::InstrumentationScope;
    use crate::proto::resource::Resource;
    use crate::proto::string_attribute;

    fn span(name: &str) -> trace::Span {
        trace::Span {
            trace_id: vec![1; 16],
            span_id: vec![2; 8],
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn resource_spans(names: &[&str]) -> trace::ResourceSpans {
        trace::ResourceSpans {
            resource: Some(Resource {
                attributes: vec![string_attribute("service.name", "checkout")],
                dropped_attributes_count: 1,
            }),
            scope_spans: vec![trace::ScopeSpans {
                scope: Some(InstrumentationScope {
                    name: "ebpf".into(),
                    ..Default::default()
                }),
                spans: names.iter().map(|n| span(n)).collect(),
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        }
    }

    #[test]
    fn test_unframe_valid() {
        let framed = frame(b"hello");
        assert_eq!(unframe(&framed).unwrap(), b"hello");
    }

    #[test]
    fn test_unframe_ignores_trailing_bytes() {
        let mut framed = frame(b"abc");
        framed.extend_from_slice(&[0xff; 5]);
        assert_eq!(unframe(&framed).unwrap(), b"abc");
    }

    #[test]
    fn test_unframe_too_short() {
        for len in 0..LENGTH_PREFIX_LEN {
            let err = unframe(&vec![0u8; len]).unwrap_err();
            assert!(matches!(err, DecodeError::TooShort(n) if n == len));
        }
    }

    #[test]
    fn test_unframe_truncated() {
        let mut framed = frame(b"payload");
        framed.truncate(framed.len() - 1);
        let err = unframe(&framed).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Truncated {
                declared: 7,
                available: 6
            }
        ));
        assert_eq!(err.reason(), "truncated");
    }

    #[test]
    fn test_current_batch_decodes_as_current() {
        let batch = trace::TracesData {
            resource_spans: vec![resource_spans(&["a", "b"]), resource_spans(&["c"])],
        };
        let payload = batch.encode_to_vec();
        let (decoded, format) = decode_batch::<trace::TracesData>(&payload).unwrap();
        assert_eq!(format, WireFormat::Current);
        assert_eq!(decoded, batch);
        assert_eq!(decoded.span_count(), 3);
    }

    #[test]
    fn test_legacy_resource_is_wrapped() {
        let legacy = resource_spans(&["only"]);
        let payload = legacy.encode_to_vec();
        let (decoded, format) = decode_batch::<trace::TracesData>(&payload).unwrap();
        assert_eq!(format, WireFormat::Legacy);
        assert_eq!(decoded, trace::TracesData::from_legacy(legacy));
    }

    #[test]
    fn test_legacy_without_resource_is_wrapped() {
        // no resource: the current decode skips the unknown field and is empty
        let mut legacy = resource_spans(&["x", "y"]);
        legacy.resource = None;
        let payload = legacy.encode_to_vec();
        let (decoded, format) = decode_batch::<trace::TracesData>(&payload).unwrap();
        assert_eq!(format, WireFormat::Legacy);
        assert_eq!(decoded.span_count(), 2);
    }

    #[test]
    fn test_legacy_logs_are_wrapped() {
        let legacy = logs::ResourceLogs {
            resource: Some(Resource {
                attributes: vec![],
                dropped_attributes_count: 2,
            }),
            scope_logs: vec![logs::ScopeLogs {
                log_records: vec![logs::LogRecord {
                    severity_text: "INFO".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            schema_url: String::new(),
        };
        let (decoded, format) =
            decode_batch::<logs::LogsData>(&legacy.encode_to_vec()).unwrap();
        assert_eq!(format, WireFormat::Legacy);
        assert_eq!(decoded.log_record_count(), 1);
    }

    #[test]
    fn test_garbage_fails_both_formats() {
        let err = decode_batch::<trace::TracesData>(&[0x0a, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, DecodeError::Proto(_)));
    }

    #[test]
    fn test_empty_payload_is_empty_batch() {
        let (decoded, format) = decode_batch::<logs::LogsData>(&[]).unwrap();
        assert_eq!(format, WireFormat::Current);
        assert_eq!(decoded.log_record_count(), 0);
    }
}
