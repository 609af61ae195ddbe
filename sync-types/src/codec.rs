//! MessagePack codec for the three channel payloads.
//!
//! Structs are encoded as maps with camelCase keys so that a decoder can
//! tell a missing field from an unknown one. Decoding is strict: unknown
//! fields, trailing bytes, and records that break the `fulfilledAt`
//! invariant are all rejected.
//!
//! Each value is self-delimiting, so [`Payload::decode_all`] can split a
//! reassembled buffer holding several messages written back to back.

use serde::de::DeserializeOwned;
use std::io::Cursor;

use crate::error::{CodecError, EncodeError, MalformedKind};
use crate::messages::{Payload, RequestRecord};
use crate::request::check_fulfilled_at;
use crate::Channel;

/// Largest logical message the codec accepts (64 KiB).
///
/// Applies to the reassembled message, not to individual transport units.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

impl Payload {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let encoded = match self {
            Payload::Submission(msg) => rmp_serde::to_vec_named(msg),
            Payload::Status(msg) => rmp_serde::to_vec_named(msg),
            Payload::FullState(msg) => rmp_serde::to_vec_named(msg),
        };
        encoded.map_err(|source| EncodeError {
            channel: self.channel(),
            source,
        })
    }

    /// Deserialize a payload received on `channel`.
    ///
    /// `bytes` must hold exactly one message.
    pub fn from_bytes(channel: Channel, bytes: &[u8]) -> Result<Self, CodecError> {
        let malformed = |kind| CodecError::MalformedPayload { channel, kind };
        check_size(bytes).map_err(malformed)?;

        let mut reader = Cursor::new(bytes);
        let payload = read_payload(channel, &mut reader).map_err(malformed)?;
        let consumed = reader.position() as usize;
        if consumed != bytes.len() {
            return Err(malformed(MalformedKind::Syntax(format!(
                "{} trailing bytes",
                bytes.len() - consumed
            ))));
        }
        validate(&payload).map_err(malformed)?;
        Ok(payload)
    }

    /// Deserialize every message in `bytes`, which may hold several
    /// messages written back to back on `channel`.
    ///
    /// A value that parses but breaks a record invariant yields an error in
    /// its slot and decoding carries on. A value that does not parse ends
    /// the run, since the start of the next message is unknown.
    pub fn decode_all(channel: Channel, bytes: &[u8]) -> Vec<Result<Self, CodecError>> {
        let malformed = |kind| CodecError::MalformedPayload { channel, kind };
        if let Err(kind) = check_size(bytes) {
            return vec![Err(malformed(kind))];
        }

        let mut reader = Cursor::new(bytes);
        let mut decoded = Vec::new();
        while (reader.position() as usize) < bytes.len() {
            match read_payload(channel, &mut reader) {
                Ok(payload) => decoded.push(validate(&payload).map(|()| payload).map_err(malformed)),
                Err(kind) => {
                    decoded.push(Err(malformed(kind)));
                    break;
                }
            }
        }
        decoded
    }
}

fn check_size(bytes: &[u8]) -> Result<(), MalformedKind> {
    if bytes.is_empty() {
        return Err(MalformedKind::Syntax("empty payload".into()));
    }
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(MalformedKind::Oversized {
            size: bytes.len(),
            limit: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

/// Read one value of the channel's shape, leaving `reader` just past it.
fn read_payload(channel: Channel, reader: &mut Cursor<&[u8]>) -> Result<Payload, MalformedKind> {
    Ok(match channel {
        Channel::Submission => Payload::Submission(read_value(reader)?),
        Channel::Status => Payload::Status(read_value(reader)?),
        Channel::FullState => Payload::FullState(read_value(reader)?),
    })
}

fn read_value<T: DeserializeOwned>(reader: &mut Cursor<&[u8]>) -> Result<T, MalformedKind> {
    let mut de = rmp_serde::Deserializer::new(reader);
    T::deserialize(&mut de).map_err(|e| classify(&e.to_string()))
}

/// Record invariants the type system does not carry.
fn validate(payload: &Payload) -> Result<(), MalformedKind> {
    match payload {
        Payload::Submission(_) => Ok(()),
        Payload::Status(msg) => check_fulfilled_at(msg.state, msg.fulfilled_at)
            .map_err(|e| MalformedKind::InvalidValue(e.to_string())),
        Payload::FullState(msg) => msg.requests.iter().try_for_each(|record: &RequestRecord| {
            check_fulfilled_at(record.state, record.fulfilled_at)
                .map_err(|e| MalformedKind::InvalidValue(format!("{}: {}", record.id, e)))
        }),
    }
}

/// Map a serde error message onto the malformed-payload taxonomy.
///
/// Relies on serde's derive wording for unknown and missing fields; any
/// other message, including a reworded one, is kept whole as `Syntax`.
fn classify(message: &str) -> MalformedKind {
    if let Some(name) = quoted_after(message, "unknown field `") {
        return MalformedKind::UnknownField(name);
    }
    if let Some(name) = quoted_after(message, "missing field `") {
        return MalformedKind::MissingField(name);
    }
    MalformedKind::Syntax(message.to_string())
}

fn quoted_after(message: &str, prefix: &str) -> Option<String> {
    let start = message.find(prefix)? + prefix.len();
    let rest = &message[start..];
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StatusMessage;
    use crate::{Request, RequestId, RequestState, Timestamp};
    use proptest::prelude::*;
    use serde::Serialize;

    fn ts(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn fulfilled(label: &str) -> Request {
        let mut request = Request::submit(label, ts(1_000));
        request.fulfill(ts(2_000)).unwrap();
        request
    }

    #[test]
    fn submission_roundtrip() {
        let request = Request::submit("A42", ts(1_705_000_000_000));
        let payload = Payload::submission(&request);

        let restored = Payload::from_bytes(Channel::Submission, &payload.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn status_roundtrip_without_fulfilment() {
        let mut request = Request::submit("A42", ts(1));
        request.acknowledge().unwrap();
        let payload = Payload::status(&request);

        let restored = Payload::from_bytes(Channel::Status, &payload.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn full_state_roundtrip_keeps_order() {
        let requests = vec![
            fulfilled("A1"),
            Request::submit("A2", ts(5)),
            fulfilled("A3"),
        ];
        let payload = Payload::full_state(&requests);

        let restored = Payload::from_bytes(Channel::FullState, &payload.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn empty_full_state_roundtrip() {
        let payload = Payload::full_state(Vec::<Request>::new().iter());
        let restored = Payload::from_bytes(Channel::FullState, &payload.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn wire_uses_camel_case_keys() {
        let bytes = Payload::submission(&Request::submit("A42", ts(7))).to_bytes().unwrap();
        let needle = b"submittedAt";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn synced_flag_is_not_transmitted() {
        let bytes = Payload::full_state(&[fulfilled("A1").synced()]).to_bytes().unwrap();
        let needle = b"synced";
        assert!(!bytes.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = Payload::from_bytes(Channel::Submission, &[0xc1, 0x00, 0xff]).unwrap_err();
        assert!(matches!(err.kind(), MalformedKind::Syntax(_)));
    }

    #[test]
    fn empty_bytes_are_malformed() {
        let err = Payload::from_bytes(Channel::Status, &[]).unwrap_err();
        assert!(matches!(err.kind(), MalformedKind::Syntax(_)));
    }

    #[test]
    fn payload_on_wrong_channel_is_rejected() {
        let bytes = Payload::submission(&Request::submit("A42", ts(7))).to_bytes().unwrap();
        let err = Payload::from_bytes(Channel::Status, &bytes).unwrap_err();
        assert!(matches!(
            err,
            CodecError::MalformedPayload {
                channel: Channel::Status,
                ..
            }
        ));
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct SubmissionWithExtra {
        id: RequestId,
        label: String,
        submitted_at: Timestamp,
        priority: u8,
    }

    #[test]
    fn unknown_field_is_reported() {
        let bytes = rmp_serde::to_vec_named(&SubmissionWithExtra {
            id: RequestId::new(),
            label: "A42".into(),
            submitted_at: ts(1),
            priority: 3,
        })
        .unwrap();

        let err = Payload::from_bytes(Channel::Submission, &bytes).unwrap_err();
        assert_eq!(err.kind(), &MalformedKind::UnknownField("priority".into()));
    }

    #[derive(Serialize)]
    struct StatusWithoutState {
        id: RequestId,
    }

    #[test]
    fn missing_field_is_reported() {
        let bytes = rmp_serde::to_vec_named(&StatusWithoutState {
            id: RequestId::new(),
        })
        .unwrap();

        let err = Payload::from_bytes(Channel::Status, &bytes).unwrap_err();
        assert_eq!(err.kind(), &MalformedKind::MissingField("state".into()));
    }

    #[test]
    fn fulfilled_status_without_timestamp_is_invalid() {
        let msg = StatusMessage {
            id: RequestId::new(),
            state: RequestState::Fulfilled,
            fulfilled_at: None,
        };
        let bytes = Payload::Status(msg).to_bytes().unwrap();

        let err = Payload::from_bytes(Channel::Status, &bytes).unwrap_err();
        assert!(matches!(err.kind(), MalformedKind::InvalidValue(_)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let one = Payload::submission(&Request::submit("A", ts(1))).to_bytes().unwrap();
        let two = Payload::submission(&Request::submit("B", ts(2))).to_bytes().unwrap();
        let mut glued = one.clone();
        glued.extend_from_slice(&two);

        let err = Payload::from_bytes(Channel::Submission, &glued).unwrap_err();
        assert!(matches!(err.kind(), MalformedKind::Syntax(msg) if msg.contains("trailing")));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let bytes = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = Payload::from_bytes(Channel::FullState, &bytes).unwrap_err();
        assert!(matches!(err.kind(), MalformedKind::Oversized { .. }));
    }

    #[test]
    fn back_to_back_messages_decode_in_order() {
        let first = Payload::submission(&Request::submit("A", ts(1)));
        let second = Payload::submission(&Request::submit("B", ts(2)));
        let third = Payload::submission(&Request::submit("C", ts(3)));
        let mut glued = first.to_bytes().unwrap();
        glued.extend(second.to_bytes().unwrap());
        glued.extend(third.to_bytes().unwrap());

        let decoded: Vec<_> = Payload::decode_all(Channel::Submission, &glued)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(decoded, vec![first, second, third]);
    }

    #[test]
    fn single_message_decodes_alone() {
        let payload = Payload::status(&fulfilled("A1"));
        let decoded = Payload::decode_all(Channel::Status, &payload.to_bytes().unwrap());
        assert_eq!(decoded, vec![Ok(payload)]);
    }

    #[test]
    fn invalid_value_does_not_hide_the_next_message() {
        let broken = Payload::Status(StatusMessage {
            id: RequestId::new(),
            state: RequestState::Fulfilled,
            fulfilled_at: None,
        });
        let good = Payload::status(&fulfilled("A1"));
        let mut glued = broken.to_bytes().unwrap();
        glued.extend(good.to_bytes().unwrap());

        let decoded = Payload::decode_all(Channel::Status, &glued);
        assert_eq!(decoded.len(), 2);
        assert!(matches!(decoded[0].as_ref().unwrap_err().kind(), MalformedKind::InvalidValue(_)));
        assert_eq!(decoded[1], Ok(good));
    }

    #[test]
    fn unparseable_tail_ends_the_run() {
        let good = Payload::submission(&Request::submit("A", ts(1)));
        let mut bytes = good.to_bytes().unwrap();
        bytes.extend([0xc1, 0xc1]);

        let decoded = Payload::decode_all(Channel::Submission, &bytes);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], Ok(good));
        assert!(matches!(decoded[1].as_ref().unwrap_err().kind(), MalformedKind::Syntax(_)));
    }

    #[test]
    fn truncated_message_is_malformed() {
        let bytes = Payload::submission(&Request::submit("A42", ts(1))).to_bytes().unwrap();
        let decoded = Payload::decode_all(Channel::Submission, &bytes[..bytes.len() / 2]);
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].is_err());
    }

    #[test]
    fn classify_reads_serde_field_errors() {
        assert_eq!(
            classify("unknown field `priority`, expected one of `id`, `label`"),
            MalformedKind::UnknownField("priority".into())
        );
        assert_eq!(
            classify("missing field `state`"),
            MalformedKind::MissingField("state".into())
        );
        assert_eq!(
            classify("invalid type: string, expected u64"),
            MalformedKind::Syntax("invalid type: string, expected u64".into())
        );
        // Unterminated quote falls back to the whole message.
        assert_eq!(
            classify("unknown field `oops"),
            MalformedKind::Syntax("unknown field `oops".into())
        );
    }

    fn arb_request() -> impl Strategy<Value = Request> {
        (
            any::<u128>(),
            "[A-Za-z0-9 -]{0,24}",
            0u64..4_102_444_800_000,
            0usize..3,
            0u64..4_102_444_800_000,
        )
            .prop_map(|(id, label, submitted, state, fulfilled)| {
                let id = RequestId::from_uuid(uuid::Uuid::from_u128(id));
                let mut request = Request::with_id(id, label, ts(submitted));
                match RequestState::ALL[state] {
                    RequestState::Submitted => {}
                    RequestState::Acknowledged => request.acknowledge().unwrap(),
                    RequestState::Fulfilled => request.fulfill(ts(fulfilled)).unwrap(),
                }
                request
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn submission_decode_inverts_encode(request in arb_request()) {
            let payload = Payload::submission(&request);
            let decoded = Payload::from_bytes(Channel::Submission, &payload.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded, payload);
        }

        #[test]
        fn status_decode_inverts_encode(request in arb_request()) {
            let payload = Payload::status(&request);
            let decoded = Payload::from_bytes(Channel::Status, &payload.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded, payload);
        }

        #[test]
        fn full_state_decode_inverts_encode(requests in prop::collection::vec(arb_request(), 0..16)) {
            let payload = Payload::full_state(&requests);
            let decoded = Payload::from_bytes(Channel::FullState, &payload.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(&decoded, &payload);

            if let Payload::FullState(snapshot) = decoded {
                for (record, original) in snapshot.requests.into_iter().zip(&requests) {
                    let rebuilt = Request::from_record(record, original.is_synced()).unwrap();
                    prop_assert_eq!(&rebuilt, original);
                }
            }
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            for channel in Channel::ALL {
                let _ = Payload::from_bytes(channel, &bytes);
                let _ = Payload::decode_all(channel, &bytes);
            }
        }
    }
}
