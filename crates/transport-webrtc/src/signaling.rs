//! Payloads exchanged over the signaling bus.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RtcResult;
use crate::peer::{IceCandidate, SessionDescription};

/// A session description plus the candidates gathered alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Negotiation {
    pub description: SessionDescription,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
}

pub type Offer = Negotiation;
pub type Answer = Negotiation;

impl Negotiation {
    pub fn new(description: SessionDescription) -> Self {
        Self {
            description,
            candidates: Vec::new(),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<IceCandidate>) -> Self {
        self.candidates = candidates;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferRequest {
    pub session_id: String,
    pub offer: Offer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEnvelope {
    pub session_id: String,
    pub candidate: IceCandidate,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> RtcResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub(crate) fn decode<T: DeserializeOwned>(payload: &[u8]) -> RtcResult<T> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtcError;

    #[test_timeout::timeout]
    fn offer_request_shape() {
        let request = OfferRequest {
            session_id: "s-1".into(),
            offer: Negotiation::new(SessionDescription::offer("v=0")),
        };
        let payload = encode(&request).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(value["session_id"], "s-1");
        assert_eq!(value["offer"]["description"]["type"], "offer");
        assert_eq!(value["offer"]["candidates"], serde_json::json!([]));

        let back: OfferRequest = decode(&payload).expect("decode");
        assert_eq!(back, request);
    }

    #[test_timeout::timeout]
    fn answer_without_candidates_field_decodes() {
        let answer: Answer =
            decode(br#"{"description":{"type":"answer","sdp":"v=0"}}"#).expect("decode");
        assert!(answer.candidates.is_empty());
    }

    #[test_timeout::timeout]
    fn malformed_envelope_is_payload_error() {
        let err = decode::<CandidateEnvelope>(b"{\"session_id\":1}").expect_err("malformed");
        assert!(matches!(err, RtcError::Payload(_)));
    }
}
