#![forbid(unsafe_code)]

// Signaling protocol: request/response/notification envelopes and per-method payloads.
//
//   request:      {"request": true, "id": 7, "method": "produce", "data": {...}}
//   response:     {"response": true, "id": 7, "ok": true, "data": {...}}
//                 {"response": true, "id": 7, "ok": false, "error": {...}}
//   notification: {"notification": true, "method": "newProducer", "data": {...}}

use crate::error::{ErrorKind, SignalError, SignalResult};
use crate::media::config::TransportOptions;
use crate::media::types::{
    DtlsParameters, MediaKind, RemoteParameters, RtpCapabilities, RtpParameters, StreamScore, TransportKind,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;

/// Raw inbound envelope, before the method payload is interpreted
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub request: bool,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl RequestEnvelope {
    /// Parses a text frame. On failure returns the request id if one could be
    /// recovered, so the error can still be correlated.
    pub fn parse(text: &str) -> Result<Self, (Option<u64>, SignalError)> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| (None, SignalError::Validation(format!("malformed JSON: {e}"))))?;
        let id = value.get("id").and_then(Value::as_u64);
        let envelope: RequestEnvelope = serde_json::from_value(value)
            .map_err(|e| (id, SignalError::Validation(format!("malformed request: {e}"))))?;
        if !envelope.request {
            return Err((id, SignalError::Validation("expected a request message".into())));
        }
        Ok(envelope)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportData {
    pub kind: TransportKind,
    #[serde(default)]
    pub options: TransportOptions,
    /// Optional echo of the caller's peer id; must match the connection's peer
    #[serde(default)]
    pub peer_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportData {
    pub transport_id: String,
    #[serde(default)]
    pub dtls_parameters: Option<DtlsParameters>,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub rtcp_port: Option<u16>,
}

impl ConnectTransportData {
    /// Exactly one of DTLS parameters (WebRTC) or a remote tuple (plain) must be present
    pub fn remote_parameters(&self) -> SignalResult<RemoteParameters> {
        match (&self.dtls_parameters, self.ip, self.port) {
            (Some(dtls), None, None) => Ok(RemoteParameters::WebRtc {
                dtls_parameters: dtls.clone(),
            }),
            (None, Some(ip), Some(port)) => Ok(RemoteParameters::Plain {
                ip,
                port,
                rtcp_port: self.rtcp_port,
            }),
            (None, None, None) => Err(SignalError::Validation(
                "connectTransport needs dtlsParameters or ip/port".into(),
            )),
            _ => Err(SignalError::Validation(
                "dtlsParameters and ip/port are mutually exclusive; plain transports need both ip and port".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportIdData {
    pub transport_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceData {
    pub transport_id: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerIdData {
    #[serde(default)]
    pub producer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeData {
    #[serde(default)]
    pub producer_id: String,
    #[serde(default)]
    pub rtp_capabilities: RtpCapabilities,
    /// Receive transport to bind to; defaults to the peer's first receive-capable transport
    #[serde(default)]
    pub transport_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerIdData {
    pub consumer_id: String,
}

/// A request after its payload was decoded for the named method
#[derive(Debug, Clone)]
pub enum ClientRequest {
    GetRouterRtpCapabilities,
    CreateTransport(CreateTransportData),
    ConnectTransport(ConnectTransportData),
    RestartIce(TransportIdData),
    CloseTransport(TransportIdData),
    Produce(ProduceData),
    CloseProducer(ProducerIdData),
    PauseProducer(ProducerIdData),
    ResumeProducer(ProducerIdData),
    Consume(ConsumeData),
    CloseConsumer(ConsumerIdData),
    PauseConsumer(ConsumerIdData),
    ResumeConsumer(ConsumerIdData),
    Leave,
}

fn payload<T: DeserializeOwned>(method: &str, data: Value) -> SignalResult<T> {
    let data = if data.is_null() { Value::Object(Default::default()) } else { data };
    serde_json::from_value(data).map_err(|e| SignalError::Validation(format!("invalid {method} payload: {e}")))
}

impl ClientRequest {
    pub fn from_method(method: &str, data: Value) -> SignalResult<Self> {
        let request = match method {
            "getRouterRtpCapabilities" => ClientRequest::GetRouterRtpCapabilities,
            "createTransport" => ClientRequest::CreateTransport(payload(method, data)?),
            "connectTransport" => ClientRequest::ConnectTransport(payload(method, data)?),
            "restartIce" => ClientRequest::RestartIce(payload(method, data)?),
            "closeTransport" => ClientRequest::CloseTransport(payload(method, data)?),
            "produce" => ClientRequest::Produce(payload(method, data)?),
            "closeProducer" => ClientRequest::CloseProducer(payload(method, data)?),
            "pauseProducer" => ClientRequest::PauseProducer(payload(method, data)?),
            "resumeProducer" => ClientRequest::ResumeProducer(payload(method, data)?),
            "consume" => ClientRequest::Consume(payload(method, data)?),
            "closeConsumer" => ClientRequest::CloseConsumer(payload(method, data)?),
            "pauseConsumer" => ClientRequest::PauseConsumer(payload(method, data)?),
            "resumeConsumer" => ClientRequest::ResumeConsumer(payload(method, data)?),
            "leave" => ClientRequest::Leave,
            other => return Err(SignalError::Validation(format!("unknown method: {other}"))),
        };
        Ok(request)
    }

    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            ClientRequest::CreateTransport(_) => "createTransport",
            ClientRequest::ConnectTransport(_) => "connectTransport",
            ClientRequest::RestartIce(_) => "restartIce",
            ClientRequest::CloseTransport(_) => "closeTransport",
            ClientRequest::Produce(_) => "produce",
            ClientRequest::CloseProducer(_) => "closeProducer",
            ClientRequest::PauseProducer(_) => "pauseProducer",
            ClientRequest::ResumeProducer(_) => "resumeProducer",
            ClientRequest::Consume(_) => "consume",
            ClientRequest::CloseConsumer(_) => "closeConsumer",
            ClientRequest::PauseConsumer(_) => "pauseConsumer",
            ClientRequest::ResumeConsumer(_) => "resumeConsumer",
            ClientRequest::Leave => "leave",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
    pub retriable: bool,
}

impl From<&SignalError> for ErrorBody {
    fn from(err: &SignalError) -> Self {
        Self {
            kind: err.kind(),
            code: err.code(),
            message: err.to_string(),
            retriable: err.retriable(),
        }
    }
}

/// Response correlated with a request id
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    response: bool,
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(id: u64, data: Value) -> Self {
        Self {
            response: true,
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: u64, err: &SignalError) -> Self {
        Self {
            response: true,
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }

    /// Response for a frame whose id could not be read at all
    pub fn uncorrelated(err: &SignalError) -> Self {
        Self::failure(0, err)
    }
}

/// Producer entry in a join snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

/// Another peer as seen at join time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: String,
    pub producers: Vec<ProducerSummary>,
}

/// Resources a reconnecting peer still holds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumedSession {
    pub transport_ids: Vec<String>,
    pub producer_ids: Vec<String>,
    pub consumer_ids: Vec<String>,
}

/// Server-initiated messages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum Notification {
    /// Sent to the joining peer once it is part of the room
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        peer_id: String,
        peers: Vec<PeerSummary>,
        #[serde(skip_serializing_if = "Option::is_none")]
        resumed: Option<ResumedSession>,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: String },
    #[serde(rename_all = "camelCase")]
    ProducerPaused { producer_id: String },
    #[serde(rename_all = "camelCase")]
    ProducerResumed { producer_id: String },
    #[serde(rename_all = "camelCase")]
    ConsumerClosed { consumer_id: String, producer_id: String },
    #[serde(rename_all = "camelCase")]
    TransportClosed { transport_id: String },
    #[serde(rename_all = "camelCase")]
    ProducerScore { producer_id: String, score: StreamScore },
    #[serde(rename_all = "camelCase")]
    ConsumerScore { consumer_id: String, score: StreamScore },
}

#[derive(Serialize)]
struct NotificationFrame<'a> {
    notification: bool,
    #[serde(flatten)]
    body: &'a Notification,
}

impl Notification {
    pub fn method(&self) -> &'static str {
        match self {
            Notification::RoomJoined { .. } => "roomJoined",
            Notification::PeerJoined { .. } => "peerJoined",
            Notification::PeerLeft { .. } => "peerLeft",
            Notification::NewProducer { .. } => "newProducer",
            Notification::ProducerClosed { .. } => "producerClosed",
            Notification::ProducerPaused { .. } => "producerPaused",
            Notification::ProducerResumed { .. } => "producerResumed",
            Notification::ConsumerClosed { .. } => "consumerClosed",
            Notification::TransportClosed { .. } => "transportClosed",
            Notification::ProducerScore { .. } => "producerScore",
            Notification::ConsumerScore { .. } => "consumerScore",
        }
    }

    /// Serializes the full wire frame, ready to be shared between recipients
    pub fn to_frame(&self) -> serde_json::Result<Arc<String>> {
        serde_json::to_string(&NotificationFrame {
            notification: true,
            body: self,
        })
        .map(Arc::new)
    }
}
