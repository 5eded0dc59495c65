use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeReply { pub nonce: String }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntropyStats {
    pub mean_ns: f64,
    pub variance_ns: f64,
    pub min_ns: f64,
    pub max_ns: f64,
    pub sample_count: u32, // declared count, not samples_preview.len()
    pub samples_preview: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntropyReport {
    pub nonce: String,
    pub commitment: String,
    pub derived: EntropyStats,
    pub entropy_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub family: String,
    pub arch: String,
    pub model: String,
    pub cpu: String,
    pub cores: u32,
    pub memory_gb: u32,
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSignals {
    pub macs: Vec<String>,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check<T> {
    pub passed: bool,
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiEmulation { pub vm_indicators: Vec<String> }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuFeatures { pub flags: Vec<String> }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoLatency { pub p95_ns: u32 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialBinding { pub serial: String }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintChecks {
    pub anti_emulation: Check<AntiEmulation>,
    pub cpu_features: Check<CpuFeatures>,
    pub io_latency: Check<IoLatency>,
    pub serial_binding: Check<SerialBinding>,
}

impl FingerprintChecks {
    pub fn all_passed(&self) -> bool {
        self.anti_emulation.passed
            && self.cpu_features.passed
            && self.io_latency.passed
            && self.serial_binding.passed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub all_passed: bool,
    pub checks: FingerprintChecks,
}

/// Body of `POST /attest/submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationPayload {
    pub miner: String,
    pub miner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub report: EntropyReport,
    pub device: DeviceDescriptor,
    pub signals: NetworkSignals,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollDevice {
    pub family: String,
    pub arch: String,
}

/// Body of `POST /epoch/enroll`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollPayload {
    pub miner_pubkey: String,
    pub miner_id: String,
    pub device: EnrollDevice,
}

/// What actually goes on the wire for a request. `Raw` is sent verbatim with a JSON
/// content type so that unparsable bodies can be exercised.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    Raw(String),
}

impl RequestBody {
    pub fn empty_object() -> Self {
        RequestBody::Json(serde_json::Value::Object(Default::default()))
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(RequestBody::Json(serde_json::to_value(value)?))
    }
}

/// Attestation submission, either well-formed/structurally corrupted or not JSON at all.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitBody {
    Structured(AttestationPayload),
    Raw(String),
}

impl SubmitBody {
    pub fn to_request(&self) -> Result<RequestBody, serde_json::Error> {
        match self {
            SubmitBody::Structured(p) => RequestBody::json(p),
            SubmitBody::Raw(s) => Ok(RequestBody::Raw(s.clone())),
        }
    }
}
