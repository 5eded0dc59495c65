//! Synthetic miner identities and the attestation payloads they submit.

use std::io;

use rand::{Rng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::prng::gaussian;
use crate::types::{
    AntiEmulation, AttestationPayload, Check, CpuFeatures, DeviceDescriptor, EnrollDevice,
    EnrollPayload, EntropyReport, EntropyStats, Fingerprint, FingerprintChecks, IoLatency,
    NetworkSignals, SerialBinding, SubmitBody,
};

/// Samples actually drawn for the entropy preview.
pub const ENTROPY_SAMPLES: usize = 12;
/// Sample count declared in the report. The target expects 48 even though only
/// `ENTROPY_SAMPLES` are generated; kept as observed.
pub const DECLARED_SAMPLE_COUNT: u32 = 48;

const SAMPLE_JITTER_NS: f64 = 500.0;
const CORES: [u32; 5] = [1, 2, 4, 8, 16];
const MEMORY_GB: [u32; 6] = [2, 4, 8, 16, 32, 64];
const BAD_COMMITMENT: &str = "invalid_hash_value";
const WRONG_ARCH: &str = "intel-i9-but-really-g4";
const CORRUPT_JSON: &str = "{\"invalid\": json...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuFamily {
    PowerPc,
    Arm64,
    X86_64,
}

impl CpuFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuFamily::PowerPc => "PowerPC",
            CpuFamily::Arm64 => "ARM64",
            CpuFamily::X86_64 => "x86_64",
        }
    }

    /// Feature flag reported by the `cpu_features` fingerprint check.
    pub fn feature_flag(&self) -> &'static str {
        match self {
            CpuFamily::PowerPc => "altivec",
            CpuFamily::Arm64 | CpuFamily::X86_64 => "avx2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchetypeDescriptor {
    pub key: &'static str,
    pub model: &'static str,
    pub family: CpuFamily,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareArchetype {
    PowerPcG4,
    PowerPcG5,
    AppleSilicon,
    ModernX86,
}

impl HardwareArchetype {
    pub const ALL: [HardwareArchetype; 4] = [
        HardwareArchetype::PowerPcG4,
        HardwareArchetype::PowerPcG5,
        HardwareArchetype::AppleSilicon,
        HardwareArchetype::ModernX86,
    ];

    pub fn descriptor(&self) -> ArchetypeDescriptor {
        match self {
            HardwareArchetype::PowerPcG4 => ArchetypeDescriptor {
                key: "g4",
                model: "PowerPC G4 (7447A)",
                family: CpuFamily::PowerPc,
                weight: 2.5,
            },
            HardwareArchetype::PowerPcG5 => ArchetypeDescriptor {
                key: "g5",
                model: "PowerPC G5 (970MP)",
                family: CpuFamily::PowerPc,
                weight: 2.0,
            },
            HardwareArchetype::AppleSilicon => ArchetypeDescriptor {
                key: "apple_silicon",
                model: "Apple M2 Max",
                family: CpuFamily::Arm64,
                weight: 1.2,
            },
            HardwareArchetype::ModernX86 => ArchetypeDescriptor {
                key: "modern_x86",
                model: "AMD Ryzen 9 7950X",
                family: CpuFamily::X86_64,
                weight: 1.0,
            },
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.descriptor().key == key)
    }

    pub fn choose<R: RngCore>(rng: &mut R) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }
}

impl std::fmt::Display for HardwareArchetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.descriptor().key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinerProfile {
    pub archetype: HardwareArchetype,
    pub miner_id: String,
    pub wallet: String,
    pub serial: String,
    pub hostname: String,
    pub mac: [u8; 6],
}

impl MinerProfile {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let archetype = HardwareArchetype::choose(rng);
        let miner_id = format!("sim-{}-{:08x}", archetype, rng.next_u32());
        let wallet = derive_wallet(&miner_id, rng);
        let serial = format!("SN-{:012X}", rng.next_u64() & 0xFFFF_FFFF_FFFF);
        let hostname = format!("host-{miner_id}");
        let mut mac = [0u8; 6];
        rng.fill_bytes(&mut mac);
        Self { archetype, miner_id, wallet, serial, hostname, mac }
    }

    /// Replace the identity with a shared one. The wallet is left alone so the
    /// target sees one miner id claimed by several wallets.
    pub fn with_forced_id(mut self, miner_id: &str) -> Self {
        self.miner_id = miner_id.to_string();
        self.hostname = format!("host-{miner_id}");
        self
    }

    pub fn mac_address(&self) -> String {
        self.mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
    }
}

/// sha256(id-timestamp-random), truncated to 38 hex chars and tagged.
fn derive_wallet<R: RngCore>(miner_id: &str, rng: &mut R) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    let salt: f64 = rng.gen_range(0.0..1.0);
    let digest = Sha256::digest(format!("{miner_id}-{now}-{salt}").as_bytes());
    let mut wallet = hex::encode(digest);
    wallet.truncate(38);
    wallet.push_str("RTC");
    wallet
}

/// Sorted keys with `", "` / `": "` separators.
struct CanonicalFormatter;

impl serde_json::ser::Formatter for CanonicalFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

pub fn canonical_entropy(stats: &EntropyStats) -> Result<String, serde_json::Error> {
    // serde_json::Map is ordered by key unless preserve_order is enabled
    let value = serde_json::to_value(stats)?;
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// hex(sha256(nonce ‖ wallet ‖ canonical entropy))
pub fn commitment(nonce: &str, wallet: &str, stats: &EntropyStats) -> Result<String, serde_json::Error> {
    let mut h = Sha256::new();
    h.update(nonce.as_bytes());
    h.update(wallet.as_bytes());
    h.update(canonical_entropy(stats)?.as_bytes());
    Ok(hex::encode(h.finalize()))
}

/// One structural corruption applied to an otherwise valid submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Corruption {
    MissingNonce,
    BadCommitment,
    WrongArch,
    CorruptJson,
}

impl Corruption {
    pub const ALL: [Corruption; 4] = [
        Corruption::MissingNonce,
        Corruption::BadCommitment,
        Corruption::WrongArch,
        Corruption::CorruptJson,
    ];

    pub fn apply(self, mut payload: AttestationPayload) -> SubmitBody {
        match self {
            Corruption::MissingNonce => payload.nonce = None,
            Corruption::BadCommitment => payload.report.commitment = BAD_COMMITMENT.to_string(),
            Corruption::WrongArch => payload.device.arch = WRONG_ARCH.to_string(),
            Corruption::CorruptJson => return SubmitBody::Raw(CORRUPT_JSON.to_string()),
        }
        SubmitBody::Structured(payload)
    }
}

/// Structural invariants of a well-formed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadViolation {
    Unparsable,
    MissingNonce,
    NonceMismatch,
    CommitmentMismatch,
    ArchFamilyMismatch,
    FingerprintFailed,
}

pub fn payload_violations(body: &SubmitBody) -> Vec<PayloadViolation> {
    let parsed;
    let payload = match body {
        SubmitBody::Structured(p) => p,
        SubmitBody::Raw(raw) => match serde_json::from_str::<AttestationPayload>(raw) {
            Ok(p) => {
                parsed = p;
                &parsed
            }
            Err(_) => return vec![PayloadViolation::Unparsable],
        },
    };

    let mut out = Vec::new();
    match &payload.nonce {
        None => out.push(PayloadViolation::MissingNonce),
        Some(n) if *n != payload.report.nonce => out.push(PayloadViolation::NonceMismatch),
        Some(_) => {}
    }
    let expected = commitment(&payload.report.nonce, &payload.miner, &payload.report.derived);
    if expected.ok().as_deref() != Some(payload.report.commitment.as_str()) {
        out.push(PayloadViolation::CommitmentMismatch);
    }
    let arch_ok = HardwareArchetype::from_key(&payload.device.arch)
        .is_some_and(|a| a.descriptor().family.as_str() == payload.device.family);
    if !arch_ok {
        out.push(PayloadViolation::ArchFamilyMismatch);
    }
    if !(payload.fingerprint.all_passed && payload.fingerprint.checks.all_passed()) {
        out.push(PayloadViolation::FingerprintFailed);
    }
    out
}

/// A synthetic miner: one profile plus the random source its payloads are drawn from.
pub struct MinerSimulator<R: RngCore> {
    profile: MinerProfile,
    rng: R,
}

impl<R: RngCore> MinerSimulator<R> {
    pub fn generate(mut rng: R) -> Self {
        let profile = MinerProfile::generate(&mut rng);
        Self { profile, rng }
    }

    pub fn with_forced_id(mut self, miner_id: &str) -> Self {
        self.profile = self.profile.with_forced_id(miner_id);
        self
    }

    pub fn profile(&self) -> &MinerProfile {
        &self.profile
    }

    pub fn build_entropy_report(&mut self, nonce: &str) -> Result<EntropyReport, serde_json::Error> {
        let base = self.rng.gen_range(20_000.0..30_000.0);
        let samples: Vec<f64> = (0..ENTROPY_SAMPLES)
            .map(|_| gaussian(&mut self.rng, base, SAMPLE_JITTER_NS))
            .collect();

        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let derived = EntropyStats {
            mean_ns: mean,
            variance_ns: variance,
            min_ns: min,
            max_ns: max,
            sample_count: DECLARED_SAMPLE_COUNT,
            samples_preview: samples,
        };
        let commitment = commitment(nonce, &self.profile.wallet, &derived)?;

        Ok(EntropyReport {
            nonce: nonce.to_string(),
            commitment,
            entropy_score: derived.variance_ns,
            derived,
        })
    }

    pub fn build_attestation_payload(&mut self, nonce: &str) -> Result<AttestationPayload, serde_json::Error> {
        let report = self.build_entropy_report(nonce)?;
        let d = self.profile.archetype.descriptor();
        let cores = CORES[self.rng.gen_range(0..CORES.len())];
        let memory_gb = MEMORY_GB[self.rng.gen_range(0..MEMORY_GB.len())];
        let p95_ns = self.rng.gen_range(100..=500);
        let p = &self.profile;

        let checks = FingerprintChecks {
            anti_emulation: Check { passed: true, data: AntiEmulation { vm_indicators: vec![] } },
            cpu_features: Check {
                passed: true,
                data: CpuFeatures { flags: vec![d.family.feature_flag().to_string()] },
            },
            io_latency: Check { passed: true, data: IoLatency { p95_ns } },
            serial_binding: Check { passed: true, data: SerialBinding { serial: p.serial.clone() } },
        };

        Ok(AttestationPayload {
            miner: p.wallet.clone(),
            miner_id: p.miner_id.clone(),
            nonce: Some(nonce.to_string()),
            report,
            device: DeviceDescriptor {
                family: d.family.as_str().to_string(),
                arch: d.key.to_string(),
                model: d.model.to_string(),
                cpu: d.model.to_string(),
                cores,
                memory_gb,
                serial: p.serial.clone(),
            },
            signals: NetworkSignals {
                macs: vec![p.mac_address()],
                hostname: p.hostname.clone(),
            },
            fingerprint: Fingerprint { all_passed: checks.all_passed(), checks },
        })
    }

    pub fn build_enroll_payload(&self) -> EnrollPayload {
        let d = self.profile.archetype.descriptor();
        EnrollPayload {
            miner_pubkey: self.profile.wallet.clone(),
            miner_id: self.profile.miner_id.clone(),
            device: EnrollDevice {
                family: d.family.as_str().to_string(),
                arch: d.key.to_string(),
            },
        }
    }

    /// Valid payload with exactly one corruption picked uniformly.
    pub fn build_malformed_payload(&mut self, nonce: &str) -> Result<(Corruption, SubmitBody), serde_json::Error> {
        let payload = self.build_attestation_payload(nonce)?;
        let corruption = Corruption::ALL[self.rng.gen_range(0..Corruption::ALL.len())];
        Ok((corruption, corruption.apply(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::DPrng;
    use std::collections::HashSet;

    fn sim(index: usize) -> MinerSimulator<DPrng> {
        MinerSimulator::generate(DPrng::for_session(42, index))
    }

    #[test]
    fn well_formed_payload_has_no_violations() {
        for i in 0..32 {
            let mut s = sim(i);
            let p = s.build_attestation_payload("nonce-abc").unwrap();
            assert!(payload_violations(&SubmitBody::Structured(p)).is_empty());
        }
    }

    #[test]
    fn each_corruption_breaks_exactly_one_invariant() {
        let mut s = sim(0);
        let valid = s.build_attestation_payload("n-1").unwrap();
        for c in Corruption::ALL {
            let v = payload_violations(&c.apply(valid.clone()));
            assert_eq!(v.len(), 1, "{c:?} produced {v:?}");
            let expected = match c {
                Corruption::MissingNonce => PayloadViolation::MissingNonce,
                Corruption::BadCommitment => PayloadViolation::CommitmentMismatch,
                Corruption::WrongArch => PayloadViolation::ArchFamilyMismatch,
                Corruption::CorruptJson => PayloadViolation::Unparsable,
            };
            assert_eq!(v[0], expected);
        }
    }

    #[test]
    fn malformed_builder_always_violates_one() {
        let mut seen = HashSet::new();
        for i in 0..64 {
            let (c, body) = sim(i).build_malformed_payload("n").unwrap();
            seen.insert(c);
            assert_eq!(payload_violations(&body).len(), 1);
        }
        assert_eq!(seen.len(), Corruption::ALL.len());
    }

    #[test]
    fn commitment_reproduces_from_payload_fields() {
        let mut s = sim(3);
        let p = s.build_attestation_payload("deadbeef").unwrap();
        let back: AttestationPayload = serde_json::from_value(serde_json::to_value(&p).unwrap()).unwrap();
        let again = commitment(back.nonce.as_deref().unwrap(), &back.miner, &back.report.derived).unwrap();
        assert_eq!(again, back.report.commitment);
    }

    #[test]
    fn canonical_encoding_sorts_keys_and_spaces_separators() {
        let stats = EntropyStats {
            mean_ns: 1.5,
            variance_ns: 2.0,
            min_ns: 1.0,
            max_ns: 2.0,
            sample_count: 48,
            samples_preview: vec![1.0, 2.0],
        };
        assert_eq!(
            canonical_entropy(&stats).unwrap(),
            r#"{"max_ns": 2.0, "mean_ns": 1.5, "min_ns": 1.0, "sample_count": 48, "samples_preview": [1.0, 2.0], "variance_ns": 2.0}"#
        );
    }

    #[test]
    fn entropy_report_statistics() {
        let mut s = sim(5);
        let r = s.build_entropy_report("n").unwrap();
        let d = &r.derived;
        assert_eq!(d.samples_preview.len(), ENTROPY_SAMPLES);
        assert_eq!(d.sample_count, DECLARED_SAMPLE_COUNT);
        assert!(d.min_ns <= d.mean_ns && d.mean_ns <= d.max_ns);
        assert_eq!(r.entropy_score, d.variance_ns);
        assert!(d.mean_ns > 15_000.0 && d.mean_ns < 35_000.0);
    }

    #[test]
    fn cpu_flag_follows_family() {
        for a in HardwareArchetype::ALL {
            let d = a.descriptor();
            let flag = d.family.feature_flag();
            match a {
                HardwareArchetype::PowerPcG4 | HardwareArchetype::PowerPcG5 => assert_eq!(flag, "altivec"),
                HardwareArchetype::AppleSilicon | HardwareArchetype::ModernX86 => assert_eq!(flag, "avx2"),
            }
            assert_eq!(HardwareArchetype::from_key(d.key), Some(a));
        }
    }

    #[test]
    fn forced_id_keeps_wallet_unique() {
        let a = sim(1).with_forced_id("duplicate-miner-ab12");
        let b = sim(2).with_forced_id("duplicate-miner-ab12");
        assert_eq!(a.profile().miner_id, b.profile().miner_id);
        assert_ne!(a.profile().wallet, b.profile().wallet);
        assert_eq!(a.profile().wallet.len(), 41);
        assert!(a.profile().wallet.ends_with("RTC"));
        assert_eq!(a.build_enroll_payload().miner_id, "duplicate-miner-ab12");
    }

    #[test]
    fn mac_is_colon_separated_hex() {
        let m = sim(9).profile().mac_address();
        assert_eq!(m.len(), 17);
        assert_eq!(m.matches(':').count(), 5);
    }
}
