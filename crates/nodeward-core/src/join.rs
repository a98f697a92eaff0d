use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

static KUBEADM_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]{6}\.[a-z0-9]{16}$").expect("static token regex is valid")
});

static SHA256_HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([0-9a-f]{64})\b").expect("static digest regex is valid"));

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Problems with join material values themselves, independent of how they
/// were fetched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MaterialsError {
    #[error("join material '{0}' is empty")]
    Empty(&'static str),
    #[error("CA fingerprint must look like sha256:<digest>, got {0:?}")]
    InvalidFingerprint(String),
    #[error("control plane endpoint must be host:port, got {0:?}")]
    InvalidEndpoint(String),
    #[error("join materials come from different rotations ({0})")]
    MixedGenerations(String),
}

/// Bootstrap token used to authenticate a joining node. Zeroed on drop and
/// redacted from `Debug` output.
#[derive(Clone)]
pub struct JoinToken(Zeroizing<String>);

impl JoinToken {
    pub fn new(value: &str) -> Result<Self, MaterialsError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(MaterialsError::Empty("token"));
        }
        Ok(Self(Zeroizing::new(value.to_string())))
    }

    /// Generate a fresh token in kubeadm's `[a-z0-9]{6}.[a-z0-9]{16}` format.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut pick = |n: usize| -> String {
            (0..n)
                .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
                .collect()
        };
        let id = pick(6);
        let secret = pick(16);
        Self(Zeroizing::new(format!("{}.{}", id, secret)))
    }

    pub fn is_kubeadm_format(&self) -> bool {
        KUBEADM_TOKEN.is_match(&self.0)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl PartialEq for JoinToken {
    fn eq(&self, other: &Self) -> bool {
        *self.0 == *other.0
    }
}

impl Eq for JoinToken {}

impl fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JoinToken(***)")
    }
}

/// Public-key pin of the cluster CA: `sha256:<digest>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaFingerprint(String);

impl CaFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract the first SHA-256 hex digest from `openssl dgst` output
    /// (e.g. `(stdin)= 3f2a...`).
    pub fn from_digest_output(output: &str) -> Result<Self, MaterialsError> {
        SHA256_HEX
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| Self(format!("sha256:{}", m.as_str())))
            .ok_or_else(|| MaterialsError::InvalidFingerprint(output.trim().to_string()))
    }
}

impl FromStr for CaFingerprint {
    type Err = MaterialsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MaterialsError::Empty("ca fingerprint"));
        }
        match s.strip_prefix("sha256:") {
            Some(digest) if !digest.is_empty() && digest.chars().all(|c| c.is_ascii_alphanumeric()) => {
                Ok(Self(s.to_string()))
            }
            _ => Err(MaterialsError::InvalidFingerprint(s.to_string())),
        }
    }
}

impl fmt::Display for CaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reachable API server address of the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneEndpoint {
    pub host: String,
    pub port: u16,
}

impl ControlPlaneEndpoint {
    pub const DEFAULT_PORT: u16 = 6443;

    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl FromStr for ControlPlaneEndpoint {
    type Err = MaterialsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MaterialsError::Empty("endpoint"));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MaterialsError::InvalidEndpoint(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| MaterialsError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() || port == 0 {
            return Err(MaterialsError::InvalidEndpoint(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ControlPlaneEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything a node needs to join the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinMaterials {
    pub token: JoinToken,
    pub ca_fingerprint: CaFingerprint,
    pub endpoint: ControlPlaneEndpoint,
}

impl JoinMaterials {
    pub fn parse(token: &str, ca_fingerprint: &str, endpoint: &str) -> Result<Self, MaterialsError> {
        Ok(Self {
            token: JoinToken::new(token)?,
            ca_fingerprint: ca_fingerprint.parse()?,
            endpoint: endpoint.parse()?,
        })
    }

    /// Assemble materials from the three stored envelopes. All three must
    /// come from the same rotation.
    pub fn from_envelopes(
        token: &MaterialEnvelope,
        ca_fingerprint: &MaterialEnvelope,
        endpoint: &MaterialEnvelope,
    ) -> Result<Self, MaterialsError> {
        if token.generation != ca_fingerprint.generation
            || token.generation != endpoint.generation
        {
            return Err(MaterialsError::MixedGenerations(format!(
                "token={}, ca-hash={}, endpoint={}",
                token.generation_label(),
                ca_fingerprint.generation_label(),
                endpoint.generation_label()
            )));
        }
        Self::parse(&token.value, &ca_fingerprint.value, &endpoint.value)
    }
}

/// Stored form of one join material value, tagged with the rotation that
/// produced it.
///
/// Values written by other tooling without an envelope decode with
/// `generation: None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialEnvelope {
    pub generation: Option<String>,
    pub value: String,
}

impl MaterialEnvelope {
    pub fn new(generation: &str, value: &str) -> Self {
        Self {
            generation: Some(generation.to_string()),
            value: value.to_string(),
        }
    }

    /// Start a new rotation identifier.
    pub fn new_generation() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<MaterialEnvelope>(raw) {
            Ok(env) if env.generation.is_some() => env,
            _ => Self {
                generation: None,
                value: raw.trim().to_string(),
            },
        }
    }

    fn generation_label(&self) -> &str {
        self.generation.as_deref().unwrap_or("none")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario_materials() {
        let m = JoinMaterials::parse("abc", "sha256:xyz", "10.0.0.5:6443").unwrap();
        assert_eq!(m.token.expose(), "abc");
        assert_eq!(m.ca_fingerprint.as_str(), "sha256:xyz");
        assert_eq!(m.endpoint, ControlPlaneEndpoint::new("10.0.0.5", 6443));
    }

    #[test]
    fn test_empty_values_rejected() {
        assert_eq!(
            JoinMaterials::parse("", "sha256:xyz", "10.0.0.5:6443").unwrap_err(),
            MaterialsError::Empty("token")
        );
        assert_eq!(
            JoinMaterials::parse("abc", " ", "10.0.0.5:6443").unwrap_err(),
            MaterialsError::Empty("ca fingerprint")
        );
        assert_eq!(
            JoinMaterials::parse("abc", "sha256:xyz", "").unwrap_err(),
            MaterialsError::Empty("endpoint")
        );
    }

    #[test]
    fn test_fingerprint_requires_prefix() {
        assert!("xyz".parse::<CaFingerprint>().is_err());
        assert!("sha256:".parse::<CaFingerprint>().is_err());
        assert!("sha256:ab cd".parse::<CaFingerprint>().is_err());
        assert!("sha256:abcd".parse::<CaFingerprint>().is_ok());
    }

    #[test]
    fn test_fingerprint_from_openssl_output() {
        let digest = "a".repeat(64);
        let fp = CaFingerprint::from_digest_output(&format!("(stdin)= {}\n", digest)).unwrap();
        assert_eq!(fp.as_str(), format!("sha256:{}", digest));
        assert!(CaFingerprint::from_digest_output("unable to load").is_err());
    }

    #[test]
    fn test_endpoint_parsing() {
        assert!("10.0.0.5".parse::<ControlPlaneEndpoint>().is_err());
        assert!("10.0.0.5:notaport".parse::<ControlPlaneEndpoint>().is_err());
        assert!(":6443".parse::<ControlPlaneEndpoint>().is_err());
        assert!("10.0.0.5:0".parse::<ControlPlaneEndpoint>().is_err());
        let ep: ControlPlaneEndpoint = "cp.internal:6443".parse().unwrap();
        assert_eq!(ep.to_string(), "cp.internal:6443");
    }

    #[test]
    fn test_generated_token_format() {
        let token = JoinToken::generate();
        assert!(token.is_kubeadm_format());
        assert_eq!(token.expose().len(), 23);
        assert_ne!(token, JoinToken::generate());
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = JoinToken::new("abcdef.0123456789abcdef").unwrap();
        let dbg = format!("{:?}", token);
        assert!(!dbg.contains("abcdef"));
        assert!(dbg.contains("***"));
    }

    #[test]
    fn test_envelope_encode_decode() {
        let env = MaterialEnvelope::new("gen-1", "10.0.0.5:6443");
        let raw = env.encode().unwrap();
        assert_eq!(MaterialEnvelope::decode(&raw), env);
    }

    #[test]
    fn test_envelope_decode_legacy_raw_value() {
        let env = MaterialEnvelope::decode("sha256:xyz\n");
        assert_eq!(env.generation, None);
        assert_eq!(env.value, "sha256:xyz");
    }

    #[test]
    fn test_from_envelopes_rejects_mixed_rotations() {
        let token = MaterialEnvelope::new("gen-2", "abc");
        let ca = MaterialEnvelope::new("gen-1", "sha256:xyz");
        let ep = MaterialEnvelope::new("gen-2", "10.0.0.5:6443");
        let err = JoinMaterials::from_envelopes(&token, &ca, &ep).unwrap_err();
        assert!(matches!(err, MaterialsError::MixedGenerations(_)));
    }

    #[test]
    fn test_from_envelopes_same_rotation() {
        let token = MaterialEnvelope::new("gen-2", "abc");
        let ca = MaterialEnvelope::new("gen-2", "sha256:xyz");
        let ep = MaterialEnvelope::new("gen-2", "10.0.0.5:6443");
        let m = JoinMaterials::from_envelopes(&token, &ca, &ep).unwrap();
        assert_eq!(m.token.expose(), "abc");
    }
}
