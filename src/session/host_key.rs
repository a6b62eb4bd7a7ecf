//! Host identity verification for SSH sessions
//!
//! Every SSH session passes the key presented during the handshake to a
//! [`HostKeyVerifier`] before any credential is sent. The default verifier
//! checks an OpenSSH `known_hosts` file and rejects unknown or changed keys.
//! [`AcceptAnyHost`] skips the check entirely and must be selected explicitly.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Key presented by a remote host during the handshake
#[derive(Debug, Clone)]
pub struct HostIdentity {
    /// Raw public key blob
    pub key: Vec<u8>,
    /// Key algorithm as reported by libssh2 (e.g. `Ed25519`, `Rsa`)
    pub key_type: String,
    /// OpenSSH style `SHA256:<base64>` fingerprint, when available
    pub fingerprint: Option<String>,
}

/// Verdict of a [`HostKeyVerifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyDecision {
    Accept,
    Reject(String),
}

/// Pluggable host identity check
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, port: u16, identity: &HostIdentity) -> HostKeyDecision;
}

/// Which verifier a run uses
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    #[default]
    Strict,
    AcceptAny,
}

/// Strict verification against an OpenSSH `known_hosts` file
#[derive(Debug, Clone)]
pub struct KnownHostsVerifier {
    path: PathBuf,
}

impl KnownHostsVerifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.ssh/known_hosts` of the invoking user
    pub fn default_path() -> Option<PathBuf> {
        std::env::var("HOME")
            .ok()
            .map(|home| Path::new(&home).join(".ssh").join("known_hosts"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HostKeyVerifier for KnownHostsVerifier {
    fn verify(&self, host: &str, port: u16, identity: &HostIdentity) -> HostKeyDecision {
        // libssh2 needs a session handle to parse known_hosts; it is never connected
        let session = match Session::new() {
            Ok(session) => session,
            Err(e) => return HostKeyDecision::Reject(format!("cannot check host key: {}", e)),
        };
        let mut known_hosts = match session.known_hosts() {
            Ok(known_hosts) => known_hosts,
            Err(e) => return HostKeyDecision::Reject(format!("cannot check host key: {}", e)),
        };

        if let Err(e) = known_hosts.read_file(&self.path, KnownHostFileKind::OpenSSH) {
            return HostKeyDecision::Reject(format!(
                "cannot read known hosts file {}: {}",
                self.path.display(),
                e
            ));
        }

        match known_hosts.check_port(host, port, &identity.key) {
            CheckResult::Match => {
                debug!("Host key for {}:{} matches {}", host, port, self.path.display());
                HostKeyDecision::Accept
            }
            CheckResult::NotFound => HostKeyDecision::Reject(format!(
                "no entry for {} in {} (add it with ssh-keyscan or connect once with ssh)",
                host,
                self.path.display()
            )),
            CheckResult::Mismatch => HostKeyDecision::Reject(format!(
                "host key for {} does not match {}; the host may have been reinstalled or the connection intercepted",
                host,
                self.path.display()
            )),
            CheckResult::Failure => {
                HostKeyDecision::Reject(format!("failed to check host key for {}", host))
            }
        }
    }
}

/// Accepts any host key. Opt-in only; connections are open to interception.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyHost;

impl HostKeyVerifier for AcceptAnyHost {
    fn verify(&self, host: &str, port: u16, identity: &HostIdentity) -> HostKeyDecision {
        warn!(
            "Accepting unverified {} host key for {}:{} (fingerprint {})",
            identity.key_type,
            host,
            port,
            identity.fingerprint.as_deref().unwrap_or("unknown")
        );
        HostKeyDecision::Accept
    }
}

/// Build the verifier for `policy`
///
/// Strict verification without an explicit path falls back to
/// `~/.ssh/known_hosts`; with no home directory every host is rejected.
pub fn build_verifier(
    policy: HostKeyPolicy,
    known_hosts: Option<&Path>,
) -> Arc<dyn HostKeyVerifier> {
    match policy {
        HostKeyPolicy::AcceptAny => {
            warn!("Host key verification disabled: every host identity will be accepted");
            Arc::new(AcceptAnyHost)
        }
        HostKeyPolicy::Strict => {
            let path = known_hosts
                .map(Path::to_path_buf)
                .or_else(KnownHostsVerifier::default_path)
                .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"));
            Arc::new(KnownHostsVerifier::new(path))
        }
    }
}

/// Render a SHA-256 host key digest the way `ssh-keygen -l` prints it
pub(crate) fn fingerprint(sha256: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(sha256))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn identity() -> HostIdentity {
        HostIdentity {
            key: vec![0, 0, 0, 11, b's', b's', b'h', 1, 2, 3],
            key_type: "Ed25519".to_string(),
            fingerprint: Some("SHA256:abcd".to_string()),
        }
    }

    /// Wire-format ssh-ed25519 public key blob filled with `fill`
    fn ed25519_identity(fill: u8) -> HostIdentity {
        let mut key = vec![0, 0, 0, 11];
        key.extend_from_slice(b"ssh-ed25519");
        key.extend_from_slice(&[0, 0, 0, 32]);
        key.extend_from_slice(&[fill; 32]);
        HostIdentity {
            key,
            key_type: "Ed25519".to_string(),
            fingerprint: None,
        }
    }

    fn known_hosts_line(host: &str, identity: &HostIdentity) -> String {
        format!("{} ssh-ed25519 {}", host, STANDARD.encode(&identity.key))
    }

    fn known_hosts_file(lines: &[String]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_accept_any_accepts() {
        let decision = AcceptAnyHost.verify("web1", 22, &identity());
        assert_eq!(decision, HostKeyDecision::Accept);
    }

    #[test]
    fn test_known_hosts_missing_file_rejects() {
        let verifier = KnownHostsVerifier::new("/nonexistent/eagledeploy/known_hosts");
        let decision = verifier.verify("web1", 22, &identity());
        assert!(matches!(decision, HostKeyDecision::Reject(reason) if reason.contains("cannot read")));
    }

    #[test]
    fn test_known_hosts_unknown_host_rejects() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# no hosts trusted yet").unwrap();

        let verifier = KnownHostsVerifier::new(file.path());
        let decision = verifier.verify("web1", 22, &identity());
        assert!(matches!(decision, HostKeyDecision::Reject(_)));
    }

    #[test]
    fn test_policy_defaults_to_strict() {
        assert_eq!(HostKeyPolicy::default(), HostKeyPolicy::Strict);
    }

    #[test]
    fn test_policy_deserialize() {
        let policy: HostKeyPolicy = serde_yaml::from_str("accept-any").unwrap();
        assert_eq!(policy, HostKeyPolicy::AcceptAny);
        let policy: HostKeyPolicy = serde_yaml::from_str("strict").unwrap();
        assert_eq!(policy, HostKeyPolicy::Strict);
    }

    #[test]
    fn test_build_verifier_strict_uses_given_path() {
        let file = NamedTempFile::new().unwrap();
        let verifier = build_verifier(HostKeyPolicy::Strict, Some(file.path()));
        // Empty known_hosts trusts nobody
        assert!(matches!(
            verifier.verify("web1", 22, &identity()),
            HostKeyDecision::Reject(_)
        ));
    }

    #[test]
    fn test_known_hosts_matching_key_accepts() {
        let host_key = ed25519_identity(7);
        let file = known_hosts_file(&[known_hosts_line("web1", &host_key)]);

        let verifier = KnownHostsVerifier::new(file.path());
        assert_eq!(verifier.verify("web1", 22, &host_key), HostKeyDecision::Accept);
        // Same key, different host name
        assert!(matches!(
            verifier.verify("web2", 22, &host_key),
            HostKeyDecision::Reject(_)
        ));
    }

    #[test]
    fn test_known_hosts_bracketed_entry_for_custom_port() {
        let host_key = ed25519_identity(7);
        let file = known_hosts_file(&[known_hosts_line("[web2]:2222", &host_key)]);

        let verifier = KnownHostsVerifier::new(file.path());
        assert_eq!(verifier.verify("web2", 2222, &host_key), HostKeyDecision::Accept);
        assert!(matches!(
            verifier.verify("web2", 22, &host_key),
            HostKeyDecision::Reject(_)
        ));
    }

    #[test]
    fn test_known_hosts_changed_key_is_mismatch() {
        let trusted = ed25519_identity(7);
        let presented = ed25519_identity(8);
        let file = known_hosts_file(&[known_hosts_line("web1", &trusted)]);

        let verifier = KnownHostsVerifier::new(file.path());
        assert!(matches!(
            verifier.verify("web1", 22, &presented),
            HostKeyDecision::Reject(reason) if reason.contains("does not match")
        ));
    }

    #[test]
    fn test_fingerprint_matches_ssh_keygen_format() {
        // SHA-256 of the empty string
        let digest = [
            0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f,
            0xb9, 0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b,
            0x78, 0x52, 0xb8, 0x55,
        ];
        assert_eq!(
            fingerprint(&digest),
            "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }
}
