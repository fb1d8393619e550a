//! Keyed signatures for resume links.
//!
//! A signature binds a job id and a resume id (and optionally the approver the
//! link was minted for) under a workspace-scoped secret. Signatures carry no
//! timestamp: a link stays valid until the key is rotated, and its useful
//! lifetime is bounded by the suspend timeout of the step it targets.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Derives and verifies resume-link signatures.
///
/// The instance secret is injected at construction; workspaces may carry
/// their own key, which takes precedence. Rotating a key makes every
/// signature minted under the old key unverifiable.
pub struct SignatureService {
    instance_secret: String,
    workspace_keys: RwLock<HashMap<String, String>>,
}

impl SignatureService {
    pub fn new(instance_secret: impl Into<String>) -> Self {
        Self {
            instance_secret: instance_secret.into(),
            workspace_keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_workspace_key(self, workspace_id: &str, key: impl Into<String>) -> Self {
        self.workspace_keys
            .write()
            .insert(workspace_id.to_string(), key.into());
        self
    }

    /// Replace the workspace key. Links signed with the previous key stop verifying.
    pub fn rotate_workspace_key(&self, workspace_id: &str, key: impl Into<String>) {
        self.workspace_keys
            .write()
            .insert(workspace_id.to_string(), key.into());
        tracing::info!(workspace = %workspace_id, "Workspace signing key rotated");
    }

    /// Hex-encoded HMAC-SHA256 over `job_id || resume_id (u32 BE) || approver`.
    pub fn sign(
        &self,
        workspace_id: &str,
        job_id: Uuid,
        resume_id: u32,
        approver: Option<&str>,
    ) -> String {
        hex::encode(self.mac(workspace_id, job_id, resume_id, approver).finalize().into_bytes())
    }

    /// Never fails: malformed or truncated input simply does not verify.
    pub fn verify(
        &self,
        workspace_id: &str,
        job_id: Uuid,
        resume_id: u32,
        approver: Option<&str>,
        signature: &str,
    ) -> bool {
        let Ok(bytes) = hex::decode(signature.trim()) else {
            return false;
        };
        self.mac(workspace_id, job_id, resume_id, approver)
            .verify_slice(&bytes)
            .is_ok()
    }

    fn mac(
        &self,
        workspace_id: &str,
        job_id: Uuid,
        resume_id: u32,
        approver: Option<&str>,
    ) -> HmacSha256 {
        let key = self.key_for(workspace_id);
        // HMAC accepts keys of any length.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(job_id.as_bytes());
        mac.update(&resume_id.to_be_bytes());
        if let Some(approver) = approver.filter(|a| !a.is_empty()) {
            mac.update(approver.as_bytes());
        }
        mac
    }

    fn key_for(&self, workspace_id: &str) -> String {
        self.workspace_keys
            .read()
            .get(workspace_id)
            .cloned()
            .unwrap_or_else(|| self.instance_secret.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SignatureService {
        SignatureService::new("instance-secret").with_workspace_key("acme", "acme-key")
    }

    #[test]
    fn sign_is_deterministic() {
        let svc = service();
        let job = Uuid::new_v4();
        assert_eq!(svc.sign("acme", job, 0, None), svc.sign("acme", job, 0, None));
        assert_eq!(svc.sign("acme", job, 0, None).len(), 64);
    }

    #[test]
    fn verify_accepts_own_signature() {
        let svc = service();
        let job = Uuid::new_v4();
        let sig = svc.sign("acme", job, 3, Some("alice"));
        assert!(svc.verify("acme", job, 3, Some("alice"), &sig));
    }

    #[test]
    fn verify_rejects_other_job_or_resume_id() {
        let svc = service();
        let job = Uuid::new_v4();
        let sig = svc.sign("acme", job, 1, None);
        assert!(!svc.verify("acme", Uuid::new_v4(), 1, None, &sig));
        assert!(!svc.verify("acme", job, 2, None, &sig));
    }

    #[test]
    fn verify_rejects_truncated_and_corrupted() {
        let svc = service();
        let job = Uuid::new_v4();
        let sig = svc.sign("acme", job, 0, None);

        assert!(!svc.verify("acme", job, 0, None, &sig[..sig.len() - 2]));
        assert!(!svc.verify("acme", job, 0, None, ""));
        assert!(!svc.verify("acme", job, 0, None, "not-hex-at-all"));

        let mut corrupted = sig.clone().into_bytes();
        corrupted[0] = if corrupted[0] == b'a' { b'b' } else { b'a' };
        let corrupted = String::from_utf8(corrupted).unwrap();
        assert!(!svc.verify("acme", job, 0, None, &corrupted));
    }

    #[test]
    fn approver_is_bound_into_signature() {
        let svc = service();
        let job = Uuid::new_v4();
        let sig = svc.sign("acme", job, 0, Some("alice"));
        assert!(!svc.verify("acme", job, 0, Some("mallory"), &sig));
        assert!(!svc.verify("acme", job, 0, None, &sig));
    }

    #[test]
    fn workspaces_do_not_share_keys() {
        let svc = service();
        let job = Uuid::new_v4();
        let sig = svc.sign("acme", job, 0, None);
        assert!(!svc.verify("globex", job, 0, None, &sig));
    }

    #[test]
    fn rotation_invalidates_old_signatures() {
        let svc = service();
        let job = Uuid::new_v4();
        let sig = svc.sign("acme", job, 0, None);
        svc.rotate_workspace_key("acme", "acme-key-2");
        assert!(!svc.verify("acme", job, 0, None, &sig));
        let fresh = svc.sign("acme", job, 0, None);
        assert!(svc.verify("acme", job, 0, None, &fresh));
    }
}
