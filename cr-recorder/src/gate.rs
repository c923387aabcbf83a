use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::warn;
use uuid::Uuid;

use crate::logging::{Category, category};

const LOCAL_SCHEME: &str = "local:";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GateMode {
    #[default]
    Enforced,
    /// Validation is unavailable; every candidate is admitted.
    Unsupported,
}

impl std::str::FromStr for GateMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on" | "enforced" => Ok(GateMode::Enforced),
            "off" | "unsupported" => Ok(GateMode::Unsupported),
            other => Err(format!("unknown gate mode: {other}")),
        }
    }
}

/// Handle to the resource an upload worker runs under. Revocation is shared
/// by every clone.
#[derive(Clone, Debug)]
pub struct LocalResource {
    handle: String,
    revoked: Arc<AtomicBool>,
}

impl LocalResource {
    fn new(handle: String) -> Self {
        Self {
            handle,
            revoked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Returns `true` for the call that performed the revocation.
    pub fn revoke(&self) -> bool {
        !self.revoked.swap(true, Ordering::AcqRel)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectionReason {
    NotLocal,
    NotMinted,
    Revoked,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceGateRejection {
    pub candidate: String,
    pub reason: RejectionReason,
}

impl std::fmt::Display for ResourceGateRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self.reason {
            RejectionReason::NotLocal => "not a locally generated resource",
            RejectionReason::NotMinted => "not minted by this gate",
            RejectionReason::Revoked => "already revoked",
        };
        write!(f, "worker resource {:?} rejected: {reason}", self.candidate)
    }
}

impl std::error::Error for ResourceGateRejection {}

/// Admits only the worker resource it minted itself.
#[derive(Debug, Default)]
pub struct ResourceGate {
    mode: GateMode,
    minted: Option<LocalResource>,
}

impl ResourceGate {
    pub fn new(mode: GateMode) -> Self {
        Self { mode, minted: None }
    }

    pub fn mode(&self) -> GateMode {
        self.mode
    }

    /// Mints a fresh resource, replacing (and revoking) any earlier one.
    pub fn mint(&mut self) -> LocalResource {
        if let Some(previous) = self.minted.take() {
            previous.revoke();
        }
        let resource = LocalResource::new(format!("{LOCAL_SCHEME}{}", Uuid::new_v4()));
        self.minted = Some(resource.clone());
        resource
    }

    pub fn admit(&self, candidate: &str) -> Result<LocalResource, ResourceGateRejection> {
        if self.mode == GateMode::Unsupported {
            warn!(
                "{} resource validation unsupported, admitting {candidate:?} unguarded",
                category(Category::Gate)
            );
            return Ok(match &self.minted {
                Some(minted) if minted.handle() == candidate => minted.clone(),
                _ => LocalResource::new(candidate.to_string()),
            });
        }

        let reject = |reason| ResourceGateRejection {
            candidate: candidate.to_string(),
            reason,
        };
        if !candidate.starts_with(LOCAL_SCHEME) {
            return Err(reject(RejectionReason::NotLocal));
        }
        match &self.minted {
            Some(minted) if minted.handle() == candidate => {
                if minted.is_revoked() {
                    Err(reject(RejectionReason::Revoked))
                } else {
                    Ok(minted.clone())
                }
            }
            _ => Err(reject(RejectionReason::NotMinted)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_resource_is_admitted() {
        let mut gate = ResourceGate::new(GateMode::Enforced);
        let resource = gate.mint();
        assert!(resource.handle().starts_with("local:"));
        let admitted = gate
            .admit(resource.handle())
            .expect("minted resource should be admitted");
        assert!(admitted.revoke());
        assert!(resource.is_revoked(), "revocation is shared across clones");
    }

    #[test]
    fn external_and_foreign_resources_are_rejected() {
        let mut gate = ResourceGate::new(GateMode::Enforced);
        gate.mint();

        let err = gate
            .admit("https://cdn.example.com/worker.js")
            .expect_err("remote url should be rejected");
        assert_eq!(err.reason, RejectionReason::NotLocal);

        let err = gate
            .admit("local:00000000-0000-0000-0000-000000000000")
            .expect_err("unknown local handle should be rejected");
        assert_eq!(err.reason, RejectionReason::NotMinted);
    }

    #[test]
    fn revoked_and_replaced_resources_are_rejected() {
        let mut gate = ResourceGate::new(GateMode::Enforced);
        let first = gate.mint();
        first.revoke();
        let err = gate
            .admit(first.handle())
            .expect_err("revoked resource should be rejected");
        assert_eq!(err.reason, RejectionReason::Revoked);

        let second = gate.mint();
        assert!(gate.admit(second.handle()).is_ok());
        let err = gate
            .admit(first.handle())
            .expect_err("replaced resource should be rejected");
        assert_eq!(err.reason, RejectionReason::NotMinted);
    }

    #[test]
    fn unsupported_mode_admits_anything() {
        let gate = ResourceGate::new(GateMode::Unsupported);
        let admitted = gate
            .admit("https://cdn.example.com/worker.js")
            .expect("unsupported gate admits");
        assert_eq!(admitted.handle(), "https://cdn.example.com/worker.js");
        assert_eq!("off".parse::<GateMode>(), Ok(GateMode::Unsupported));
        assert!("maybe".parse::<GateMode>().is_err());
    }
}
