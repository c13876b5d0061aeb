//! Access gate
//!
//! Every filesystem call passes through [`AccessGate::check`]. The caller's
//! pid is resolved to an executable path (through the process cache) and
//! matched against the permission policy:
//!
//! 1. pid 0 (kernel) and our own pid are always allowed
//! 2. an exact allow-list match allows
//! 3. an exact deny-list match denies
//! 4. otherwise the default action decides
//!
//! A pid that cannot be resolved is denied.

mod resolver;

pub use resolver::{ProcessResolver, ProcfsResolver};

use crate::cache::ProcessCache;
use crate::config::{GateConfig, PolicyConfig};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Action taken when no list matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Pass,
    Deny,
}

impl DefaultAction {
    /// Exactly `"pass"` allows; every other value denies
    pub fn parse(value: &str) -> Self {
        if value == "pass" {
            DefaultAction::Pass
        } else {
            DefaultAction::Deny
        }
    }
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Allow-list, deny-list and default action
#[derive(Debug, Clone)]
pub struct Policy {
    pub allow: Vec<PathBuf>,
    pub deny: Vec<PathBuf>,
    pub default_action: DefaultAction,
}

impl Policy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Policy {
            allow: config.allow.clone(),
            deny: config.deny.clone(),
            default_action: DefaultAction::parse(&config.default_action),
        }
    }

    /// Evaluate an executable path against the policy
    pub fn evaluate(&self, executable: &Path) -> Decision {
        if self.allow.iter().any(|p| p == executable) {
            return Decision::Allow;
        }
        if self.deny.iter().any(|p| p == executable) {
            return Decision::Deny;
        }
        match self.default_action {
            DefaultAction::Pass => Decision::Allow,
            DefaultAction::Deny => Decision::Deny,
        }
    }
}

/// Authorizes calling processes against the policy
pub struct AccessGate {
    policy: Policy,
    cache: ProcessCache,
    resolver: Arc<dyn ProcessResolver>,
    self_pid: u32,
}

impl AccessGate {
    /// Create a gate resolving through `resolver`
    pub fn new(policy: Policy, config: &GateConfig, resolver: Arc<dyn ProcessResolver>) -> Self {
        AccessGate {
            policy,
            cache: ProcessCache::new(config),
            resolver,
            self_pid: std::process::id(),
        }
    }

    /// Override the pid treated as "ourselves"
    pub fn with_self_pid(mut self, pid: u32) -> Self {
        self.self_pid = pid;
        self
    }

    pub fn cache(&self) -> &ProcessCache {
        &self.cache
    }

    /// Decide whether `pid` may perform `action`
    pub fn decide(&self, action: &str, pid: u32) -> Decision {
        if pid == 0 || pid == self.self_pid {
            return Decision::Allow;
        }

        let executable = match self.cache.get(pid) {
            Some(exe) => exe,
            None => match self.resolver.executable(pid) {
                Ok(exe) => {
                    self.cache.insert(pid, &exe);
                    exe
                }
                Err(e) => {
                    self.cache.remove(pid);
                    warn!("{} denied: pid {} not resolvable: {}", action, pid, e);
                    return Decision::Deny;
                }
            },
        };

        let decision = self.policy.evaluate(&executable);
        match decision {
            Decision::Allow => debug!("{} allowed: pid={} exe={:?}", action, pid, executable),
            Decision::Deny => warn!("{} denied: pid={} exe={:?}", action, pid, executable),
        }
        decision
    }

    /// Like [`AccessGate::decide`], as a `Result`
    pub fn check(&self, action: &str, pid: u32) -> Result<()> {
        match self.decide(action, pid) {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(Error::PermissionDenied),
        }
    }
}
