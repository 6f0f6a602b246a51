//! Mapping from caller process ids to stable application identities.

use std::collections::HashMap;
use std::fs;

use crate::types::Pid;

/// Resolves a calling process to an application identity.
///
/// The mapping must be stable for the lifetime of a caller's connection,
/// and platform processes must be distinguishable from ordinary
/// applications. The exact derivation is platform business; the core only
/// consumes this interface.
pub trait ProcessIdentity {
    /// Stable application identifier for the process.
    fn application_id(&self, pid: Pid) -> String;

    /// True when the process belongs to the platform itself.
    fn is_platform_application(&self, pid: Pid) -> bool;

    /// The shared identifier recorded for platform-owned entities.
    fn platform_application_id(&self) -> String {
        "platform".to_string()
    }

    /// The identity recorded as owner for rows written on behalf of `pid`.
    fn caller_application_id(&self, pid: Pid) -> String {
        if self.is_platform_application(pid) {
            self.platform_application_id()
        } else {
            self.application_id(pid)
        }
    }
}

/// Procfs-backed identity resolution for the running system.
///
/// The application id is the basename of the process executable; platform
/// processes are those running as root.
#[derive(Debug, Default)]
pub struct ProcIdentity;

impl ProcessIdentity for ProcIdentity {
    fn application_id(&self, pid: Pid) -> String {
        let cmdline = fs::read(format!("/proc/{pid}/cmdline")).unwrap_or_default();
        let first = cmdline.split(|byte| *byte == 0).next().unwrap_or_default();
        let path = String::from_utf8_lossy(first);
        let basename = path.rsplit('/').next().unwrap_or_default();
        if basename.is_empty() {
            format!("pid:{pid}")
        } else {
            basename.to_string()
        }
    }

    fn is_platform_application(&self, pid: Pid) -> bool {
        let Ok(status) = fs::read_to_string(format!("/proc/{pid}/status")) else {
            return false;
        };
        status
            .lines()
            .find(|line| line.starts_with("Uid:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|uid| uid.parse::<u32>().ok())
            .is_some_and(|uid| uid == 0)
    }
}

/// Fixed-map identity for tests.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    applications: HashMap<Pid, String>,
    platform_pids: Vec<Pid>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application(mut self, pid: Pid, application_id: &str) -> Self {
        self.applications.insert(pid, application_id.to_string());
        self
    }

    pub fn with_platform_pid(mut self, pid: Pid) -> Self {
        self.platform_pids.push(pid);
        self
    }
}

impl ProcessIdentity for StaticIdentity {
    fn application_id(&self, pid: Pid) -> String {
        self.applications
            .get(&pid)
            .cloned()
            .unwrap_or_else(|| format!("pid:{pid}"))
    }

    fn is_platform_application(&self, pid: Pid) -> bool {
        self.platform_pids.contains(&pid)
    }
}
