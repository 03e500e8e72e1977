//! In-memory backends for tests
//!
//! Deterministic fakes for the object store, lock service, compute and
//! remote exec. Tests script remote command results by matching substrings
//! of the submitted shell script.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    Compute, ExecStatus, LaunchRequest, LockAcquisition, LockService, LockState, ObjectStore,
    RemoteExec, RequeueQueue, StoreError, StoredObject, VmDescription, WritePrecondition,
};
use crate::resource::VmState;

/// Object store backed by a map, with version tags for conditional puts
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, u64)>>,
    next_version: AtomicU64,
}

impl MemoryObjectStore {
    /// Insert an object unconditionally (test setup)
    pub fn seed(&self, key: &str, body: &str) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (body.as_bytes().to_vec(), version));
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(body, _)| String::from_utf8_lossy(body).into_owned())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        Ok(self.objects.lock().unwrap().get(key).map(|(body, version)| {
            StoredObject {
                body: body.clone(),
                etag: version.to_string(),
            }
        }))
    }

    async fn put(
        &self,
        key: &str,
        body: &[u8],
        precondition: WritePrecondition,
    ) -> Result<String, StoreError> {
        let mut objects = self.objects.lock().unwrap();
        let current = objects.get(key).map(|(_, version)| version.to_string());
        match precondition {
            WritePrecondition::None => {}
            WritePrecondition::IfAbsent => {
                if current.is_some() {
                    return Err(StoreError::PreconditionFailed {
                        key: key.to_string(),
                    });
                }
            }
            WritePrecondition::IfMatch(expected) => {
                if current.as_deref() != Some(expected.as_str()) {
                    return Err(StoreError::PreconditionFailed {
                        key: key.to_string(),
                    });
                }
            }
        }
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        objects.insert(key.to_string(), (body.to_vec(), version));
        Ok(version.to_string())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[derive(Clone)]
struct Lease {
    owner: String,
    fence: u64,
    expires_at: DateTime<Utc>,
}

/// Lock service with TTL expiry and fencing counters
#[derive(Default)]
pub struct MemoryLockService {
    leases: Mutex<HashMap<String, Lease>>,
    fences: Mutex<HashMap<String, u64>>,
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<LockAcquisition>> {
        let deadline = std::time::Instant::now() + wait;
        loop {
            {
                let mut leases = self.leases.lock().unwrap();
                let now = Utc::now();
                let takeable = match leases.get(resource) {
                    None => true,
                    Some(lease) => lease.expires_at <= now || lease.owner == owner,
                };
                if takeable {
                    let mut fences = self.fences.lock().unwrap();
                    let fence = fences.entry(resource.to_string()).or_insert(0);
                    *fence += 1;
                    let expires_at = now
                        + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
                    leases.insert(
                        resource.to_string(),
                        Lease {
                            owner: owner.to_string(),
                            fence: *fence,
                            expires_at,
                        },
                    );
                    return Ok(Some(LockAcquisition {
                        fencing_token: *fence,
                    }));
                }
            }
            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn release(&self, resource: &str, owner: &str) -> Result<()> {
        let mut leases = self.leases.lock().unwrap();
        if leases.get(resource).is_some_and(|l| l.owner == owner) {
            leases.remove(resource);
        }
        Ok(())
    }

    async fn is_locked(&self, resource: &str) -> Result<LockState> {
        let leases = self.leases.lock().unwrap();
        Ok(match leases.get(resource) {
            Some(lease) if lease.expires_at > Utc::now() => LockState {
                locked: true,
                owner: Some(lease.owner.clone()),
                expires_at: Some(lease.expires_at),
            },
            _ => LockState::default(),
        })
    }
}

/// Compute backend with scriptable instance states
pub struct MemoryCompute {
    instances: Mutex<BTreeMap<String, VmDescription>>,
    next_id: AtomicU64,
    launch_count: AtomicU64,
    /// When set, launched instances go straight to `running` with IPs
    auto_running: bool,
}

impl Default for MemoryCompute {
    fn default() -> Self {
        Self {
            instances: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            launch_count: AtomicU64::new(0),
            auto_running: true,
        }
    }
}

impl MemoryCompute {
    /// Launched instances stay `pending` until the test advances them
    pub fn manual() -> Self {
        Self {
            auto_running: false,
            ..Default::default()
        }
    }

    pub fn launch_count(&self) -> u64 {
        self.launch_count.load(Ordering::SeqCst)
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.lock().unwrap().keys().cloned().collect()
    }

    pub fn states(&self) -> Vec<(String, VmState)> {
        self.instances
            .lock()
            .unwrap()
            .values()
            .map(|vm| (vm.name.clone(), vm.state))
            .collect()
    }

    pub fn set_state(&self, id: &str, state: VmState) {
        let mut instances = self.instances.lock().unwrap();
        if let Some(vm) = instances.get_mut(id) {
            vm.state = state;
        }
    }

    /// Move every pending instance to running and assign addresses
    pub fn run_all_pending(&self) {
        let mut instances = self.instances.lock().unwrap();
        for vm in instances.values_mut() {
            if vm.state == VmState::Pending {
                vm.state = VmState::Running;
                let n = vm.id.trim_start_matches("i-").trim_start_matches('0');
                let n = if n.is_empty() { "0" } else { n };
                vm.private_ip = Some(format!("10.0.0.{}", n));
                vm.public_ip = Some(format!("54.0.0.{}", n));
            }
        }
    }
}

#[async_trait]
impl Compute for MemoryCompute {
    async fn launch(&self, request: &LaunchRequest) -> Result<VmDescription> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.launch_count.fetch_add(1, Ordering::SeqCst);
        let id = format!("i-{:08}", n);
        let mut vm = VmDescription {
            id: id.clone(),
            name: request.name.clone(),
            state: VmState::Pending,
            instance_type: request.instance_type.clone(),
            private_ip: None,
            public_ip: None,
            vpc_id: Some("vpc-11111111".to_string()),
            subnet_id: if request.subnet_id.is_empty() {
                Some("subnet-22222222".to_string())
            } else {
                Some(request.subnet_id.clone())
            },
            security_groups: request.security_groups.clone(),
            launch_time: Some(Utc::now()),
            tags: request.tags.clone(),
        };
        if self.auto_running {
            vm.state = VmState::Running;
            vm.private_ip = Some(format!("10.0.0.{}", n));
            vm.public_ip = Some(format!("54.0.0.{}", n));
        }
        self.instances.lock().unwrap().insert(id, vm.clone());
        Ok(vm)
    }

    async fn describe(&self, id: &str) -> Result<Option<VmDescription>> {
        Ok(self.instances.lock().unwrap().get(id).cloned())
    }

    async fn list_by_tag(&self, key: &str, value: &str) -> Result<Vec<VmDescription>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|vm| {
                vm.state != VmState::Terminated
                    && vm.tags.get(key).is_some_and(|v| v == value)
            })
            .cloned()
            .collect())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.set_state(id, VmState::Running);
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.set_state(id, VmState::Stopped);
        Ok(())
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        self.set_state(id, VmState::Terminated);
        Ok(())
    }
}

/// A command submitted to the exec fake
#[derive(Debug, Clone)]
pub struct SentCommand {
    pub command_id: String,
    pub instance_id: String,
    pub script: String,
    pub timeout: Duration,
}

struct ExecRule {
    pattern: String,
    queue: VecDeque<ExecStatus>,
    fallback: Option<ExecStatus>,
}

/// Remote exec fake: results are scripted by script-substring rules
///
/// The most recently registered matching rule wins, and a queued one-shot
/// response wins over that rule's fallback. Without any matching rule a
/// command succeeds with empty output.
#[derive(Default)]
pub struct MemoryExec {
    sent: Mutex<Vec<SentCommand>>,
    results: Mutex<HashMap<String, ExecStatus>>,
    rules: Mutex<Vec<ExecRule>>,
    next_id: AtomicU64,
}

/// Shorthand for a successful result with the given stdout
pub fn success(stdout: &str) -> ExecStatus {
    ExecStatus::Success {
        stdout: stdout.to_string(),
    }
}

/// Shorthand for a failed result with the given stderr
pub fn failure(stderr: &str) -> ExecStatus {
    ExecStatus::Failed {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: Some(1),
    }
}

impl MemoryExec {
    /// Every command whose script contains `pattern` resolves to `status`
    pub fn respond(&self, pattern: &str, status: ExecStatus) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|r| r.pattern == pattern) {
            rule.fallback = Some(status);
        } else {
            rules.push(ExecRule {
                pattern: pattern.to_string(),
                queue: VecDeque::new(),
                fallback: Some(status),
            });
        }
    }

    /// The next matching command resolves to `status`, once
    pub fn respond_once(&self, pattern: &str, status: ExecStatus) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|r| r.pattern == pattern) {
            rule.queue.push_back(status);
        } else {
            rules.push(ExecRule {
                pattern: pattern.to_string(),
                queue: VecDeque::from([status]),
                fallback: None,
            });
        }
    }

    /// Override the stored result of an already sent command
    pub fn set_result(&self, command_id: &str, status: ExecStatus) {
        self.results
            .lock()
            .unwrap()
            .insert(command_id.to_string(), status);
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExec for MemoryExec {
    async fn send_command(
        &self,
        instance_id: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<String> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let command_id = format!("cmd-{}", n);

        let status = {
            let mut rules = self.rules.lock().unwrap();
            rules
                .iter_mut()
                .rev()
                .filter(|r| script.contains(&r.pattern))
                .find_map(|r| r.queue.pop_front().or_else(|| r.fallback.clone()))
                .unwrap_or(ExecStatus::Success {
                    stdout: String::new(),
                })
        };
        self.results
            .lock()
            .unwrap()
            .insert(command_id.clone(), status);
        self.sent.lock().unwrap().push(SentCommand {
            command_id: command_id.clone(),
            instance_id: instance_id.to_string(),
            script: script.to_string(),
            timeout,
        });
        Ok(command_id)
    }

    async fn get_result(&self, command_id: &str) -> Result<ExecStatus> {
        self.results
            .lock()
            .unwrap()
            .get(command_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown command id '{}'", command_id))
    }
}

/// Requeue queue that records scheduled triggers
#[derive(Default)]
pub struct MemoryQueue {
    scheduled: Mutex<Vec<(String, Duration)>>,
}

impl MemoryQueue {
    pub fn scheduled(&self) -> Vec<(String, Duration)> {
        self.scheduled.lock().unwrap().clone()
    }
}

#[async_trait]
impl RequeueQueue for MemoryQueue {
    async fn schedule(&self, cluster: &str, delay: Duration) -> Result<()> {
        self.scheduled
            .lock()
            .unwrap()
            .push((cluster.to_string(), delay));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_puts() {
        let store = MemoryObjectStore::default();
        let etag = store
            .put("a", b"1", WritePrecondition::IfAbsent)
            .await
            .unwrap();

        // Second create fails, replace with the right tag succeeds
        assert!(matches!(
            store.put("a", b"2", WritePrecondition::IfAbsent).await,
            Err(StoreError::PreconditionFailed { .. })
        ));
        assert!(matches!(
            store
                .put("a", b"2", WritePrecondition::IfMatch("stale".to_string()))
                .await,
            Err(StoreError::PreconditionFailed { .. })
        ));
        store
            .put("a", b"2", WritePrecondition::IfMatch(etag))
            .await
            .unwrap();
        assert_eq!(store.text("a").unwrap(), "2");
    }

    #[tokio::test]
    async fn test_lock_mutual_exclusion_and_fencing() {
        let lock = MemoryLockService::default();
        let ttl = Duration::from_secs(30);
        let first = lock
            .acquire("demo", "owner-1", ttl, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        assert!(lock
            .acquire("demo", "owner-2", ttl, Duration::ZERO)
            .await
            .unwrap()
            .is_none());

        lock.release("demo", "owner-1").await.unwrap();
        let second = lock
            .acquire("demo", "owner-2", ttl, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert!(second.fencing_token > first.fencing_token);
    }

    #[tokio::test]
    async fn test_exec_rules_one_shot_then_fallback() {
        let exec = MemoryExec::default();
        exec.respond("k3s --version", success("v1.33.4+k3s1"));
        exec.respond_once("k3s --version", success("NOT_INSTALLED"));

        let id1 = exec
            .send_command("i-1", "k3s --version || echo NOT_INSTALLED", Duration::ZERO)
            .await
            .unwrap();
        let id2 = exec
            .send_command("i-1", "k3s --version || echo NOT_INSTALLED", Duration::ZERO)
            .await
            .unwrap();

        match exec.get_result(&id1).await.unwrap() {
            ExecStatus::Success { stdout } => assert_eq!(stdout, "NOT_INSTALLED"),
            other => panic!("unexpected: {:?}", other),
        }
        match exec.get_result(&id2).await.unwrap() {
            ExecStatus::Success { stdout } => assert_eq!(stdout, "v1.33.4+k3s1"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
