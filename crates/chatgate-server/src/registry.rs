//! Per-chat processing locks.
//!
//! Every send-message request for a chat passes through [`SessionRegistry::admit`].
//! The check and the flag flip happen under one synchronous lock, so two
//! requests for the same chat can never both be admitted by this process.
//! The registry is process-local: separate processes serving the same port
//! each hold their own map and do not see each other's locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chatgate_config::ReleaseMode;
use chatgate_contracts::{CONFLICT_MESSAGE, UNKNOWN_CLIENT};
use chatgate_kernel::{
    admit_reason_name, evaluate_gate, is_inactive, AdmitReason, GateConfig, GateDecision,
    LockState, Requester,
};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub processing_timeout: Duration,
    pub inactivity_threshold: Duration,
    pub release_mode: ReleaseMode,
}

impl RegistryConfig {
    pub fn from_admission(cfg: &chatgate_config::Admission) -> Self {
        Self {
            processing_timeout: Duration::from_millis(cfg.processing_timeout_ms),
            inactivity_threshold: Duration::from_millis(cfg.inactivity_threshold_ms),
            release_mode: cfg.release_mode,
        }
    }
}

struct ChatSession {
    owner_user_id: String,
    client_instance_id: String,
    last_activity: Instant,
    processing: bool,
    token: Option<Uuid>,
    release_timer: Option<AbortHandle>,
}

impl ChatSession {
    fn new(owner_user_id: &str, client_instance_id: &str, now: Instant) -> Self {
        Self {
            owner_user_id: owner_user_id.to_string(),
            client_instance_id: client_instance_id.to_string(),
            last_activity: now,
            processing: false,
            token: None,
            release_timer: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.release_timer.take() {
            timer.abort();
        }
    }
}

/// Read-only copy of a session, safe to hand out of the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub chat_id: String,
    pub owner_user_id: String,
    pub client_instance_id: String,
    pub processing: bool,
    pub idle: Duration,
    pub has_release_timer: bool,
}

/// Fields merged by [`SessionRegistry::upsert`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub owner_user_id: Option<String>,
    pub client_instance_id: Option<String>,
    pub processing: Option<bool>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", CONFLICT_MESSAGE)]
pub struct Conflict {
    pub holder: String,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, ChatSession>>,
    cfg: RegistryConfig,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(cfg: RegistryConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            sessions: Mutex::new(HashMap::new()),
            cfg,
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ChatSession>> {
        // Critical sections never panic mid-update, so a poisoned map is still consistent.
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, chat_id: &str) -> Option<SessionSnapshot> {
        let now = Instant::now();
        self.lock()
            .get(chat_id)
            .map(|session| snapshot(chat_id, session, now))
    }

    /// Creates the session if absent, merges `update`, and refreshes `last_activity`.
    ///
    /// Setting `processing` here does not arm a release timer; clearing it
    /// cancels any pending one.
    pub fn upsert(&self, chat_id: &str, update: SessionUpdate) -> SessionSnapshot {
        let now = Instant::now();
        let mut sessions = self.lock();
        let session = sessions
            .entry(chat_id.to_string())
            .or_insert_with(|| ChatSession::new("", UNKNOWN_CLIENT, now));
        if let Some(user_id) = update.owner_user_id {
            session.owner_user_id = user_id;
        }
        if let Some(client) = update.client_instance_id {
            session.client_instance_id = client;
        }
        if let Some(processing) = update.processing {
            session.processing = processing;
            if !processing {
                session.token = None;
                session.cancel_timer();
            }
        }
        session.last_activity = now;
        snapshot(chat_id, session, now)
    }

    pub fn remove(&self, chat_id: &str) -> bool {
        match self.lock().remove(chat_id) {
            Some(mut session) => {
                session.cancel_timer();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let now = Instant::now();
        let mut out: Vec<SessionSnapshot> = self
            .lock()
            .iter()
            .map(|(chat_id, session)| snapshot(chat_id, session, now))
            .collect();
        out.sort_by(|a, b| a.chat_id.cmp(&b.chat_id));
        out
    }

    /// Decides whether a send-message request may proceed.
    ///
    /// Every attempt refreshes `last_activity`, including rejected ones.
    pub fn admit(
        &self,
        chat_id: &str,
        client_instance_id: &str,
        user_id: &str,
    ) -> Result<AdmissionGuard, Conflict> {
        let now = Instant::now();
        let gate = GateConfig {
            processing_timeout: self.cfg.processing_timeout,
        };

        let mut sessions = self.lock();
        let decision = {
            let state = sessions.get(chat_id).map(|s| LockState {
                processing: s.processing,
                owner: s.client_instance_id.as_str(),
                owner_user: s.owner_user_id.as_str(),
                last_activity: s.last_activity.into_std(),
            });
            let requester = Requester {
                client: client_instance_id,
                user: user_id,
            };
            evaluate_gate(state.as_ref(), requester, now.into_std(), &gate)
        };

        let reason = match decision {
            GateDecision::Deny { reason_code } => {
                let holder = match sessions.get_mut(chat_id) {
                    Some(session) => {
                        session.last_activity = now;
                        session.client_instance_id.clone()
                    }
                    None => String::new(),
                };
                info!(
                    chat_id,
                    client = client_instance_id,
                    holder = %holder,
                    reason_code,
                    "admission denied"
                );
                return Err(Conflict { holder });
            }
            GateDecision::Admit(reason) => reason,
        };

        let token = Uuid::new_v4();
        let session = sessions
            .entry(chat_id.to_string())
            .or_insert_with(|| ChatSession::new(user_id, client_instance_id, now));
        if reason == AdmitReason::StaleOverride {
            warn!(
                chat_id,
                client = client_instance_id,
                previous = %session.client_instance_id,
                "releasing stale lock"
            );
        }
        session.cancel_timer();
        session.owner_user_id = user_id.to_string();
        session.client_instance_id = client_instance_id.to_string();
        session.processing = true;
        session.last_activity = now;
        session.token = Some(token);
        session.release_timer = Some(self.arm_release_timer(chat_id, token));
        drop(sessions);

        debug!(
            chat_id,
            client = client_instance_id,
            reason = admit_reason_name(reason),
            "admitted"
        );
        Ok(AdmissionGuard {
            registry: self.this.upgrade(),
            chat_id: chat_id.to_string(),
            token,
            reason,
        })
    }

    fn arm_release_timer(&self, chat_id: &str, token: Uuid) -> AbortHandle {
        let registry = self.this.clone();
        let chat_id = chat_id.to_string();
        let timeout = self.cfg.processing_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(&chat_id, token);
            }
        })
        .abort_handle()
    }

    fn expire(&self, chat_id: &str, token: Uuid) {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(chat_id) else {
            return;
        };
        if session.token != Some(token) || !session.processing {
            return;
        }
        session.processing = false;
        session.token = None;
        session.release_timer = None;
        info!(
            chat_id,
            client = %session.client_instance_id,
            "auto-releasing lock after timeout"
        );
    }

    fn release(&self, chat_id: &str, token: Uuid) -> bool {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(chat_id) else {
            return false;
        };
        let owns = session.token == Some(token);
        if !owns && self.cfg.release_mode == ReleaseMode::Token {
            debug!(chat_id, "lock already taken over; leaving current holder");
            return false;
        }
        session.processing = false;
        session.token = None;
        session.cancel_timer();
        session.last_activity = Instant::now();
        true
    }

    /// Removes every session idle longer than the inactivity threshold.
    pub fn sweep_inactive(&self) -> Vec<String> {
        let now = Instant::now().into_std();
        let threshold = self.cfg.inactivity_threshold;
        let mut removed = Vec::new();
        self.lock().retain(|chat_id, session| {
            if is_inactive(session.last_activity.into_std(), now, threshold) {
                session.cancel_timer();
                removed.push(chat_id.clone());
                false
            } else {
                true
            }
        });
        for chat_id in &removed {
            info!(chat_id = %chat_id, "removing inactive chat session");
        }
        removed
    }
}

fn snapshot(chat_id: &str, session: &ChatSession, now: Instant) -> SessionSnapshot {
    SessionSnapshot {
        chat_id: chat_id.to_string(),
        owner_user_id: session.owner_user_id.clone(),
        client_instance_id: session.client_instance_id.clone(),
        processing: session.processing,
        idle: now.saturating_duration_since(session.last_activity),
        has_release_timer: session.release_timer.is_some(),
    }
}

/// Proof of admission. Dropping it releases the chat, on every exit path.
#[must_use = "dropping the guard releases the chat immediately"]
pub struct AdmissionGuard {
    registry: Option<Arc<SessionRegistry>>,
    chat_id: String,
    token: Uuid,
    reason: AdmitReason,
}

impl AdmissionGuard {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn reason(&self) -> AdmitReason {
        self.reason
    }

    /// Releases now. Returns false when the lock had already been taken over
    /// (token mode) or the session was swept.
    pub fn release(mut self) -> bool {
        match self.registry.take() {
            Some(registry) => registry.release(&self.chat_id, self.token),
            None => false,
        }
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.release(&self.chat_id, self.token);
        }
    }
}

/// Periodically drops inactive sessions. Stops once the registry is gone.
pub fn spawn_sweeper(registry: &Arc<SessionRegistry>, interval: Duration) -> JoinHandle<()> {
    let registry = Arc::downgrade(registry);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let removed = registry.sweep_inactive();
            if !removed.is_empty() {
                debug!(
                    removed = removed.len(),
                    remaining = registry.len(),
                    "inactivity sweep"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(mode: ReleaseMode) -> Arc<SessionRegistry> {
        SessionRegistry::new(RegistryConfig {
            processing_timeout: Duration::from_secs(30),
            inactivity_threshold: Duration::from_secs(30 * 60),
            release_mode: mode,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn second_client_waits_for_first_to_finish() {
        let reg = registry(ReleaseMode::Token);
        let a = reg.admit("c1", "client-a", "u1").expect("a admitted");
        assert_eq!(a.reason(), AdmitReason::Created);

        let err = reg.admit("c1", "client-b", "u1").err().expect("b rejected");
        assert_eq!(err.holder, "client-a");
        assert_eq!(err.to_string(), CONFLICT_MESSAGE);

        assert!(a.release());
        let b = reg.admit("c1", "client-b", "u1").expect("b admitted after release");
        assert_eq!(b.reason(), AdmitReason::Idle);
        assert_eq!(reg.get("c1").unwrap().client_instance_id, "client-b");
    }

    #[tokio::test(start_paused = true)]
    async fn client_id_reused_by_another_user_cannot_enter() {
        let reg = registry(ReleaseMode::Token);
        let _victim = reg.admit("c1", "tab-a", "victim").unwrap();

        let err = reg.admit("c1", "tab-a", "mallory").err().expect("rejected");
        assert_eq!(err.holder, "tab-a");
        let snap = reg.get("c1").unwrap();
        assert!(snap.processing);
        assert_eq!(snap.owner_user_id, "victim");
    }

    #[tokio::test(start_paused = true)]
    async fn admission_records_the_current_user() {
        let reg = registry(ReleaseMode::Token);
        reg.upsert("c1", SessionUpdate::default());
        assert_eq!(reg.get("c1").unwrap().owner_user_id, "");

        reg.admit("c1", "tab-a", "u1").unwrap().release();
        assert_eq!(reg.get("c1").unwrap().owner_user_id, "u1");
        reg.admit("c1", "tab-b", "u2").unwrap().release();
        assert_eq!(reg.get("c1").unwrap().owner_user_id, "u2");
    }

    #[tokio::test(start_paused = true)]
    async fn different_chats_do_not_contend() {
        let reg = registry(ReleaseMode::Token);
        let _a = reg.admit("c1", "client-a", "u1").unwrap();
        let _b = reg.admit("c2", "client-b", "u2").unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn same_client_is_admitted_reentrantly() {
        let reg = registry(ReleaseMode::Token);
        let first = reg.admit("c1", "client-a", "u1").unwrap();
        let second = reg.admit("c1", "client-a", "u1").expect("re-entrant");
        assert_eq!(second.reason(), AdmitReason::Reentrant);

        // The superseded acquisition no longer owns the lock.
        assert!(!first.release());
        assert!(reg.get("c1").unwrap().processing);
        assert!(second.release());
        assert!(!reg.get("c1").unwrap().processing);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_guard_on_error_path_releases() {
        let reg = registry(ReleaseMode::Token);
        let outcome: Result<(), String> = (|| {
            let _guard = reg.admit("c1", "client-a", "u1").map_err(|e| e.to_string())?;
            Err("completion provider unreachable".to_string())
        })();
        assert!(outcome.is_err());
        let snap = reg.get("c1").unwrap();
        assert!(!snap.processing);
        assert!(!snap.has_release_timer);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_inside_admitted_body_still_releases() {
        let reg = registry(ReleaseMode::Token);
        let inner = Arc::clone(&reg);
        let joined = tokio::spawn(async move {
            let _guard = inner.admit("c1", "client-a", "u1").unwrap();
            panic!("handler blew up");
        })
        .await;
        assert!(joined.is_err());

        let b = reg.admit("c1", "client-b", "u1").expect("admit-able right away");
        assert_eq!(b.reason(), AdmitReason::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn release_timer_clears_abandoned_lock() {
        let reg = registry(ReleaseMode::Token);
        let a = reg.admit("c1", "client-a", "u1").unwrap();
        assert!(reg.get("c1").unwrap().has_release_timer);

        sleep(Duration::from_secs(31)).await;
        let snap = reg.get("c1").unwrap();
        assert!(!snap.processing);
        assert!(!snap.has_release_timer);

        let b = reg.admit("c1", "client-b", "u1").expect("b admitted");
        assert_eq!(b.reason(), AdmitReason::Idle);

        // A finishing late must not clear B's ownership.
        assert!(!a.release());
        let snap = reg.get("c1").unwrap();
        assert!(snap.processing);
        assert_eq!(snap.client_instance_id, "client-b");
    }

    #[tokio::test(start_paused = true)]
    async fn readmission_replaces_pending_timer() {
        let reg = registry(ReleaseMode::Token);
        let a = reg.admit("c1", "client-a", "u1").unwrap();
        sleep(Duration::from_secs(20)).await;
        drop(a);
        let _b = reg.admit("c1", "client-b", "u1").unwrap();

        // A's timer would have fired at t=30; B's runs until t=50.
        sleep(Duration::from_secs(15)).await;
        assert!(reg.get("c1").unwrap().processing);
        sleep(Duration::from_secs(16)).await;
        assert!(!reg.get("c1").unwrap().processing);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_holder_without_timer_is_overridden_on_next_attempt() {
        let reg = registry(ReleaseMode::Token);
        // Simulates a holder whose timer was lost.
        reg.upsert(
            "c1",
            SessionUpdate {
                owner_user_id: Some("u1".to_string()),
                client_instance_id: Some("client-a".to_string()),
                processing: Some(true),
            },
        );
        assert!(!reg.get("c1").unwrap().has_release_timer);

        sleep(Duration::from_secs(10)).await;
        assert!(reg.admit("c1", "client-b", "u1").is_err());

        // The rejected attempt refreshed last_activity at t=10.
        sleep(Duration::from_secs(31)).await;
        assert!(reg.get("c1").unwrap().processing);
        let b = reg.admit("c1", "client-b", "u1").expect("stale override");
        assert_eq!(b.reason(), AdmitReason::StaleOverride);
        assert_eq!(reg.get("c1").unwrap().client_instance_id, "client-b");
    }

    #[tokio::test(start_paused = true)]
    async fn unconditional_release_clears_newer_holder() {
        let reg = registry(ReleaseMode::Unconditional);
        let a = reg.admit("c1", "client-a", "u1").unwrap();
        sleep(Duration::from_secs(31)).await;
        let _b = reg.admit("c1", "client-b", "u1").unwrap();

        assert!(a.release());
        let snap = reg.get("c1").unwrap();
        assert!(!snap.processing);
        assert!(!snap.has_release_timer);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_idle_sessions_even_while_processing() {
        let reg = registry(ReleaseMode::Token);
        reg.upsert(
            "held",
            SessionUpdate {
                processing: Some(true),
                ..SessionUpdate::default()
            },
        );
        let idle = reg.admit("idle", "client-a", "u1").unwrap();
        drop(idle);

        sleep(Duration::from_secs(20 * 60)).await;
        let _fresh = reg.admit("fresh", "client-b", "u2").unwrap();
        assert!(reg.sweep_inactive().is_empty());

        sleep(Duration::from_secs(11 * 60)).await;
        let mut removed = reg.sweep_inactive();
        removed.sort();
        assert_eq!(removed, vec!["held".to_string(), "idle".to_string()]);
        assert!(reg.get("held").is_none());
        assert!(reg.get("fresh").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_reclaims_entries_on_schedule() {
        let reg = registry(ReleaseMode::Token);
        let sweeper = spawn_sweeper(&reg, Duration::from_secs(5 * 60));
        reg.upsert("c1", SessionUpdate::default());

        sleep(Duration::from_secs(30 * 60)).await;
        assert_eq!(reg.len(), 1);
        sleep(Duration::from_secs(6 * 60)).await;
        assert!(reg.is_empty());

        drop(reg);
        sleep(Duration::from_secs(5 * 60)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn upsert_merges_and_refreshes_activity() {
        let reg = registry(ReleaseMode::Token);
        reg.upsert(
            "c1",
            SessionUpdate {
                owner_user_id: Some("u1".to_string()),
                ..SessionUpdate::default()
            },
        );
        sleep(Duration::from_secs(5)).await;
        let snap = reg.upsert(
            "c1",
            SessionUpdate {
                client_instance_id: Some("tab-9".to_string()),
                ..SessionUpdate::default()
            },
        );
        assert_eq!(snap.owner_user_id, "u1");
        assert_eq!(snap.client_instance_id, "tab-9");
        assert_eq!(snap.idle, Duration::ZERO);
        assert!(reg.remove("c1"));
        assert!(!reg.remove("c1"));
    }
}
