/**
 * Authentication Prompts
 * Biometric, device-credential and confirmation dialogs presented by the host,
 * each completing with exactly one outcome through a single-shot channel
 */

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info};

use crate::encoding::{base64_bytes, to_base64};
use crate::keystore::UserAuthorization;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Prompt {
    Biometric {
        title: String,
        subtitle: String,
        description: String,
        negative_button: String,
    },
    DeviceCredential {
        title: Option<String>,
        description: Option<String>,
    },
    Confirmation {
        prompt_text: String,
        #[serde(default, with = "base64_bytes")]
        extra_data: Vec<u8>,
    },
}

impl Prompt {
    pub fn fingerprint() -> Self {
        Prompt::Biometric {
            title: "Scan your fingerprint".to_string(),
            subtitle: "Confirm that it is really you".to_string(),
            description: "Place your finger on the sensor so the app can authenticate you."
                .to_string(),
            negative_button: "Cancel".to_string(),
        }
    }

    /// Shown when a key bound to user authentication is about to sign.
    pub fn unlock_key(alias: &str) -> Self {
        Prompt::Biometric {
            title: "Authorize signing".to_string(),
            subtitle: format!("Key {alias}"),
            description: "Scan your fingerprint to use the signing key.".to_string(),
            negative_button: "Cancel".to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Prompt::Biometric { .. } => "biometric",
            Prompt::DeviceCredential { .. } => "device_credential",
            Prompt::Confirmation { .. } => "confirmation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Biometric,
    DeviceCredential,
}

/// Terminal result of a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    Authenticated { method: AuthMethod },
    ConfirmedByUser { data: Vec<u8> },
    DismissedByUser,
    DismissedByApplication,
    Error { code: i32, message: String },
}

impl PromptOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            PromptOutcome::Authenticated { .. } => "authenticated",
            PromptOutcome::ConfirmedByUser { .. } => "confirmed_by_user",
            PromptOutcome::DismissedByUser => "dismissed_by_user",
            PromptOutcome::DismissedByApplication => "dismissed_by_application",
            PromptOutcome::Error { .. } => "error",
        }
    }

    /// Only a successful biometric or credential check unlocks auth-bound keys.
    pub fn authorization(&self) -> Option<UserAuthorization> {
        match self {
            PromptOutcome::Authenticated { method } => Some(UserAuthorization::new(*method)),
            _ => None,
        }
    }
}

impl fmt::Display for PromptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptOutcome::Authenticated { method } => {
                let method = match method {
                    AuthMethod::Biometric => "biometric",
                    AuthMethod::DeviceCredential => "device credential",
                };
                write!(f, "authentication succeeded\nmethod: {method}")
            }
            PromptOutcome::ConfirmedByUser { data } => {
                write!(f, "confirmed by user\ndata: {}", to_base64(data))
            }
            PromptOutcome::DismissedByUser => write!(f, "dismissed by user"),
            PromptOutcome::DismissedByApplication => write!(f, "dismissed by application"),
            PromptOutcome::Error { code, message } => {
                write!(f, "authentication error\ncode: {code}\nmessage: {message}")
            }
        }
    }
}

/// Recoverable event; the prompt stays on screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PromptEvent {
    Help { code: i32, message: String },
    Failed,
}

impl fmt::Display for PromptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptEvent::Help { code, message } => {
                write!(f, "authentication help\ncode: {code}\nmessage: {message}")
            }
            PromptEvent::Failed => write!(f, "authentication failed, try again"),
        }
    }
}

/// What the user did on the presenting dialog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserAction {
    Authenticate,
    Confirm,
    Fail,
    Help { code: i32, message: String },
    Error { code: i32, message: String },
    Dismiss,
}

impl UserAction {
    fn name(&self) -> &'static str {
        match self {
            UserAction::Authenticate => "authenticate",
            UserAction::Confirm => "confirm",
            UserAction::Fail => "fail",
            UserAction::Help { .. } => "help",
            UserAction::Error { .. } => "error",
            UserAction::Dismiss => "dismiss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Event(PromptEvent),
    Outcome(PromptOutcome),
}

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("another prompt is already presenting")]
    AlreadyPresenting,
    #[error("no presenting prompt with id {0}")]
    NotFound(u64),
    #[error("action '{action}' is not valid for a {kind} prompt")]
    InvalidAction {
        action: &'static str,
        kind: &'static str,
    },
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),
    #[error("prompt closed without an outcome")]
    Closed,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Lets the caller dismiss a prompt it started.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<CancelInner>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        // Register before checking the flag so a concurrent cancel is not missed.
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        prompt: Prompt,
        cancel: CancellationSignal,
    ) -> impl Future<Output = Result<PromptOutcome, PromptError>> + Send;
}

impl<T: Authenticator> Authenticator for Arc<T> {
    fn authenticate(
        &self,
        prompt: Prompt,
        cancel: CancellationSignal,
    ) -> impl Future<Output = Result<PromptOutcome, PromptError>> + Send {
        (**self).authenticate(prompt, cancel)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptSnapshot {
    pub id: u64,
    pub prompt: Prompt,
    pub events: Vec<PromptEvent>,
    pub opened_at: u64,
}

struct Presenting {
    id: u64,
    prompt: Prompt,
    events: Vec<PromptEvent>,
    opened_at: u64,
    responder: oneshot::Sender<PromptOutcome>,
}

/// In-process host for prompts. Modal: one prompt presents at a time.
pub struct PromptBroker {
    slot: Mutex<Option<Presenting>>,
    next_id: AtomicU64,
}

impl Default for PromptBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptBroker {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Presenting>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> Option<PromptSnapshot> {
        self.lock().as_ref().map(|p| PromptSnapshot {
            id: p.id,
            prompt: p.prompt.clone(),
            events: p.events.clone(),
            opened_at: p.opened_at,
        })
    }

    fn present(&self, prompt: Prompt) -> Result<(u64, oneshot::Receiver<PromptOutcome>), PromptError> {
        if let Prompt::Confirmation { prompt_text, .. } = &prompt {
            if prompt_text.trim().is_empty() {
                return Err(PromptError::InvalidPrompt(
                    "confirmation prompt text is empty".to_string(),
                ));
            }
        }

        let mut slot = self.lock();
        if slot.is_some() {
            return Err(PromptError::AlreadyPresenting);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, receiver) = oneshot::channel();
        info!(prompt_id = id, kind = prompt.kind(), "Presenting prompt");
        *slot = Some(Presenting {
            id,
            prompt,
            events: Vec::new(),
            opened_at: now_secs(),
            responder,
        });
        Ok((id, receiver))
    }

    /// Apply a user action to the presenting prompt.
    pub fn respond(&self, id: u64, action: UserAction) -> Result<Delivered, PromptError> {
        let mut slot = self.lock();
        let presenting = match slot.as_mut() {
            Some(p) if p.id == id => p,
            _ => return Err(PromptError::NotFound(id)),
        };

        let kind = presenting.prompt.kind();
        let invalid = || PromptError::InvalidAction {
            action: action.name(),
            kind,
        };

        let outcome = match (&presenting.prompt, &action) {
            (Prompt::Biometric { .. }, UserAction::Fail) => {
                presenting.events.push(PromptEvent::Failed);
                return Ok(Delivered::Event(PromptEvent::Failed));
            }
            (Prompt::Biometric { .. }, UserAction::Help { code, message }) => {
                let event = PromptEvent::Help {
                    code: *code,
                    message: message.clone(),
                };
                presenting.events.push(event.clone());
                return Ok(Delivered::Event(event));
            }
            (Prompt::Biometric { .. }, UserAction::Authenticate) => PromptOutcome::Authenticated {
                method: AuthMethod::Biometric,
            },
            (Prompt::DeviceCredential { .. }, UserAction::Authenticate) => {
                PromptOutcome::Authenticated {
                    method: AuthMethod::DeviceCredential,
                }
            }
            (
                Prompt::Confirmation {
                    prompt_text,
                    extra_data,
                },
                UserAction::Confirm,
            ) => PromptOutcome::ConfirmedByUser {
                data: confirmed_data(prompt_text, extra_data)?,
            },
            (_, UserAction::Error { code, message }) => PromptOutcome::Error {
                code: *code,
                message: message.clone(),
            },
            (_, UserAction::Dismiss) => PromptOutcome::DismissedByUser,
            _ => return Err(invalid()),
        };

        let presenting = slot.take().ok_or(PromptError::NotFound(id))?;
        deliver(presenting, outcome.clone());
        Ok(Delivered::Outcome(outcome))
    }

    /// Dismiss the presenting prompt on behalf of the application.
    pub fn dismiss(&self, id: u64) -> Result<(), PromptError> {
        let presenting = self.take(id).ok_or(PromptError::NotFound(id))?;
        deliver(presenting, PromptOutcome::DismissedByApplication);
        Ok(())
    }

    fn take(&self, id: u64) -> Option<Presenting> {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(p) if p.id == id => slot.take(),
            _ => None,
        }
    }
}

fn deliver(presenting: Presenting, outcome: PromptOutcome) {
    info!(prompt_id = presenting.id, outcome = outcome.name(), "Prompt completed");
    if presenting.responder.send(outcome).is_err() {
        debug!(prompt_id = presenting.id, "Prompt requester went away");
    }
}

fn confirmed_data(prompt_text: &str, extra_data: &[u8]) -> Result<Vec<u8>, PromptError> {
    let document = serde_json::json!({
        "prompt": prompt_text,
        "extra": to_base64(extra_data),
    });
    serde_json::to_vec(&document).map_err(|e| PromptError::InvalidPrompt(e.to_string()))
}

// Clears the slot if the waiting future is dropped before an outcome arrives.
struct ClearOnDrop<'a> {
    broker: &'a PromptBroker,
    id: u64,
}

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        if self.broker.take(self.id).is_some() {
            debug!(prompt_id = self.id, "Prompt abandoned");
        }
    }
}

impl Authenticator for PromptBroker {
    async fn authenticate(
        &self,
        prompt: Prompt,
        cancel: CancellationSignal,
    ) -> Result<PromptOutcome, PromptError> {
        let (id, receiver) = self.present(prompt)?;
        let _guard = ClearOnDrop { broker: self, id };

        tokio::select! {
            outcome = receiver => outcome.map_err(|_| PromptError::Closed),
            _ = cancel.cancelled() => {
                if let Some(presenting) = self.take(id) {
                    deliver(presenting, PromptOutcome::DismissedByApplication);
                }
                Ok(PromptOutcome::DismissedByApplication)
            }
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for_prompt(broker: &PromptBroker) -> PromptSnapshot {
        for _ in 0..200 {
            if let Some(snapshot) = broker.current() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("prompt never presented");
    }

    #[tokio::test]
    async fn biometric_success_yields_authorization() {
        let broker = Arc::new(PromptBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .authenticate(Prompt::fingerprint(), CancellationSignal::new())
                    .await
            })
        };

        let snapshot = wait_for_prompt(&broker).await;
        assert_eq!(snapshot.prompt.kind(), "biometric");
        broker.respond(snapshot.id, UserAction::Authenticate).unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            PromptOutcome::Authenticated {
                method: AuthMethod::Biometric
            }
        );
        assert!(outcome.authorization().is_some());
        assert!(broker.current().is_none());
    }

    #[tokio::test]
    async fn failed_and_help_keep_prompt_presenting() {
        let broker = Arc::new(PromptBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .authenticate(Prompt::fingerprint(), CancellationSignal::new())
                    .await
            })
        };

        let snapshot = wait_for_prompt(&broker).await;
        assert_eq!(
            broker.respond(snapshot.id, UserAction::Fail).unwrap(),
            Delivered::Event(PromptEvent::Failed)
        );
        broker
            .respond(
                snapshot.id,
                UserAction::Help {
                    code: 1,
                    message: "Finger moved too fast".to_string(),
                },
            )
            .unwrap();

        let still = broker.current().unwrap();
        assert_eq!(still.id, snapshot.id);
        assert_eq!(still.events.len(), 2);

        broker.respond(snapshot.id, UserAction::Dismiss).unwrap();
        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, PromptOutcome::DismissedByUser);
        assert!(outcome.authorization().is_none());
    }

    #[tokio::test]
    async fn only_one_prompt_presents_at_a_time() {
        let broker = Arc::new(PromptBroker::new());
        let cancel = CancellationSignal::new();
        let waiter = {
            let broker = broker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.authenticate(Prompt::fingerprint(), cancel).await })
        };
        wait_for_prompt(&broker).await;

        let second = broker
            .authenticate(
                Prompt::DeviceCredential {
                    title: None,
                    description: None,
                },
                CancellationSignal::new(),
            )
            .await;
        assert!(matches!(second, Err(PromptError::AlreadyPresenting)));

        cancel.cancel();
        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, PromptOutcome::DismissedByApplication);
        assert!(broker.current().is_none());
    }

    #[tokio::test]
    async fn already_cancelled_signal_dismisses_immediately() {
        let broker = PromptBroker::new();
        let cancel = CancellationSignal::new();
        cancel.cancel();
        let outcome = broker.authenticate(Prompt::fingerprint(), cancel).await.unwrap();
        assert_eq!(outcome, PromptOutcome::DismissedByApplication);
        assert!(broker.current().is_none());
    }

    #[tokio::test]
    async fn application_dismiss_completes_waiter() {
        let broker = Arc::new(PromptBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .authenticate(
                        Prompt::DeviceCredential {
                            title: Some("Unlock".to_string()),
                            description: None,
                        },
                        CancellationSignal::new(),
                    )
                    .await
            })
        };

        let snapshot = wait_for_prompt(&broker).await;
        broker.dismiss(snapshot.id).unwrap();
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            PromptOutcome::DismissedByApplication
        );
        assert!(matches!(broker.dismiss(snapshot.id), Err(PromptError::NotFound(_))));
    }

    #[tokio::test]
    async fn confirmation_returns_confirmed_document() {
        let broker = Arc::new(PromptBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .authenticate(
                        Prompt::Confirmation {
                            prompt_text: "100".to_string(),
                            extra_data: vec![0u8; 4],
                        },
                        CancellationSignal::new(),
                    )
                    .await
            })
        };

        let snapshot = wait_for_prompt(&broker).await;
        let err = broker.respond(snapshot.id, UserAction::Authenticate).unwrap_err();
        assert!(matches!(err, PromptError::InvalidAction { .. }));
        let err = broker.respond(snapshot.id, UserAction::Fail).unwrap_err();
        assert!(matches!(err, PromptError::InvalidAction { .. }));

        broker.respond(snapshot.id, UserAction::Confirm).unwrap();
        let outcome = waiter.await.unwrap().unwrap();
        let PromptOutcome::ConfirmedByUser { data } = outcome else {
            panic!("expected confirmation, got {outcome:?}");
        };
        let document: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(document["prompt"], "100");
        assert_eq!(document["extra"], "AAAAAA==");
    }

    #[tokio::test]
    async fn empty_confirmation_text_is_rejected() {
        let broker = PromptBroker::new();
        let result = broker
            .authenticate(
                Prompt::Confirmation {
                    prompt_text: "  ".to_string(),
                    extra_data: Vec::new(),
                },
                CancellationSignal::new(),
            )
            .await;
        assert!(matches!(result, Err(PromptError::InvalidPrompt(_))));
        assert!(broker.current().is_none());
    }

    #[tokio::test]
    async fn dropped_waiter_clears_prompt() {
        let broker = Arc::new(PromptBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .authenticate(Prompt::fingerprint(), CancellationSignal::new())
                    .await
            })
        };
        wait_for_prompt(&broker).await;
        waiter.abort();
        let _ = waiter.await;
        assert!(broker.current().is_none());
    }

    #[test]
    fn stale_id_is_not_found() {
        let broker = PromptBroker::new();
        assert!(matches!(
            broker.respond(42, UserAction::Authenticate),
            Err(PromptError::NotFound(42))
        ));
    }

    #[test]
    fn outcomes_render_distinct_text() {
        let outcomes = [
            PromptOutcome::Authenticated {
                method: AuthMethod::Biometric,
            },
            PromptOutcome::ConfirmedByUser { data: vec![1] },
            PromptOutcome::DismissedByUser,
            PromptOutcome::DismissedByApplication,
            PromptOutcome::Error {
                code: 7,
                message: "Too many attempts".to_string(),
            },
        ];
        let texts: std::collections::HashSet<String> =
            outcomes.iter().map(|o| o.to_string()).collect();
        assert_eq!(texts.len(), outcomes.len());
        assert!(outcomes[4].to_string().contains("code: 7"));
    }

    #[test]
    fn user_action_parses_from_json() {
        let action: UserAction =
            serde_json::from_str(r#"{"action":"help","code":5,"message":"Clean the sensor"}"#)
                .unwrap();
        assert_eq!(
            action,
            UserAction::Help {
                code: 5,
                message: "Clean the sensor".to_string()
            }
        );
    }
}
