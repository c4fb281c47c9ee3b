/**
 * HTTP Surface
 * Demo routes: present the three authentication prompts, answer them,
 * and drive the key slot (create, sign, verify)
 */

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::attestation::{self, Attestation, AttestationError, AttestationService};
use crate::config::Config;
use crate::device::DeviceCapabilities;
use crate::encoding::{from_base64, to_base64};
use crate::keystore::{Certificate, KeyStoreError, SoftwareKeyStore};
use crate::prompt::{
    Authenticator, CancellationSignal, Delivered, Prompt, PromptBroker, PromptError,
    PromptOutcome, UserAction,
};
use crate::signer::{KeystoreSigner, SignerError};

pub type Signer = KeystoreSigner<SoftwareKeyStore, Arc<PromptBroker>>;

#[derive(Clone)]
pub struct AppState {
    pub signer: Arc<Signer>,
    pub prompts: Arc<PromptBroker>,
    pub device: DeviceCapabilities,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("attestation: {0}")]
    Attestation(#[from] AttestationError),
    #[error("key store: {0}")]
    KeyStore(#[from] KeyStoreError),
    #[error("a persistent key store needs a passphrase")]
    MissingPassphrase,
}

impl AppState {
    pub fn from_config(config: &Config) -> Result<Self, StartupError> {
        let attestation = AttestationService::new(config.device_model.clone())?;
        let secure_lock_screen = config.device.secure_lock_screen;
        let store = match &config.keystore_dir {
            Some(dir) => {
                let passphrase = config
                    .keystore_passphrase
                    .as_ref()
                    .ok_or(StartupError::MissingPassphrase)?;
                SoftwareKeyStore::open(dir, passphrase.expose(), attestation, secure_lock_screen)?
            }
            None => SoftwareKeyStore::in_memory(attestation, secure_lock_screen),
        };

        let prompts = Arc::new(PromptBroker::new());
        let signer = KeystoreSigner::with_alias(store, prompts.clone(), config.key_alias.clone())
            .with_device(config.device);

        Ok(Self {
            signer: Arc::new(signer),
            prompts,
            device: config.device,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/prompt", get(current_prompt))
        .route("/prompt/fingerprint", post(fingerprint_prompt))
        .route("/prompt/credential", post(credential_prompt))
        .route("/prompt/confirmation", post(confirmation_prompt))
        .route("/prompt/:id", delete(dismiss_prompt))
        .route("/prompt/:id/respond", post(respond_prompt))
        .route("/key", get(get_key).post(create_key))
        .route("/sign", post(sign))
        .route("/verify", post(verify))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CredentialRequest {
    title: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct ConfirmationRequest {
    prompt_text: String,
    #[serde(default)]
    extra_data: Option<String>, // Base64
}

#[derive(Serialize)]
struct PromptResponse {
    outcome: &'static str,
    text: String,
}

#[derive(Serialize)]
struct RespondResponse {
    delivered: &'static str,
    text: String,
}

#[derive(Serialize)]
struct KeyResponse {
    alias: String,
    public_key: String, // Base64 SEC1 point
    public_key_digest: String,
    created_at: u64,
    attestation: Attestation,
}

#[derive(Deserialize)]
struct SignRequest {
    message: String,
}

#[derive(Serialize)]
struct SignResponse {
    signature: String, // Base64 DER
}

#[derive(Deserialize)]
struct VerifyRequest {
    message: String,
    signature: Option<String>, // Base64 DER
}

#[derive(Serialize)]
struct VerifyResponse {
    verified: bool,
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn current_prompt(State(state): State<AppState>) -> Response {
    match state.prompts.current() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn fingerprint_prompt(State(state): State<AppState>) -> Response {
    if let Err(e) = state.device.check_biometric() {
        warn!(error = %e, "Fingerprint prompt unavailable");
        return error_response(StatusCode::PRECONDITION_FAILED, "biometric_unavailable", &e);
    }
    present(&state, Prompt::fingerprint()).await
}

async fn credential_prompt(
    State(state): State<AppState>,
    Json(request): Json<CredentialRequest>,
) -> Response {
    if let Err(e) = state.device.check_device_credential() {
        warn!(error = %e, "Device credential prompt unavailable");
        return error_response(StatusCode::PRECONDITION_FAILED, "credential_unavailable", &e);
    }
    let prompt = Prompt::DeviceCredential {
        title: request.title,
        description: request.description,
    };
    present(&state, prompt).await
}

async fn confirmation_prompt(
    State(state): State<AppState>,
    Json(request): Json<ConfirmationRequest>,
) -> Response {
    let extra_data = match request.extra_data.as_deref().map(from_base64).transpose() {
        Ok(data) => data.unwrap_or_default(),
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "bad_request", &e),
    };
    let prompt = Prompt::Confirmation {
        prompt_text: request.prompt_text,
        extra_data,
    };
    present(&state, prompt).await
}

async fn present(state: &AppState, prompt: Prompt) -> Response {
    match state
        .prompts
        .authenticate(prompt, CancellationSignal::new())
        .await
    {
        Ok(outcome) => Json(prompt_response(&outcome)).into_response(),
        Err(e) => prompt_error_response(&e),
    }
}

fn prompt_response(outcome: &PromptOutcome) -> PromptResponse {
    PromptResponse {
        outcome: outcome.name(),
        text: outcome.to_string(),
    }
}

async fn respond_prompt(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(action): Json<UserAction>,
) -> Response {
    match state.prompts.respond(id, action) {
        Ok(Delivered::Event(event)) => Json(RespondResponse {
            delivered: "event",
            text: event.to_string(),
        })
        .into_response(),
        Ok(Delivered::Outcome(outcome)) => Json(RespondResponse {
            delivered: "outcome",
            text: outcome.to_string(),
        })
        .into_response(),
        Err(e) => prompt_error_response(&e),
    }
}

async fn dismiss_prompt(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.prompts.dismiss(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => prompt_error_response(&e),
    }
}

async fn create_key(State(state): State<AppState>) -> Response {
    match state.signer.create_key() {
        Ok(certificate) => Json(key_response(certificate)).into_response(),
        Err(e) => signer_error_response(&e),
    }
}

async fn get_key(State(state): State<AppState>) -> Response {
    match state.signer.certificate() {
        Ok(certificate) => Json(key_response(certificate)).into_response(),
        Err(e) => signer_error_response(&e),
    }
}

fn key_response(certificate: Certificate) -> KeyResponse {
    KeyResponse {
        public_key: to_base64(&certificate.public_key),
        public_key_digest: attestation::public_key_digest(&certificate.public_key),
        alias: certificate.alias,
        created_at: certificate.created_at,
        attestation: certificate.attestation,
    }
}

async fn sign(State(state): State<AppState>, Json(request): Json<SignRequest>) -> Response {
    info!(alias = state.signer.alias(), "Sign request");

    match state
        .signer
        .sign_data(&request.message, CancellationSignal::new())
        .await
    {
        Ok(signature) => Json(SignResponse {
            signature: to_base64(&signature),
        })
        .into_response(),
        Err(e) => signer_error_response(&e),
    }
}

async fn verify(State(state): State<AppState>, Json(request): Json<VerifyRequest>) -> Json<VerifyResponse> {
    let signature = match request.signature.as_deref().map(from_base64).transpose() {
        Ok(signature) => signature,
        Err(e) => {
            warn!(error = %e, "Malformed signature encoding");
            return Json(VerifyResponse { verified: false });
        }
    };

    Json(VerifyResponse {
        verified: state
            .signer
            .verify_data(&request.message, signature.as_deref()),
    })
}

fn prompt_error_response(error: &PromptError) -> Response {
    let (status, code) = match error {
        PromptError::AlreadyPresenting => (StatusCode::CONFLICT, "prompt_busy"),
        PromptError::NotFound(_) => (StatusCode::NOT_FOUND, "prompt_not_found"),
        PromptError::InvalidAction { .. } | PromptError::InvalidPrompt(_) => {
            (StatusCode::BAD_REQUEST, "bad_request")
        }
        PromptError::Closed => (StatusCode::INTERNAL_SERVER_ERROR, "prompt_closed"),
    };
    error_response(status, code, error)
}

fn signer_error_response(error: &SignerError) -> Response {
    let (status, code) = match error {
        SignerError::KeyNotFound { .. } | SignerError::UnexpectedEntry { .. } => {
            (StatusCode::NOT_FOUND, "key_not_found")
        }
        SignerError::AuthenticationNotSatisfied(_)
        | SignerError::Store(KeyStoreError::UserNotAuthenticated) => {
            (StatusCode::UNAUTHORIZED, "authentication_not_satisfied")
        }
        SignerError::KeyGeneration(KeyStoreError::SecureLockScreenRequired) => {
            (StatusCode::PRECONDITION_FAILED, "secure_lock_screen_required")
        }
        SignerError::BiometricUnavailable(_) => {
            (StatusCode::PRECONDITION_FAILED, "biometric_unavailable")
        }
        SignerError::Prompt(e) => return prompt_error_response(e),
        SignerError::MissingSignature => (StatusCode::BAD_REQUEST, "bad_request"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    error_response(status, code, error)
}

fn error_response(status: StatusCode, code: &str, error: &dyn std::fmt::Display) -> Response {
    let body = serde_json::json!({
        "error": code,
        "message": error.to_string(),
    });
    (status, Json(body)).into_response()
}
