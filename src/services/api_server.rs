// src/services/api_server.rs
//! HTTP API for the signing service.
//!
//! Thin axum layer over the services: handlers parse input, call one service
//! operation and map [`ServiceError`]s onto status codes. The API covers:
//! - Document upload, lookup and verification
//! - Key generation, identity registration and enrollment
//! - Signing, signature recording and custodial signing
//! - Workflow creation, sign steps, invitation resends and rendering

use crate::models::document::DocumentHash;
use crate::models::identity::Identity;
use crate::models::signature::{SignatureHistoryEntry, SignatureRecord, VerificationReport};
use crate::models::workflow::{FieldInput, NewSigner, WorkflowView};
use crate::services::error::{ErrorKind, ServiceError};
use crate::services::fingerprint::DocumentFingerprint;
use crate::services::identity_registry::{Enrollment, IdentityRegistry};
use crate::services::signature_engine::SignatureEngine;
use crate::services::verifier::Verifier;
use crate::services::workflow_engine::{SignStepReceipt, WorkflowEngine};
use crate::wallet::key_management::{generate_key_pair, CryptoError, KeyPair};
use axum::{
    extract::{DefaultBodyLimit, Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

// API request and response structures

#[derive(Deserialize)]
struct UploadQuery {
    filename: Option<String>,
}

#[derive(Serialize)]
struct UploadResponse {
    hash: DocumentHash,
    filename: String,
}

#[derive(Serialize)]
struct DocumentResponse {
    hash: DocumentHash,
    filename: String,
    created_at: chrono::DateTime<chrono::Utc>,
    workflows: Vec<WorkflowView>,
}

#[derive(Deserialize)]
struct RegisterIdentityRequest {
    email: String,
    name: String,
    public_key: String,
}

#[derive(Deserialize)]
struct EnrollIdentityRequest {
    email: String,
    name: String,
    /// When present the server keeps the key, encrypted under this passphrase
    passphrase: Option<String>,
}

#[derive(Deserialize)]
struct ResolveIdentityRequest {
    public_key: String,
}

#[derive(Deserialize)]
struct SignHashRequest {
    document_hash: DocumentHash,
    private_key: String,
}

#[derive(Serialize)]
struct SignHashResponse {
    signature: String,
}

/// The signer is named by email or by registered public key.
#[derive(Deserialize)]
struct RecordSignatureRequest {
    document_hash: DocumentHash,
    signature: String,
    email: Option<String>,
    public_key: Option<String>,
}

#[derive(Deserialize)]
struct CustodialSignRequest {
    document_hash: DocumentHash,
    email: String,
    passphrase: String,
}

#[derive(Deserialize)]
struct CreateWorkflowRequest {
    title: String,
    document_hash: DocumentHash,
    signers: Vec<NewSigner>,
}

#[derive(Serialize)]
struct CreateWorkflowResponse {
    workflow_id: String,
    hash: DocumentHash,
}

#[derive(Serialize)]
struct ResendResponse {
    workflow_id: String,
    invited: usize,
}

#[derive(Deserialize)]
struct SignStepRequest {
    #[serde(default)]
    fields: Vec<FieldInput>,
}

/// A [`ServiceError`] on its way out as an HTTP response.
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

fn status_for(err: &ServiceError) -> StatusCode {
    match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Duplicate | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Crypto => match err {
            ServiceError::Crypto(CryptoError::KeyFormat(_))
            | ServiceError::Crypto(CryptoError::MalformedBlob(_)) => StatusCode::BAD_REQUEST,
            ServiceError::Crypto(CryptoError::Operation(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        },
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "validation",
        ErrorKind::NotFound => "not_found",
        ErrorKind::Duplicate => "duplicate",
        ErrorKind::Crypto => "crypto",
        ErrorKind::Conflict => "conflict",
        ErrorKind::Internal => "internal",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
            "internal server error".to_string()
        } else {
            self.0.to_string()
        };
        (
            status,
            Json(json!({ "error": message, "kind": kind_label(self.0.kind()) })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_hash(value: &str) -> Result<DocumentHash, ApiError> {
    DocumentHash::parse(value).map_err(|e| ApiError(e.into()))
}

/// Runs service calls on the blocking pool. They take the store lock, hash
/// files and derive keys, none of which may stall the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?
}

fn pdf_response(bytes: Vec<u8>, filename: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response()
}

/// API server state containing all service dependencies
#[derive(Clone)]
pub struct ApiServer {
    registry: Arc<IdentityRegistry>,
    fingerprint: Arc<DocumentFingerprint>,
    signatures: Arc<SignatureEngine>,
    verifier: Arc<Verifier>,
    workflows: Arc<WorkflowEngine>,
}

impl ApiServer {
    /// Creates a new instance of the API server
    ///
    /// # Arguments
    /// * `registry` - Identity registration and lookup
    /// * `fingerprint` - Document intake
    /// * `signatures` - Signing and signature records
    /// * `verifier` - Document verification
    /// * `workflows` - Multi-signer routing
    pub fn new(
        registry: IdentityRegistry,
        fingerprint: DocumentFingerprint,
        signatures: SignatureEngine,
        verifier: Verifier,
        workflows: WorkflowEngine,
    ) -> Self {
        ApiServer {
            registry: Arc::new(registry),
            fingerprint: Arc::new(fingerprint),
            signatures: Arc::new(signatures),
            verifier: Arc::new(verifier),
            workflows: Arc::new(workflows),
        }
    }

    /// Builds the router with every endpoint and the upload size limit.
    pub fn router(&self) -> Router {
        let body_limit = self.fingerprint.max_upload_bytes();
        Router::new()
            .route("/documents", post(Self::upload_document_handler))
            .route("/documents/verify", post(Self::verify_bytes_handler))
            .route("/documents/:hash", get(Self::get_document_handler))
            .route("/documents/:hash/signers", get(Self::list_signers_handler))
            .route("/documents/:hash/signers/:email", get(Self::signer_state_handler))
            .route("/documents/:hash/verify", get(Self::verify_hash_handler))
            .route("/keys/generate", post(Self::generate_keys_handler))
            .route(
                "/identities",
                post(Self::register_identity_handler).get(Self::list_identities_handler),
            )
            .route("/identities/enroll", post(Self::enroll_identity_handler))
            .route("/identities/resolve", post(Self::resolve_identity_handler))
            .route("/identities/:email", get(Self::get_identity_handler))
            .route("/identities/:email/signatures", get(Self::signature_history_handler))
            .route("/signatures", post(Self::record_signature_handler))
            .route("/signatures/sign-hash", post(Self::sign_hash_handler))
            .route("/signatures/custodial", post(Self::custodial_sign_handler))
            .route("/workflows", post(Self::create_workflow_handler))
            .route("/workflows/:id", get(Self::get_workflow_handler))
            .route(
                "/workflows/:id/signers/:signer_id/sign",
                post(Self::submit_sign_step_handler),
            )
            .route("/workflows/:id/notify", post(Self::resend_invitations_handler))
            .route("/workflows/:id/render", get(Self::render_handler))
            .route("/workflows/:id/pdf", get(Self::source_pdf_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(DefaultBodyLimit::disable())
                    .layer(RequestBodyLimitLayer::new(body_limit)),
            )
            .with_state(Arc::new(self.clone()))
    }

    /// Starts the API server and begins listening for requests
    ///
    /// # Arguments
    /// * `addr` - Socket address to bind to (e.g., "127.0.0.1:3000")
    /// * `shutdown` - Resolves when the server should stop accepting requests
    pub async fn run<F>(&self, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API server listening on http://{}", addr);
        self.serve(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` resolves, then
    /// waits for in-flight requests to finish.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("API server stopped");
        Ok(())
    }

    // =====================
    // Documents
    // =====================

    /// POST /documents?filename=
    ///
    /// Raw PDF body. Re-uploading identical bytes returns the existing record.
    async fn upload_document_handler(
        State(state): State<Arc<ApiServer>>,
        Query(query): Query<UploadQuery>,
        body: Bytes,
    ) -> ApiResult<impl IntoResponse> {
        let filename = query.filename.unwrap_or_default();
        let document =
            blocking(move || state.fingerprint.store_upload(&body, &filename)).await?;
        Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                hash: document.content_hash,
                filename: document.original_filename,
            }),
        ))
    }

    async fn get_document_handler(
        Path(hash): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Json<DocumentResponse>> {
        let hash = parse_hash(&hash)?;
        let response = blocking(move || {
            let document = state.fingerprint.get_document(&hash)?;
            let workflows = state
                .workflows
                .workflows_for_document(&hash)?
                .into_iter()
                .map(WorkflowView::from)
                .collect();
            Ok(DocumentResponse {
                hash: document.content_hash,
                filename: document.original_filename,
                created_at: document.created_at,
                workflows,
            })
        })
        .await?;
        Ok(Json(response))
    }

    async fn list_signers_handler(
        Path(hash): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Json<Vec<SignatureRecord>>> {
        let hash = parse_hash(&hash)?;
        Ok(Json(blocking(move || state.signatures.list_signers(&hash)).await?))
    }

    async fn signer_state_handler(
        Path((hash, email)): Path<(String, String)>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Json<serde_json::Value>> {
        let hash = parse_hash(&hash)?;
        let body = blocking(move || {
            let signature_state = state.signatures.signature_state(&hash, &email)?;
            Ok(json!({ "document_hash": hash, "email": email, "state": signature_state }))
        })
        .await?;
        Ok(Json(body))
    }

    async fn verify_hash_handler(
        Path(hash): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Json<VerificationReport>> {
        let hash = parse_hash(&hash)?;
        Ok(Json(blocking(move || state.verifier.verify_document(&hash)).await?))
    }

    /// POST /documents/verify
    ///
    /// Raw PDF body; a modified file hashes to an unknown document (404).
    async fn verify_bytes_handler(
        State(state): State<Arc<ApiServer>>,
        body: Bytes,
    ) -> ApiResult<Json<VerificationReport>> {
        Ok(Json(blocking(move || state.verifier.verify_document_bytes(&body)).await?))
    }

    // =====================
    // Keys and identities
    // =====================

    /// POST /keys/generate
    ///
    /// The private key is returned once and not stored.
    async fn generate_keys_handler() -> ApiResult<Json<KeyPair>> {
        let pair = blocking(|| Ok(generate_key_pair()?)).await?;
        Ok(Json(pair))
    }

    async fn register_identity_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<RegisterIdentityRequest>,
    ) -> ApiResult<impl IntoResponse> {
        let identity = blocking(move || {
            state
                .registry
                .register_identity(&payload.email, &payload.name, &payload.public_key)
        })
        .await?;
        Ok((StatusCode::CREATED, Json(identity)))
    }

    async fn enroll_identity_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<EnrollIdentityRequest>,
    ) -> ApiResult<impl IntoResponse> {
        let enrollment: Enrollment = blocking(move || {
            state
                .registry
                .enroll_identity(&payload.email, &payload.name, payload.passphrase.as_deref())
        })
        .await?;
        Ok((StatusCode::CREATED, Json(enrollment)))
    }

    async fn list_identities_handler(
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Json<Vec<Identity>>> {
        Ok(Json(blocking(move || state.registry.list_identities()).await?))
    }

    async fn get_identity_handler(
        Path(email): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Json<Identity>> {
        Ok(Json(blocking(move || state.registry.get_by_email(&email)).await?))
    }

    async fn resolve_identity_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<ResolveIdentityRequest>,
    ) -> ApiResult<Json<Identity>> {
        let identity =
            blocking(move || state.registry.resolve_identity_by_public_key(&payload.public_key))
                .await?;
        Ok(Json(identity))
    }

    async fn signature_history_handler(
        Path(email): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Json<Vec<SignatureHistoryEntry>>> {
        Ok(Json(blocking(move || state.signatures.signature_history(&email)).await?))
    }

    // =====================
    // Signatures
    // =====================

    async fn sign_hash_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<SignHashRequest>,
    ) -> ApiResult<Json<SignHashResponse>> {
        let signature = blocking(move || {
            state.signatures.sign(&payload.document_hash, &payload.private_key)
        })
        .await?;
        Ok(Json(SignHashResponse { signature }))
    }

    /// POST /signatures
    ///
    /// # Responses
    /// - 201 Created: signature verified and recorded
    /// - 401 Unauthorized: signature does not verify for this identity
    /// - 404 Not Found: unknown identity or document
    /// - 409 Conflict: identity already signed this document
    async fn record_signature_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<RecordSignatureRequest>,
    ) -> ApiResult<impl IntoResponse> {
        let record = blocking(move || {
            let email = match (payload.email, payload.public_key) {
                (Some(email), _) => email,
                (None, Some(public_key)) => {
                    state.registry.resolve_identity_by_public_key(&public_key)?.email
                }
                (None, None) => {
                    return Err(ServiceError::Validation("email or public_key is required".into()))
                }
            };
            state
                .signatures
                .record_signature(&payload.document_hash, &email, &payload.signature)
        })
        .await?;
        Ok((StatusCode::CREATED, Json(record)))
    }

    async fn custodial_sign_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<CustodialSignRequest>,
    ) -> ApiResult<impl IntoResponse> {
        let record = blocking(move || {
            state
                .signatures
                .sign_with_stored_key(&payload.email, &payload.passphrase, &payload.document_hash)
        })
        .await?;
        Ok((StatusCode::CREATED, Json(record)))
    }

    // =====================
    // Workflows
    // =====================

    /// POST /workflows
    ///
    /// The document must have been uploaded first; the workflow routes the
    /// stored file.
    async fn create_workflow_handler(
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<CreateWorkflowRequest>,
    ) -> ApiResult<impl IntoResponse> {
        let workflow = blocking(move || {
            let document = state.fingerprint.get_document(&payload.document_hash)?;
            state.workflows.create_workflow(
                &payload.title,
                &document.storage_path,
                document.content_hash,
                payload.signers,
            )
        })
        .await?;
        Ok((
            StatusCode::CREATED,
            Json(CreateWorkflowResponse {
                workflow_id: workflow.id,
                hash: workflow.document_hash,
            }),
        ))
    }

    async fn get_workflow_handler(
        Path(id): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Json<WorkflowView>> {
        let workflow = blocking(move || state.workflows.get_workflow(&id)).await?;
        Ok(Json(workflow.into()))
    }

    async fn submit_sign_step_handler(
        Path((id, signer_id)): Path<(String, String)>,
        State(state): State<Arc<ApiServer>>,
        Json(payload): Json<SignStepRequest>,
    ) -> ApiResult<Json<SignStepReceipt>> {
        let receipt = blocking(move || {
            state.workflows.submit_sign_step(&id, &signer_id, &payload.fields)
        })
        .await?;
        Ok(Json(receipt))
    }

    /// POST /workflows/:id/notify
    ///
    /// Queues the invitations for the step the workflow is waiting on again,
    /// for signers whose original invitation never arrived.
    async fn resend_invitations_handler(
        Path(id): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Json<ResendResponse>> {
        let workflow_id = id.clone();
        let invited = blocking(move || state.workflows.resend_invitations(&id)).await?;
        Ok(Json(ResendResponse { workflow_id, invited }))
    }

    async fn render_handler(
        Path(id): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Response> {
        let filename = format!("signed-{}.pdf", id);
        let bytes = blocking(move || state.workflows.render_current_state(&id)).await?;
        Ok(pdf_response(bytes, &filename))
    }

    async fn source_pdf_handler(
        Path(id): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Response> {
        let filename = format!("{}.pdf", id);
        let bytes = blocking(move || state.workflows.source_pdf(&id)).await?;
        Ok(pdf_response(bytes, &filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notification::{Notifier, SigningInvitation};
    use crate::services::renderer::PassthroughRenderer;
    use crate::storage::sqlite_store::SqliteStore;
    use crate::wallet::key_management::KeyManager;
    use crate::wallet::key_vault::KeyVault;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tower::ServiceExt;

    const PDF: &[u8] = b"%PDF-1.7\n1 0 obj\n<<>>\nendobj\n%%EOF";

    struct Harness {
        server: ApiServer,
        app: Router,
        _dir: TempDir,
        invitations: UnboundedReceiver<SigningInvitation>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let vault = KeyVault::new(1_000).unwrap();
        let (notifier, invitations) = Notifier::channel("http://localhost:3000");
        let server = ApiServer::new(
            IdentityRegistry::new(Arc::clone(&store), vault.clone()),
            DocumentFingerprint::new(Arc::clone(&store), dir.path().join("uploads"), 64 * 1024),
            SignatureEngine::new(Arc::clone(&store), vault),
            Verifier::new(Arc::clone(&store)),
            WorkflowEngine::new(store, notifier, Arc::new(PassthroughRenderer), 3),
        );
        Harness { app: server.router(), server, _dir: dir, invitations }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    async fn send_json(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, bytes) = send(app, request).await;
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, bytes) = send(app, request).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn upload(app: &Router, bytes: &'static [u8]) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/documents?filename=contract.pdf")
            .header(header::CONTENT_TYPE, "application/pdf")
            .body(Body::from(bytes))
            .unwrap();
        let (status, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_upload_is_idempotent_and_validated() {
        let h = harness();
        let (status, first) = upload(&h.app, PDF).await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, second) = upload(&h.app, PDF).await;
        assert_eq!(first["hash"], second["hash"]);

        let (status, body) = upload(&h.app, b"GIF89a not a pdf").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");

        let (status, doc) = get_json(&h.app, &format!("/documents/{}", first["hash"].as_str().unwrap())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(doc["filename"], "contract.pdf");

        let (status, _) = get_json(&h.app, "/documents/not-a-hash").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sign_record_and_verify() {
        let h = harness();
        let (_, uploaded) = upload(&h.app, PDF).await;
        let hash = uploaded["hash"].as_str().unwrap().to_string();

        let manager = KeyManager::generate();
        let public_key = manager.public_key_pem().unwrap();
        let private_key = manager.private_key_pem().unwrap();
        let (status, _) = send_json(
            &h.app,
            "POST",
            "/identities",
            json!({ "email": "ada@example.com", "name": "Ada", "public_key": public_key }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, signed) = send_json(
            &h.app,
            "POST",
            "/signatures/sign-hash",
            json!({ "document_hash": hash, "private_key": private_key.as_str() }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let record = json!({
            "document_hash": hash,
            "public_key": public_key,
            "signature": signed["signature"],
        });
        let (status, _) = send_json(&h.app, "POST", "/signatures", record.clone()).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, body) = send_json(&h.app, "POST", "/signatures", record).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "duplicate");

        let (status, report) = get_json(&h.app, &format!("/documents/{}/verify", hash)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["valid"], true);
        assert_eq!(report["signed_by"][0], "ada@example.com");

        let (_, signers) = get_json(&h.app, &format!("/documents/{}/signers", hash)).await;
        assert_eq!(signers.as_array().unwrap().len(), 1);

        let (_, signed) = get_json(&h.app, &format!("/documents/{}/signers/ADA@example.com", hash)).await;
        assert_eq!(signed["state"], "signed");
        let (_, unsigned) = get_json(&h.app, &format!("/documents/{}/signers/bob@example.com", hash)).await;
        assert_eq!(unsigned["state"], "unsigned");
    }

    #[tokio::test]
    async fn test_forged_signature_is_unauthorized() {
        let h = harness();
        let (_, uploaded) = upload(&h.app, PDF).await;
        let hash = uploaded["hash"].as_str().unwrap().to_string();

        let owner = KeyManager::generate();
        send_json(
            &h.app,
            "POST",
            "/identities",
            json!({ "email": "ada@example.com", "name": "Ada", "public_key": owner.public_key_pem().unwrap() }),
        )
        .await;

        let forger = KeyManager::generate();
        let signature = forger.sign_hash(&DocumentHash::parse(&hash).unwrap()).unwrap();
        let (status, body) = send_json(
            &h.app,
            "POST",
            "/signatures",
            json!({ "document_hash": hash, "email": "ada@example.com", "signature": signature }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "document has been tampered with or signature invalid");
    }

    #[tokio::test]
    async fn test_workflow_round_trip() {
        let mut h = harness();
        let (_, uploaded) = upload(&h.app, PDF).await;
        let hash = uploaded["hash"].as_str().unwrap().to_string();

        let (status, created) = send_json(
            &h.app,
            "POST",
            "/workflows",
            json!({
                "title": "Contract",
                "document_hash": hash,
                "signers": [
                    { "name": "Ada", "email": "ada@example.com", "seq": 1,
                      "fields": [{ "id": "f-1", "type": "signature", "x": 10, "y": 20, "width": 140, "height": 40 }] },
                    { "name": "Bob", "email": "bob@example.com", "seq": 2 }
                ]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let workflow_id = created["workflow_id"].as_str().unwrap().to_string();
        assert_eq!(h.invitations.try_recv().unwrap().signer_name, "Ada");

        let (_, workflow) = get_json(&h.app, &format!("/workflows/{}", workflow_id)).await;
        assert_eq!(workflow["status"], "in_progress");
        assert_eq!(workflow["active_seq"], 1);
        let ada = workflow["signers"][0]["id"].as_str().unwrap().to_string();
        let bob = workflow["signers"][1]["id"].as_str().unwrap().to_string();

        let (status, _) = send_json(
            &h.app,
            "POST",
            &format!("/workflows/{}/signers/{}/sign", workflow_id, bob),
            json!({ "fields": [] }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, receipt) = send_json(
            &h.app,
            "POST",
            &format!("/workflows/{}/signers/{}/sign", workflow_id, ada),
            json!({ "fields": [{ "field_id": "f-1", "value": "Ada L.", "type": "type" }] }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(receipt["step_complete"], true);
        assert_eq!(h.invitations.try_recv().unwrap().signer_name, "Bob");

        let request = Request::builder()
            .uri(format!("/workflows/{}/render", workflow_id))
            .body(Body::empty())
            .unwrap();
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");

        let (status, _) = get_json(&h.app, "/workflows/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_custodial_enrollment_and_signing() {
        let h = harness();
        let (_, uploaded) = upload(&h.app, PDF).await;
        let hash = uploaded["hash"].as_str().unwrap().to_string();

        let (status, enrolled) = send_json(
            &h.app,
            "POST",
            "/identities/enroll",
            json!({ "email": "ada@example.com", "name": "Ada", "passphrase": "s3cret" }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(enrolled.get("private_key").is_none());
        assert!(enrolled["identity"].get("encrypted_private_key").is_none());

        let (status, _) = send_json(
            &h.app,
            "POST",
            "/signatures/custodial",
            json!({ "document_hash": hash, "email": "ada@example.com", "passphrase": "wrong" }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send_json(
            &h.app,
            "POST",
            "/signatures/custodial",
            json!({ "document_hash": hash, "email": "ada@example.com", "passphrase": "s3cret" }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, history) = get_json(&h.app, "/identities/ada@example.com/signatures").await;
        assert_eq!(history[0]["filename"], "contract.pdf");
    }

    #[tokio::test]
    async fn test_identity_lookup_by_email() {
        let h = harness();
        let manager = KeyManager::generate();
        send_json(
            &h.app,
            "POST",
            "/identities",
            json!({ "email": "ada@example.com", "name": "Ada", "public_key": manager.public_key_pem().unwrap() }),
        )
        .await;

        let (status, identity) = get_json(&h.app, "/identities/ADA@example.com").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(identity["email"], "ada@example.com");
        assert_eq!(identity["name"], "Ada");

        let (status, body) = get_json(&h.app, "/identities/bob@example.com").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_lost_invitations_are_resent() {
        let mut h = harness();
        let (_, uploaded) = upload(&h.app, PDF).await;
        let (_, created) = send_json(
            &h.app,
            "POST",
            "/workflows",
            json!({
                "title": "Contract",
                "document_hash": uploaded["hash"],
                "signers": [
                    { "name": "Ada", "email": "ada@example.com", "seq": 1 },
                    { "name": "Bob", "email": "bob@example.com", "seq": 2 }
                ]
            }),
        )
        .await;
        let workflow_id = created["workflow_id"].as_str().unwrap().to_string();

        // The first invitation is consumed and never delivered
        assert_eq!(h.invitations.try_recv().unwrap().signer_name, "Ada");
        assert!(h.invitations.try_recv().is_err());

        let (status, resent) =
            send_json(&h.app, "POST", &format!("/workflows/{}/notify", workflow_id), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resent["workflow_id"], workflow_id.as_str());
        assert_eq!(resent["invited"], 1);
        let again = h.invitations.try_recv().unwrap();
        assert_eq!(again.signer_name, "Ada");
        assert_eq!(again.seq, 1);
        assert!(h.invitations.try_recv().is_err());

        let (status, _) = send_json(&h.app, "POST", "/workflows/unknown/notify", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let h = harness();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = h.server.clone();
        let serving = tokio::spawn(async move {
            server
                .serve(listener, async move {
                    let _ = stopped.await;
                })
                .await
        });

        let response = reqwest::get(format!("http://{}/identities", addr)).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "[]");

        stop.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected() {
        let h = harness();
        let mut big = PDF.to_vec();
        big.resize(128 * 1024, b' ');
        let request = Request::builder()
            .method("POST")
            .uri("/documents")
            .body(Body::from(big))
            .unwrap();
        let (status, _) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
