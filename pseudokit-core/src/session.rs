//! Sessions and the temp-id cache.
//!
//! A session scopes temporary identifiers and other capability tokens on the
//! service. Within a session, permanent patient identifiers are exchanged
//! for temp-ids through a bidirectional cache: a cached pair is returned
//! without any network traffic, a miss mints a fresh token on the service.
//! The cache can be rebuilt from the service's authoritative token listing
//! when a session is reattached after a restart.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        PoisonError, RwLock,
    },
};

use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    connection::Connection,
    error::PseudokitError,
    patient_id::PatientId,
    token::{AddPatientToken, EditPatientToken, ListedToken, ReadPatientsToken, Token},
};

/// A session on a pseudonymization service instance.
///
/// Sessions are created by [`Connection::create_session`] and restored by
/// [`Connection::read_session`]. All methods take `&self`; wrap the session
/// in an `Arc` to share it across tasks. Cache-touching operations are
/// serialized internally so that check-cache, make-request and update-cache
/// form one critical section; at most one token-minting request is in
/// flight per session.
#[derive(Debug)]
pub struct Session {
    id: String,
    connection: Connection,
    /// Set exactly once by [`Session::destroy`], never reset. A destroyed
    /// session is locally known to be gone and must not incur avoidable
    /// network traffic.
    invalidated: AtomicBool,
    cache: Mutex<TempIdCache>,
    defaults: RwLock<TempIdDefaults>,
}

/// Bidirectional mapping between permanent identifiers and temp-ids. The
/// two maps are kept as exact inverses of one another under every mutation.
#[derive(Debug, Default)]
struct TempIdCache {
    temp_id_by_patient: HashMap<PatientId, String>,
    patient_by_temp_id: HashMap<String, PatientId>,
}

impl TempIdCache {
    /// Inserts a mapping, evicting whatever either key pointed at before so
    /// the maps stay exact inverses.
    fn insert(&mut self, patient: PatientId, temp_id: String) {
        if let Some(previous) = self.temp_id_by_patient.remove(&patient) {
            self.patient_by_temp_id.remove(&previous);
        }
        if let Some(previous) = self.patient_by_temp_id.remove(&temp_id) {
            self.temp_id_by_patient.remove(&previous);
        }
        self.temp_id_by_patient.insert(patient.clone(), temp_id.clone());
        self.patient_by_temp_id.insert(temp_id, patient);
    }

    /// Removes a mapping by temp-id. The forward entry is dropped only while
    /// it still points at this temp-id; a stale removal never clobbers a
    /// newer mapping.
    fn remove(&mut self, temp_id: &str) {
        if let Some(patient) = self.patient_by_temp_id.remove(temp_id) {
            if self
                .temp_id_by_patient
                .get(&patient)
                .is_some_and(|current| current == temp_id)
            {
                self.temp_id_by_patient.remove(&patient);
            }
        }
    }
}

#[derive(Debug, Default)]
struct TempIdDefaults {
    result_fields: Option<BTreeSet<String>>,
    result_ids: Option<BTreeSet<String>>,
}

impl Session {
    pub(crate) fn new(id: String, connection: Connection) -> Self {
        Self {
            id,
            connection,
            invalidated: AtomicBool::new(false),
            cache: Mutex::new(TempIdCache::default()),
            defaults: RwLock::new(TempIdDefaults::default()),
        }
    }

    /// The identifier the service assigned to this session.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> String {
        format!("sessions/{}/", self.id)
    }

    fn tokens_path(&self) -> String {
        format!("sessions/{}/tokens/", self.id)
    }

    /// Sets the data fields readable through temp-ids minted by
    /// [`Session::get_temp_id`]. Field names must match the fields
    /// configured on the connected service instance.
    pub fn set_default_result_fields(
        &self,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) {
        let fields = fields.into_iter().map(Into::into).collect();
        self.defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .result_fields = Some(fields);
    }

    /// Sets the identifier types readable through temp-ids minted by
    /// [`Session::get_temp_id`].
    pub fn set_default_result_ids(
        &self,
        id_types: impl IntoIterator<Item = impl Into<String>>,
    ) {
        let id_types = id_types.into_iter().map(Into::into).collect();
        self.defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .result_ids = Some(id_types);
    }

    /// The configured default result fields, if any.
    #[must_use]
    pub fn default_result_fields(&self) -> Option<BTreeSet<String>> {
        self.defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .result_fields
            .clone()
    }

    /// The configured default result identifier types, if any.
    #[must_use]
    pub fn default_result_ids(&self) -> Option<BTreeSet<String>> {
        self.defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .result_ids
            .clone()
    }

    /// Exchanges a permanent patient identifier for a temporary identifier.
    ///
    /// A temp-id names the patient for the lifetime of this session and
    /// doubles as an authorization token to read the declared fields and
    /// identifier types of that patient. A cached temp-id is returned
    /// without any network traffic; on a miss a `readPatients` token naming
    /// exactly this patient is minted on the service and cached.
    ///
    /// `result_fields` / `result_ids` restrict what the temp-id exposes.
    /// `None` leaves the respective restriction unspecified; an empty set
    /// grants access to nothing, which the service treats differently.
    ///
    /// # Errors
    /// [`PseudokitError::InvalidSession`] if the session no longer exists on
    /// the service, [`PseudokitError::NetworkError`] on transport failures
    /// and unexpected statuses, [`PseudokitError::ProtocolViolation`] if the
    /// service answers 201 without a token id.
    pub async fn get_temp_id_with(
        &self,
        patient: &PatientId,
        result_fields: Option<BTreeSet<String>>,
        result_ids: Option<BTreeSet<String>>,
    ) -> Result<String, PseudokitError> {
        let mut cache = self.cache.lock().await;
        if let Some(temp_id) = cache.temp_id_by_patient.get(patient) {
            debug!(patient = %patient, "temp-id cache hit");
            return Ok(temp_id.clone());
        }

        let mut token = ReadPatientsToken::new().add_search_id(patient.clone());
        if let Some(fields) = result_fields {
            token = token.result_fields(fields);
        }
        if let Some(ids) = result_ids {
            token = token.result_ids(ids);
        }
        let temp_id = self.request_token(&Token::ReadPatients(token)).await?;
        cache.insert(patient.clone(), temp_id.clone());
        debug!(patient = %patient, temp_id, "temp-id minted");
        Ok(temp_id)
    }

    /// [`Session::get_temp_id_with`] using the session's configured default
    /// result fields and identifier types.
    ///
    /// # Errors
    /// [`PseudokitError::InvalidArgument`] if neither default set was ever
    /// configured: this client refuses to silently mint an unrestricted
    /// token. Configure defaults via [`Session::set_default_result_fields`]
    /// or [`Session::set_default_result_ids`], or state the restrictions
    /// explicitly via [`Session::get_temp_id_with`]. Otherwise as
    /// [`Session::get_temp_id_with`].
    pub async fn get_temp_id(&self, patient: &PatientId) -> Result<String, PseudokitError> {
        let (result_fields, result_ids) = {
            let defaults = self.defaults.read().unwrap_or_else(PoisonError::into_inner);
            (defaults.result_fields.clone(), defaults.result_ids.clone())
        };
        if result_fields.is_none() && result_ids.is_none() {
            return Err(PseudokitError::InvalidArgument {
                attribute: "default_result_fields".to_string(),
                reason: "no default result fields or identifier types configured for this session"
                    .to_string(),
            });
        }
        self.get_temp_id_with(patient, result_fields, result_ids).await
    }

    /// Looks up the permanent identifier a temp-id was minted for. Pure
    /// cache lookup; never contacts the service.
    pub async fn get_id(&self, temp_id: &str) -> Option<PatientId> {
        self.cache.lock().await.patient_by_temp_id.get(temp_id).cloned()
    }

    /// All temp-ids currently cached for this session.
    pub async fn temp_ids(&self) -> Vec<String> {
        self.cache.lock().await.patient_by_temp_id.keys().cloned().collect()
    }

    /// All permanent identifiers this session currently holds temp-ids for.
    pub async fn patient_ids(&self) -> Vec<PatientId> {
        self.cache.lock().await.temp_id_by_patient.keys().cloned().collect()
    }

    /// Drops a temp-id from the cache and invalidates the backing token on
    /// the service.
    ///
    /// # Errors
    /// [`PseudokitError::InvalidSession`] if the service reports the session
    /// itself gone (404), [`PseudokitError::NetworkError`] for any other
    /// unsuccessful response or transport failure.
    pub async fn remove_temp_id(&self, temp_id: &str) -> Result<(), PseudokitError> {
        let mut cache = self.cache.lock().await;
        self.delete_temp_id(&mut cache, temp_id).await
    }

    /// Removes the temp-id cached for `patient`, if one exists. Without a
    /// cached temp-id this is a no-op.
    ///
    /// # Errors
    /// As [`Session::remove_temp_id`].
    pub async fn remove_temp_id_for(&self, patient: &PatientId) -> Result<(), PseudokitError> {
        let mut cache = self.cache.lock().await;
        let Some(temp_id) = cache.temp_id_by_patient.get(patient).cloned() else {
            return Ok(());
        };
        self.delete_temp_id(&mut cache, &temp_id).await
    }

    async fn delete_temp_id(
        &self,
        cache: &mut TempIdCache,
        temp_id: &str,
    ) -> Result<(), PseudokitError> {
        cache.remove(temp_id);
        let response = self
            .connection
            .delete(&format!("{}{temp_id}", self.tokens_path()))
            .await?;
        if response.status() == 404 {
            return Err(PseudokitError::InvalidSession);
        }
        if !response.is_success() {
            return Err(response.into_network_error());
        }
        debug!(temp_id, "temp-id removed");
        Ok(())
    }

    /// Registers a capability token of any kind on the service and returns
    /// the token id assigned to it.
    ///
    /// # Errors
    /// [`PseudokitError::InvalidSession`] on 404 (the session is gone),
    /// [`PseudokitError::NetworkError`] for other unexpected statuses or
    /// transport failures, [`PseudokitError::ProtocolViolation`] if a 201
    /// body carries no token id.
    pub async fn get_token(&self, token: &Token) -> Result<String, PseudokitError> {
        self.request_token(token).await
    }

    /// Registers an `addPatient` token, authorizing the bearer to create one
    /// patient. The returned token id is typically handed to a user's
    /// browser as an authorization ticket.
    ///
    /// # Errors
    /// As [`Session::get_token`].
    pub async fn add_patient_token(
        &self,
        callback: Option<&str>,
        redirect: Option<&str>,
    ) -> Result<String, PseudokitError> {
        let mut token = AddPatientToken::new();
        if let Some(callback) = callback {
            token = token.callback(callback);
        }
        if let Some(redirect) = redirect {
            token = token.redirect(redirect);
        }
        self.request_token(&Token::AddPatient(token)).await
    }

    /// Registers an `editPatient` token for the given patient.
    ///
    /// # Errors
    /// As [`Session::get_token`].
    pub async fn edit_patient_token(
        &self,
        patient: PatientId,
        redirect: Option<&str>,
    ) -> Result<String, PseudokitError> {
        let mut token = EditPatientToken::new(patient);
        if let Some(redirect) = redirect {
            token = token.redirect(redirect);
        }
        self.request_token(&Token::EditPatient(token)).await
    }

    async fn request_token(&self, token: &Token) -> Result<String, PseudokitError> {
        let response = self.connection.post(&self.tokens_path(), token).await?;
        match response.status() {
            201 => {}
            404 => return Err(PseudokitError::InvalidSession),
            _ => return Err(response.into_network_error()),
        }
        let body: serde_json::Value = response.json()?;
        let token_id = body
            .get("id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| PseudokitError::ProtocolViolation {
                url: response.url().to_string(),
                error: "token registration response carries no token id".to_string(),
            })?;
        debug!(token_id, "token registered");
        Ok(token_id.to_string())
    }

    /// Checks whether this session still exists on the service.
    ///
    /// A locally destroyed session reports `false` immediately, without a
    /// network round-trip. Otherwise the session resource is fetched: 200
    /// means valid, any other status invalid.
    ///
    /// # Errors
    /// [`PseudokitError::NetworkError`] if the transport fails.
    pub async fn is_valid(&self) -> Result<bool, PseudokitError> {
        if self.invalidated.load(Ordering::Acquire) {
            return Ok(false);
        }
        let response = self.connection.get(&self.path()).await?;
        Ok(response.status() == 200)
    }

    /// Deletes this session on the service and marks it invalid locally.
    ///
    /// Destruction is best-effort: whatever the service answers, and even
    /// when the transport fails, the session is never again treated as
    /// usable locally. The transition is one-way; there is no operation that
    /// re-validates a destroyed session.
    ///
    /// # Errors
    /// [`PseudokitError::NetworkError`] if the transport fails. The local
    /// invalidation has happened regardless.
    pub async fn destroy(&self) -> Result<(), PseudokitError> {
        let result = self.connection.delete(&self.path()).await;
        self.invalidated.store(true, Ordering::Release);
        debug!(session_id = %self.id, "session destroyed");
        result.map(|_response| ())
    }

    /// Rebuilds the temp-id cache from the service's token listing for this
    /// session.
    ///
    /// Only `readPatients` tokens naming exactly one search identifier enter
    /// the cache; every other entry may be a perfectly valid token on the
    /// service but is not a temp-id from this client's point of view.
    pub async fn reconcile(&self, tokens: &[ListedToken]) {
        let mut cache = self.cache.lock().await;
        let mut restored = 0_usize;
        for token in tokens {
            if let Some((patient, temp_id)) = token.temp_id_mapping() {
                cache.insert(patient, temp_id);
                restored += 1;
            }
        }
        debug!(restored, ignored = tokens.len() - restored, "cache reconciled");
    }
}
