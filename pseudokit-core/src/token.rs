//! Capability tokens understood by the pseudonymization service.
//!
//! A token authorizes one specific request against the service (create a
//! patient, edit a patient's data, read patient data) and is usually handed
//! to another party, e.g. a user's browser, as an authorization ticket. On
//! the wire every token is a tagged `{"type": ..., "data": {...}}` object.
//! Fields that were never set are omitted from the body entirely: the
//! service distinguishes "not specified" from "specified as empty".

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::patient_id::PatientId;

/// A capability token of one of the kinds supported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Token {
    /// Authorizes creating one patient.
    AddPatient(AddPatientToken),
    /// Authorizes editing one patient's data.
    EditPatient(EditPatientToken),
    /// Authorizes reading data of one or more patients.
    ReadPatients(ReadPatientsToken),
}

/// Token of type `addPatient`: allows the bearer to create one patient by
/// submitting identifying data to the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPatientToken {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    id_types: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    fields: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    ids: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect: Option<String>,
}

impl AddPatientToken {
    /// Creates an empty `addPatient` token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an identifier type to create for the new patient. Identifiers of
    /// all listed types are created (or returned, if the patient already
    /// exists) when the token is used.
    #[must_use]
    pub fn add_id_type(mut self, id_type: impl Into<String>) -> Self {
        self.id_types.push(id_type.into());
        self
    }

    /// Adds a predefined field, stored in addition to whatever the token
    /// user submits.
    #[must_use]
    pub fn add_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Adds an externally generated identifier for the new patient.
    #[must_use]
    pub fn add_external_id(
        mut self,
        id_type: impl Into<String>,
        id_string: impl Into<String>,
    ) -> Self {
        self.ids.insert(id_type.into(), id_string.into());
        self
    }

    /// Sets the URL the service calls back after creating the patient,
    /// transmitting the token id and the generated identifiers.
    #[must_use]
    pub fn callback(mut self, url: impl Into<String>) -> Self {
        self.callback = Some(url.into());
        self
    }

    /// Sets the URL template the user is redirected to after creating the
    /// patient. Template parameters in curly braces are replaced with the
    /// created identifiers (parameter name = identifier type) or with the
    /// token id (`{tokenId}`).
    #[must_use]
    pub fn redirect(mut self, template: impl Into<String>) -> Self {
        self.redirect = Some(template.into());
        self
    }
}

/// Token of type `editPatient`: allows the bearer to edit the data of one
/// specific patient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditPatientToken {
    patient_id: PatientId,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    fields: BTreeSet<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    ids: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audit_trail: Option<AuditTrail>,
}

impl EditPatientToken {
    /// Creates a token for editing the patient named by `patient_id`. An
    /// `editPatient` token is always bound to one patient.
    ///
    /// A fresh token allows editing nothing; grant fields and identifier
    /// types explicitly via [`EditPatientToken::fields_to_edit`] and
    /// [`EditPatientToken::ids_to_edit`].
    #[must_use]
    pub fn new(patient_id: PatientId) -> Self {
        Self {
            patient_id,
            fields: BTreeSet::new(),
            ids: BTreeSet::new(),
            redirect: None,
            audit_trail: None,
        }
    }

    /// Sets the fields that may be edited with this token. An empty
    /// collection means no fields are editable.
    #[must_use]
    pub fn fields_to_edit(
        mut self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.fields = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the identifier types that may be edited with this token. An
    /// empty collection means no identifiers are editable.
    #[must_use]
    pub fn ids_to_edit(
        mut self,
        id_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.ids = id_types.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the URL the user is redirected to after the edit operation.
    #[must_use]
    pub fn redirect(mut self, url: impl Into<String>) -> Self {
        self.redirect = Some(url.into());
        self
    }

    /// Attaches audit metadata recorded by the service when the token is
    /// used.
    #[must_use]
    pub fn audit_trail(mut self, audit_trail: AuditTrail) -> Self {
        self.audit_trail = Some(audit_trail);
        self
    }
}

/// Token of type `readPatients`: allows the bearer to read identifying data
/// and/or identifiers of the listed patients.
///
/// By protocol convention a `readPatients` token naming exactly one search
/// identifier is a temporary identifier for that patient; one naming several
/// is a general query token and never enters the session's temp-id cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadPatientsToken {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    search_ids: Vec<PatientId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_fields: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_ids: Option<BTreeSet<String>>,
}

impl ReadPatientsToken {
    /// Creates an empty `readPatients` token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a patient whose data should be readable with this token.
    #[must_use]
    pub fn add_search_id(mut self, patient: PatientId) -> Self {
        self.search_ids.push(patient);
        self
    }

    /// Sets the fields that appear in the result. Passing an empty
    /// collection exposes no fields, which the service treats differently
    /// from leaving the restriction unspecified.
    #[must_use]
    pub fn result_fields(
        mut self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.result_fields = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the identifier types that appear in the result.
    #[must_use]
    pub fn result_ids(
        mut self,
        id_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.result_ids = Some(id_types.into_iter().map(Into::into).collect());
        self
    }

    /// The patients whose data this token exposes.
    #[must_use]
    pub fn search_ids(&self) -> &[PatientId] {
        &self.search_ids
    }
}

/// Audit metadata attached to a data-changing token. The service records it
/// in its audit trail when the token is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTrail {
    username: String,
    remote_system: String,
    reason_for_change: String,
}

impl AuditTrail {
    /// Creates audit metadata naming the acting user, the system the change
    /// originates from, and the reason for the change.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        remote_system: impl Into<String>,
        reason_for_change: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            remote_system: remote_system.into(),
            reason_for_change: reason_for_change.into(),
        }
    }
}

/// A token as returned by the service's token listing for a session.
///
/// Listings may contain token types unknown to this client; those are kept
/// readable (id and type tag) but their payload stays uninterpreted.
#[derive(Debug, Clone, Deserialize)]
pub struct ListedToken {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ListedToken {
    /// The identifier the service assigned to this token.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The type tag of this token.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Interprets this token as a temp-id mapping, if it is one: a
    /// `readPatients` token naming exactly one search identifier. Any other
    /// type, any other search-identifier count, and unreadable payloads
    /// yield `None`; such tokens may be perfectly valid on the service,
    /// they are just not temp-ids.
    pub(crate) fn temp_id_mapping(&self) -> Option<(PatientId, String)> {
        if self.kind != "readPatients" {
            return None;
        }
        let data: ReadPatientsToken = serde_json::from_value(self.data.clone()).ok()?;
        if let [patient] = data.search_ids.as_slice() {
            Some((patient.clone(), self.id.clone()))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn patient() -> PatientId {
        PatientId::new("pid", "ABCD1234").unwrap()
    }

    #[test]
    fn add_patient_token_carries_all_set_values() {
        let token = AddPatientToken::new()
            .add_field("vorname", "Karl")
            .add_field("nachname", "Müller")
            .add_id_type("pid")
            .add_id_type("labid")
            .callback("https://mdat.example.org/newPatientCallback")
            .redirect("https://mdat.example.org/newPatient?pid={pid}");

        assert_eq!(
            serde_json::to_value(Token::AddPatient(token)).unwrap(),
            json!({
                "type": "addPatient",
                "data": {
                    "idTypes": ["pid", "labid"],
                    "fields": {"vorname": "Karl", "nachname": "Müller"},
                    "callback": "https://mdat.example.org/newPatientCallback",
                    "redirect": "https://mdat.example.org/newPatient?pid={pid}"
                }
            })
        );
    }

    #[test]
    fn add_patient_token_omits_unset_values() {
        assert_eq!(
            serde_json::to_value(Token::AddPatient(AddPatientToken::new())).unwrap(),
            json!({"type": "addPatient", "data": {}})
        );
    }

    #[test]
    fn add_patient_token_external_ids() {
        let token = AddPatientToken::new()
            .add_external_id("extid", "valueOfExtId")
            .add_external_id("labid", "valueOfLabId");

        assert_eq!(
            serde_json::to_value(token).unwrap(),
            json!({"ids": {"extid": "valueOfExtId", "labid": "valueOfLabId"}})
        );
    }

    #[test]
    fn edit_patient_token_names_only_the_patient_by_default() {
        let token = EditPatientToken::new(patient());
        assert_eq!(
            serde_json::to_value(Token::EditPatient(token)).unwrap(),
            json!({
                "type": "editPatient",
                "data": {"patientId": {"idType": "pid", "idString": "ABCD1234"}}
            })
        );
    }

    #[test]
    fn edit_patient_token_lists_editable_fields_and_ids() {
        let token = EditPatientToken::new(patient())
            .fields_to_edit(["vorname", "nachname"])
            .ids_to_edit(["labid", "extid"])
            .redirect("https://mdat.example.org/done");

        let value = serde_json::to_value(token).unwrap();
        assert_eq!(value["fields"], json!(["nachname", "vorname"]));
        assert_eq!(value["ids"], json!(["extid", "labid"]));
        assert_eq!(value["redirect"], json!("https://mdat.example.org/done"));
    }

    #[test]
    fn edit_patient_token_empty_grants_are_omitted() {
        let token = EditPatientToken::new(patient())
            .fields_to_edit(Vec::<String>::new())
            .ids_to_edit(Vec::<String>::new());

        let value = serde_json::to_value(token).unwrap();
        assert!(value.get("fields").is_none());
        assert!(value.get("ids").is_none());
    }

    #[test]
    fn edit_patient_token_audit_trail() {
        let token = EditPatientToken::new(patient()).audit_trail(AuditTrail::new(
            "doe",
            "registry-frontend",
            "typo in name",
        ));

        assert_eq!(
            serde_json::to_value(token).unwrap()["auditTrail"],
            json!({
                "username": "doe",
                "remoteSystem": "registry-frontend",
                "reasonForChange": "typo in name"
            })
        );
    }

    #[test]
    fn read_patients_token_distinguishes_absent_from_empty_restrictions() {
        let unrestricted = ReadPatientsToken::new().add_search_id(patient());
        let value = serde_json::to_value(&unrestricted).unwrap();
        assert!(value.get("resultFields").is_none());
        assert!(value.get("resultIds").is_none());

        let locked_down = unrestricted
            .result_fields(Vec::<String>::new())
            .result_ids(Vec::<String>::new());
        let value = serde_json::to_value(locked_down).unwrap();
        assert_eq!(value["resultFields"], json!([]));
        assert_eq!(value["resultIds"], json!([]));
    }

    #[test]
    fn read_patients_token_wire_shape() {
        let token = ReadPatientsToken::new()
            .add_search_id(PatientId::new("intid", "42").unwrap())
            .result_fields(["vorname"])
            .result_ids(["pid"]);

        assert_eq!(
            serde_json::to_value(Token::ReadPatients(token)).unwrap(),
            json!({
                "type": "readPatients",
                "data": {
                    "searchIds": [{"idType": "intid", "idString": "42"}],
                    "resultFields": ["vorname"],
                    "resultIds": ["pid"]
                }
            })
        );
    }

    #[test]
    fn listed_token_with_single_search_id_is_a_temp_id() {
        let token: ListedToken = serde_json::from_value(json!({
            "id": "t1",
            "type": "readPatients",
            "data": {"searchIds": [{"idType": "intid", "idString": "42"}]}
        }))
        .unwrap();

        let (patient, temp_id) = token.temp_id_mapping().unwrap();
        assert_eq!(patient, PatientId::new("intid", "42").unwrap());
        assert_eq!(temp_id, "t1");
    }

    #[test]
    fn listed_token_with_several_search_ids_is_not_a_temp_id() {
        let token: ListedToken = serde_json::from_value(json!({
            "id": "t2",
            "type": "readPatients",
            "data": {"searchIds": [
                {"idType": "intid", "idString": "1"},
                {"idType": "intid", "idString": "2"}
            ]}
        }))
        .unwrap();
        assert!(token.temp_id_mapping().is_none());
    }

    #[test]
    fn listed_token_of_foreign_type_is_ignored() {
        let token: ListedToken = serde_json::from_value(json!({
            "id": "t3",
            "type": "addPatient",
            "data": {}
        }))
        .unwrap();
        assert!(token.temp_id_mapping().is_none());

        let malformed: ListedToken = serde_json::from_value(json!({
            "id": "t4",
            "type": "readPatients",
            "data": {"searchIds": "not-a-list"}
        }))
        .unwrap();
        assert!(malformed.temp_id_mapping().is_none());
    }
}
