use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::{GatewayError, Workflow};

/// Named input an operation can require or derive a header from.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum InputField {
    #[serde(rename = "workflow")]
    Workflow,
    #[serde(rename = "projectId")]
    ProjectId,
    #[serde(rename = "t")]
    RoundIndex,
    #[serde(rename = "targetPhase")]
    TargetPhase,
    #[serde(rename = "participantId")]
    ParticipantId,
    #[serde(rename = "role")]
    Role,
    #[serde(rename = "portalType")]
    PortalType,
    #[serde(rename = "body")]
    Body,
    #[serde(rename = "file")]
    File,
}

impl InputField {
    /// Fields carried as plain strings (query, JSON body, multipart text part).
    pub const SCALARS: [Self; 7] = [
        Self::Workflow,
        Self::ProjectId,
        Self::RoundIndex,
        Self::TargetPhase,
        Self::ParticipantId,
        Self::Role,
        Self::PortalType,
    ];

    /// Wire key used in query strings, JSON bodies and form fields.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::ProjectId => "projectId",
            Self::RoundIndex => "t",
            Self::TargetPhase => "targetPhase",
            Self::ParticipantId => "participantId",
            Self::Role => "role",
            Self::PortalType => "portalType",
            Self::Body => "body",
            Self::File => "file",
        }
    }

    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::SCALARS.into_iter().find(|field| field.key() == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub field_name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartForm {
    pub fields: Vec<(String, String)>,
    pub file: Option<FilePart>,
}

#[derive(Debug, Clone, PartialEq)]
enum RequestBody {
    Json(Value),
    Multipart(MultipartForm),
}

/// Caller-supplied inputs for one operation.
///
/// Scalar fields may arrive from the query string and from the body. When
/// both carry the same field with different values the inputs are marked
/// conflicting and the gateway refuses them, since the header and the body
/// would otherwise scope the request to different projects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationInputs {
    fields: BTreeMap<InputField, String>,
    body: Option<RequestBody>,
    conflicts: Vec<InputField>,
}

impl OperationInputs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: InputField, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: InputField, value: impl Into<String>) {
        self.fields.insert(field, value.into());
    }

    /// Absorbs recognized query parameters; unknown keys are ignored.
    #[must_use]
    pub fn with_query<'a, I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in pairs {
            if let Some(field) = InputField::from_key(key) {
                self.merge(field, value.to_string());
            }
        }
        self
    }

    /// Attaches a JSON body and lifts its top-level scalar fields.
    #[must_use]
    pub fn with_json_body(mut self, body: Value) -> Self {
        if let Some(object) = body.as_object() {
            for field in InputField::SCALARS {
                let lifted = match object.get(field.key()) {
                    Some(Value::String(value)) => Some(value.clone()),
                    Some(Value::Number(value)) => Some(value.to_string()),
                    _ => None,
                };
                if let Some(value) = lifted {
                    self.merge(field, value);
                }
            }
        }
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Attaches a multipart form and lifts its text fields.
    #[must_use]
    pub fn with_multipart(mut self, form: MultipartForm) -> Self {
        for (name, value) in &form.fields {
            if let Some(field) = InputField::from_key(name) {
                self.merge(field, value.clone());
            }
        }
        self.body = Some(RequestBody::Multipart(form));
        self
    }

    fn merge(&mut self, field: InputField, value: String) {
        match self.fields.get(&field) {
            Some(existing) if existing.trim() != value.trim() => {
                if !self.conflicts.contains(&field) {
                    self.conflicts.push(field);
                }
            }
            Some(_) => {}
            None => {
                self.fields.insert(field, value);
            }
        }
    }

    #[must_use]
    pub fn get(&self, field: InputField) -> Option<&str> {
        self.fields
            .get(&field)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            Some(RequestBody::Json(value)) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn multipart(&self) -> Option<&MultipartForm> {
        match &self.body {
            Some(RequestBody::Multipart(form)) => Some(form),
            _ => None,
        }
    }

    #[must_use]
    pub fn conflicts(&self) -> &[InputField] {
        &self.conflicts
    }

    /// Whether a required input is present and non-empty.
    ///
    /// `Workflow` is answered by [`Self::workflow`] and the gateway's route
    /// binding, not here.
    #[must_use]
    pub fn is_present(&self, field: InputField) -> bool {
        match field {
            InputField::Body => match &self.body {
                Some(RequestBody::Json(Value::Null)) | None => false,
                Some(_) => true,
            },
            InputField::File => self
                .multipart()
                .and_then(|form| form.file.as_ref())
                .is_some(),
            other => self.get(other).is_some(),
        }
    }

    /// Parses the caller-supplied workflow field, if any.
    ///
    /// # Errors
    /// Returns [`GatewayError::BadRequest`] when the field names no known workflow.
    pub fn workflow(&self) -> Result<Option<Workflow>, GatewayError> {
        match self.get(InputField::Workflow) {
            None => Ok(None),
            Some(raw) => Workflow::parse(raw).map(Some).ok_or_else(|| {
                GatewayError::invalid(
                    InputField::Workflow.key(),
                    format!("names no known workflow: '{raw}'"),
                )
            }),
        }
    }

    /// Parses the round index `t`.
    ///
    /// # Errors
    /// Returns [`GatewayError::BadRequest`] when `t` is absent or not a
    /// non-negative integer.
    pub fn round_index(&self) -> Result<u64, GatewayError> {
        let raw = self
            .get(InputField::RoundIndex)
            .ok_or_else(|| GatewayError::missing(InputField::RoundIndex.key()))?;
        raw.parse::<u64>().map_err(|_| {
            GatewayError::invalid(
                InputField::RoundIndex.key(),
                format!("must be a non-negative integer, got '{raw}'"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_body_fields_are_lifted_including_numbers() {
        let inputs = OperationInputs::new().with_json_body(json!({
            "projectId": "P1",
            "t": 3,
            "amount": 10,
        }));
        assert_eq!(inputs.get(InputField::ProjectId), Some("P1"));
        assert_eq!(inputs.get(InputField::RoundIndex), Some("3"));
        assert!(inputs.is_present(InputField::Body));
        assert!(inputs.conflicts().is_empty());
    }

    #[test]
    fn disagreeing_query_and_body_values_are_flagged() {
        let inputs = OperationInputs::new()
            .with_query([("projectId", "P1")])
            .with_json_body(json!({"projectId": "P2"}));
        assert_eq!(inputs.get(InputField::ProjectId), Some("P1"));
        assert_eq!(inputs.conflicts(), &[InputField::ProjectId]);
    }

    #[test]
    fn blank_values_count_as_missing() {
        let inputs = OperationInputs::new()
            .with(InputField::ProjectId, "   ")
            .with_json_body(Value::Null);
        assert!(!inputs.is_present(InputField::ProjectId));
        assert!(!inputs.is_present(InputField::Body));
    }

    #[test]
    fn round_index_must_be_a_non_negative_integer() {
        let negative = OperationInputs::new().with(InputField::RoundIndex, "-1");
        assert!(matches!(
            negative.round_index(),
            Err(GatewayError::BadRequest { ref field, .. }) if field == "t"
        ));
        let ok = OperationInputs::new().with(InputField::RoundIndex, "7");
        assert_eq!(ok.round_index(), Ok(7));
    }

    #[test]
    fn multipart_text_fields_are_lifted_and_file_counts_as_present() {
        let form = MultipartForm {
            fields: vec![
                ("projectId".to_string(), "P9".to_string()),
                ("portalType".to_string(), "resident".to_string()),
            ],
            file: Some(FilePart {
                field_name: "file".to_string(),
                file_name: Some("deed.pdf".to_string()),
                content_type: Some("application/pdf".to_string()),
                bytes: vec![1, 2, 3],
            }),
        };
        let inputs = OperationInputs::new().with_multipart(form);
        assert_eq!(inputs.get(InputField::PortalType), Some("resident"));
        assert!(inputs.is_present(InputField::File));
    }
}
