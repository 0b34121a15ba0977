//! Protocol Module
//!
//! Defines the request and response types of the single submission
//! endpoint. One form-encoded body is multiplexed by control fields:
//!
//! | control        | request                                   |
//! |----------------|-------------------------------------------|
//! | `do=<op>`      | PKCS#7 operation or PKCS#12 authenticate  |
//! | `k=true`       | public key (optionally with `u` and `i`)  |
//! | `c=true`       | certificate for the keyring slot          |
//! | none           | decrypt and process the submitted fields  |
//!
//! Every other field is an RSA-encrypted [`EncryptedField`].

use serde::Serialize;

use crate::error::{Error, Result};
use crate::field::{self, EncryptedField};

pub const KEY_FIELD: &str = "k";
pub const UUID_FIELD: &str = "u";
pub const IV_FIELD: &str = "i";
pub const CERT_FIELD: &str = "c";
pub const OPERATION_FIELD: &str = "do";

/// Encrypted fields with a protocol meaning.
pub const EMAIL_FIELD: &str = "email";
pub const PIN_FIELD: &str = "pin";
pub const MESSAGE_FIELD: &str = "message";

const CONTROL_FIELDS: [&str; 5] = [KEY_FIELD, UUID_FIELD, IV_FIELD, CERT_FIELD, OPERATION_FIELD];

pub fn is_control_field(name: &str) -> bool {
    CONTROL_FIELDS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Sign,
    Verify,
    EncryptSign,
    DecryptVerify,
    Authenticate,
}

impl Operation {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "sign" => Some(Operation::Sign),
            "verify" => Some(Operation::Verify),
            "encrypt_sign" => Some(Operation::EncryptSign),
            "decrypt_verify" => Some(Operation::DecryptVerify),
            "authenticate" => Some(Operation::Authenticate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Sign => "sign",
            Operation::Verify => "verify",
            Operation::EncryptSign => "encrypt_sign",
            Operation::DecryptVerify => "decrypt_verify",
            Operation::Authenticate => "authenticate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    PublicKey {
        uuid: Option<String>,
        iv: Option<String>,
    },
    Certificate,
    Operation {
        operation: Operation,
        /// Base64 certificate the client presents, used by `authenticate`.
        certificate: Option<String>,
    },
    Submit,
}

/// A decoded request body.
#[derive(Debug)]
pub struct ParsedBody {
    pub request: Request,
    pub fields: Vec<(String, EncryptedField)>,
}

impl ParsedBody {
    pub fn field(&self, name: &str) -> Option<&EncryptedField> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }
}

/// Classify a form body and decode its encrypted fields.
pub fn parse_body(pairs: &[(String, String)]) -> Result<ParsedBody> {
    let control = |name: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    };

    let request = if let Some(op) = control(OPERATION_FIELD) {
        let operation = Operation::parse(op)
            .ok_or_else(|| Error::BadRequest(format!("unknown operation '{}'", op)))?;
        Request::Operation {
            operation,
            certificate: control(CERT_FIELD).map(str::to_string),
        }
    } else if control(KEY_FIELD) == Some("true") {
        Request::PublicKey {
            uuid: control(UUID_FIELD).map(str::to_string),
            iv: control(IV_FIELD).map(str::to_string),
        }
    } else if control(CERT_FIELD) == Some("true") {
        Request::Certificate
    } else {
        Request::Submit
    };

    let fields = field::parse_fields(
        pairs
            .iter()
            .filter(|(k, _)| !is_control_field(k))
            .map(|(k, v)| (k.as_str(), v.as_str())),
    )?;
    Ok(ParsedBody { request, fields })
}

/// Form pairs asking for the public key.
pub fn public_key_request(uuid: &str, iv: &str) -> Vec<(String, String)> {
    vec![
        (KEY_FIELD.to_string(), "true".to_string()),
        (UUID_FIELD.to_string(), uuid.to_string()),
        (IV_FIELD.to_string(), iv.to_string()),
    ]
}

/// Response bodies. Every variant serializes to a flat JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    PublicKey {
        success: bool,
        key: String,
    },
    Certificate {
        success: bool,
        /// Base64 of the certificate PEM.
        certificate: String,
    },
    Signed {
        success: bool,
        signed: String,
    },
    Envelope {
        success: bool,
        message: String,
    },
    Verified {
        verified: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Authenticate {
        #[serde(rename = "Authenticate")]
        authenticated: bool,
    },
    Processed {
        success: serde_json::Value,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl Response {
    pub fn error(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Response::Error {
            error: message.into(),
            details,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "error": "encoding" }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_public_key_request() {
        let body = parse_body(&public_key_request("uuid-1", "iv-1")).unwrap();
        assert_eq!(
            body.request,
            Request::PublicKey {
                uuid: Some("uuid-1".to_string()),
                iv: Some("iv-1".to_string())
            }
        );
        assert!(body.fields.is_empty());
    }

    #[test]
    fn test_operation_takes_precedence() {
        let body = parse_body(&pairs(&[
            ("do", "authenticate"),
            ("c", "Y2VydA=="),
            ("pin", "abcd"),
        ]))
        .unwrap();
        assert_eq!(
            body.request,
            Request::Operation {
                operation: Operation::Authenticate,
                certificate: Some("Y2VydA==".to_string())
            }
        );
        assert!(body.field("pin").is_some());
        assert!(body.field("c").is_none());
    }

    #[test]
    fn test_certificate_and_submit() {
        let body = parse_body(&pairs(&[("c", "true"), ("email", "00ff")])).unwrap();
        assert_eq!(body.request, Request::Certificate);
        let body = parse_body(&pairs(&[("name", "00ff"), ("note[0]", "aa"), ("note[1]", "bb")]))
            .unwrap();
        assert_eq!(body.request, Request::Submit);
        assert_eq!(body.fields.len(), 2);
    }

    #[test]
    fn test_unknown_operation_rejected() {
        assert!(matches!(
            parse_body(&pairs(&[("do", "explode")])),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn test_response_shapes() {
        assert_eq!(
            Response::Authenticate { authenticated: true }.to_json(),
            json!({ "Authenticate": true })
        );
        assert_eq!(
            Response::Verified { verified: false, message: None }.to_json(),
            json!({ "verified": false })
        );
        assert_eq!(
            Response::error("bad", None).to_json(),
            json!({ "error": "bad" })
        );
        assert_eq!(
            Response::Processed { success: json!({"name": "John"}) }.to_json(),
            json!({ "success": { "name": "John" } })
        );
    }
}
