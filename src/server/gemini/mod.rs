//! Gemini front end: browsing, registration, login and the account pages.

mod account;
mod browse;
mod listener;
mod router;
mod views;

use std::net::IpAddr;

pub use listener::{fingerprint, parse_request_line, serve};
pub use router::handle;

use crate::error::Error;

pub const GEMTEXT: &str = "text/gemini; charset=utf-8";

/// A parsed request line together with what the TLS layer learned.
#[derive(Debug, Clone)]
pub struct Request {
    /// Hex SHA-256 of the client certificate, when one was presented.
    pub fingerprint: Option<String>,
    pub path: String,
    /// Decoded query string, the answer to an input prompt.
    pub query: Option<String>,
    pub peer: IpAddr,
}

impl Request {
    pub fn new(path: impl Into<String>, peer: IpAddr) -> Self {
        Self {
            fingerprint: None,
            path: path.into(),
            query: None,
            peer,
        }
    }

    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// The query, ignoring an empty answer.
    pub fn input(&self) -> Option<&str> {
        self.query.as_deref().filter(|q| !q.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Input(String),
    SensitiveInput(String),
    Success { mime: &'static str, body: Vec<u8> },
    Redirect(String),
    RedirectPermanent(String),
    TemporaryFailure(String),
    NotFound(String),
    BadRequest(String),
    CertificateRequired(String),
}

impl Response {
    pub fn gemtext(body: impl Into<String>) -> Self {
        Self::Success {
            mime: GEMTEXT,
            body: body.into().into_bytes(),
        }
    }

    pub fn redirect(target: impl Into<String>) -> Self {
        Self::Redirect(target.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound("not found".to_string())
    }

    pub fn certificate_required() -> Self {
        Self::CertificateRequired("a client certificate is required".to_string())
    }

    #[must_use]
    pub fn status(&self) -> u8 {
        match self {
            Self::Input(_) => 10,
            Self::SensitiveInput(_) => 11,
            Self::Success { .. } => 20,
            Self::Redirect(_) => 30,
            Self::RedirectPermanent(_) => 31,
            Self::TemporaryFailure(_) => 40,
            Self::NotFound(_) => 51,
            Self::BadRequest(_) => 59,
            Self::CertificateRequired(_) => 60,
        }
    }

    /// Body bytes for a success, empty otherwise.
    pub fn body(&self) -> &[u8] {
        match self {
            Self::Success { body, .. } => body,
            _ => &[],
        }
    }

    /// Header line and body as sent on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let meta = match self {
            Self::Success { mime, .. } => *mime,
            Self::Input(m)
            | Self::SensitiveInput(m)
            | Self::Redirect(m)
            | Self::RedirectPermanent(m)
            | Self::TemporaryFailure(m)
            | Self::NotFound(m)
            | Self::BadRequest(m)
            | Self::CertificateRequired(m) => m.as_str(),
        };
        let mut out = format!("{} {meta}\r\n", self.status()).into_bytes();
        out.extend_from_slice(self.body());
        out
    }
}

impl From<Error> for Response {
    fn from(err: Error) -> Self {
        match err {
            Error::RepoNotFound | Error::UserNotFound | Error::GroupNotFound => {
                Self::NotFound(err.to_string())
            }
            Error::WrongSignature | Error::SignatureMismatch => Self::redirect("/"),
            _ => Self::TemporaryFailure(err.public_message()),
        }
    }
}
