//! Outgoing chat requests, their responses, and the auth class that routes them.

use std::fmt;

use crate::error::TransportError;

/// Which persistent connection a request travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthClass {
    /// Authenticated with the account's credentials at connect time.
    Identified,
    /// No account credentials; used for anonymous and sealed-sender traffic.
    Unidentified,
}

impl AuthClass {
    pub const ALL: [AuthClass; 2] = [AuthClass::Identified, AuthClass::Unidentified];
}

impl fmt::Display for AuthClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthClass::Identified => write!(f, "identified"),
            AuthClass::Unidentified => write!(f, "unidentified"),
        }
    }
}

/// How a request authenticates itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAuth {
    /// Uses the account credentials of the identified connection.
    Identified,
    /// No authentication at all.
    Anonymous,
    /// Authenticated per-request with a recipient access key header.
    SealedSender { access_key: String },
    /// Registration requests need HTTP basic auth of their own and cannot
    /// travel over a persistent connection.
    Registration,
}

impl RequestAuth {
    /// The connection class that can carry this request, if any.
    pub fn auth_class(&self) -> Option<AuthClass> {
        match self {
            RequestAuth::Identified => Some(AuthClass::Identified),
            RequestAuth::Anonymous | RequestAuth::SealedSender { .. } => {
                Some(AuthClass::Unidentified)
            }
            RequestAuth::Registration => None,
        }
    }
}

/// Ordered header list. Lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `name:value` lines as carried on the wire. Lines without a colon
    /// are skipped.
    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Self {
        let pairs = lines
            .iter()
            .filter_map(|line| {
                let (name, value) = line.as_ref().split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        Self(pairs)
    }

    pub fn to_lines(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(name, value)| format!("{name}:{value}"))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A request to send over a persistent chat connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub verb: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    pub auth: RequestAuth,
}

impl ChatRequest {
    pub fn new(verb: impl Into<String>, path: impl Into<String>, auth: RequestAuth) -> Self {
        Self {
            verb: verb.into(),
            path: path.into(),
            headers: Headers::new(),
            body: None,
            auth,
        }
    }

    pub fn get(path: impl Into<String>, auth: RequestAuth) -> Self {
        Self::new("GET", path, auth)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Resolve the connection class, rejecting requests that cannot travel over
    /// a persistent connection.
    pub fn auth_class(&self) -> Result<AuthClass, TransportError> {
        if self.verb.trim().is_empty() {
            return Err(TransportError::InvalidRequest("missing verb".into()));
        }
        if self.path.trim().is_empty() {
            return Err(TransportError::InvalidRequest("missing path".into()));
        }
        self.auth.auth_class().ok_or_else(|| {
            TransportError::InvalidRequest(format!(
                "{} {} cannot be sent over a chat connection",
                self.verb, self.path
            ))
        })
    }

    /// Headers to put on the wire, including per-request auth.
    pub(crate) fn wire_headers(&self) -> Headers {
        let mut headers = self.headers.clone();
        if let RequestAuth::SealedSender { access_key } = &self.auth {
            headers.insert("Unidentified-Access-Key", access_key.clone());
        }
        headers
    }
}

/// A successful (2xx/3xx) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl ChatResponse {
    /// Classify a raw status: 200–399 is success, anything else becomes
    /// [`TransportError::Http`].
    pub fn from_status(
        status: u16,
        headers: Headers,
        body: Option<Vec<u8>>,
    ) -> Result<ChatResponse, TransportError> {
        if (200..400).contains(&status) {
            Ok(ChatResponse {
                status,
                headers,
                body,
            })
        } else {
            Err(TransportError::Http {
                status,
                headers,
                body,
            })
        }
    }
}
