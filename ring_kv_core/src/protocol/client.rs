use crate::error::KvError;
use std::fmt;
use std::str::FromStr;

/// Value that turns a `put` into a delete.
pub const DELETE_SENTINEL: &str = "null";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Get { key: String },
    Put { key: String, value: String },
    KeyRange,
    KeyRangeRead,
    Stats,
}

impl ClientRequest {
    pub fn get(key: impl Into<String>) -> Self {
        ClientRequest::Get { key: key.into() }
    }

    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        ClientRequest::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            ClientRequest::Get { key } | ClientRequest::Put { key, .. } => Some(key),
            _ => None,
        }
    }
}

impl FromStr for ClientRequest {
    type Err = KvError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let command = parts
            .first()
            .ok_or_else(|| KvError::Protocol("empty request".to_string()))?;

        match command.to_ascii_lowercase().as_str() {
            "get" => match parts.as_slice() {
                [_, key] => Ok(ClientRequest::get(*key)),
                _ => Err(KvError::Protocol("usage: get <key>".to_string())),
            },
            "put" => {
                // The value is everything after the key's separator, verbatim.
                let rest = line.trim_start()[command.len()..].trim_start();
                match rest.split_once(|c: char| c.is_whitespace()) {
                    Some((key, value)) if !value.is_empty() => Ok(ClientRequest::put(key, value)),
                    _ => Err(KvError::Protocol("usage: put <key> <value>".to_string())),
                }
            }
            "keyrange" => Ok(ClientRequest::KeyRange),
            "keyrange_read" => Ok(ClientRequest::KeyRangeRead),
            "stats" => Ok(ClientRequest::Stats),
            other => Err(KvError::Protocol(format!("unknown command '{}'", other))),
        }
    }
}

impl fmt::Display for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientRequest::Get { key } => write!(f, "get {}", key),
            ClientRequest::Put { key, value } => write!(f, "put {} {}", key, value),
            ClientRequest::KeyRange => f.write_str("keyrange"),
            ClientRequest::KeyRangeRead => f.write_str("keyrange_read"),
            ClientRequest::Stats => f.write_str("stats"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientResponse {
    GetSuccess { key: String, value: String },
    GetError { key: String },
    PutSuccess { key: String, value: String },
    PutUpdate { key: String, value: String },
    PutError { key: String, value: String },
    DeleteSuccess { key: String },
    DeleteError { key: String },
    /// Carries the keyrange encoding of the node's metadata
    ServerNotResponsible { metadata: String },
    ServerWriteLock,
    ServerStopped,
    KeyRangeSuccess { ranges: String },
    KeyRangeReadSuccess { ranges: String },
    KeyRangeError,
    Stats { json: String },
    Failed { reason: String },
}

impl ClientResponse {
    pub fn failed(reason: impl Into<String>) -> Self {
        ClientResponse::Failed {
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            ClientResponse::GetSuccess { .. } => "GET_SUCCESS",
            ClientResponse::GetError { .. } => "GET_ERROR",
            ClientResponse::PutSuccess { .. } => "PUT_SUCCESS",
            ClientResponse::PutUpdate { .. } => "PUT_UPDATE",
            ClientResponse::PutError { .. } => "PUT_ERROR",
            ClientResponse::DeleteSuccess { .. } => "DELETE_SUCCESS",
            ClientResponse::DeleteError { .. } => "DELETE_ERROR",
            ClientResponse::ServerNotResponsible { .. } => "SERVER_NOT_RESPONSIBLE",
            ClientResponse::ServerWriteLock => "SERVER_WRITE_LOCK",
            ClientResponse::ServerStopped => "SERVER_STOPPED",
            ClientResponse::KeyRangeSuccess { .. } => "KEYRANGE_SUCCESS",
            ClientResponse::KeyRangeReadSuccess { .. } => "KEYRANGE_READ_SUCCESS",
            ClientResponse::KeyRangeError => "KEYRANGE_ERROR",
            ClientResponse::Stats { .. } => "STATS",
            ClientResponse::Failed { .. } => "FAILED",
        }
    }

    /// Value of a successful get.
    pub fn value(&self) -> Option<&str> {
        match self {
            ClientResponse::GetSuccess { value, .. } => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ClientResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        match self {
            ClientResponse::GetSuccess { key, value }
            | ClientResponse::PutSuccess { key, value }
            | ClientResponse::PutUpdate { key, value }
            | ClientResponse::PutError { key, value } => write!(f, "{} {} {}", status, key, value),
            ClientResponse::GetError { key }
            | ClientResponse::DeleteSuccess { key }
            | ClientResponse::DeleteError { key } => write!(f, "{} {}", status, key),
            ClientResponse::ServerNotResponsible { metadata } => write!(f, "{} {}", status, metadata),
            ClientResponse::KeyRangeSuccess { ranges }
            | ClientResponse::KeyRangeReadSuccess { ranges } => write!(f, "{} {}", status, ranges),
            ClientResponse::Stats { json } => write!(f, "{} {}", status, json),
            ClientResponse::Failed { reason } => write!(f, "{} {}", status, reason),
            ClientResponse::ServerWriteLock
            | ClientResponse::ServerStopped
            | ClientResponse::KeyRangeError => f.write_str(status),
        }
    }
}

impl FromStr for ClientResponse {
    type Err = KvError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_start();
        let (status, rest) = line.split_once(' ').unwrap_or((line, ""));
        let key_value = || -> Result<(String, String), KvError> {
            match rest.split_once(' ') {
                Some((key, value)) => Ok((key.to_string(), value.to_string())),
                None if !rest.is_empty() => Ok((rest.to_string(), String::new())),
                None => Err(KvError::Protocol(format!("missing key in '{}'", line))),
            }
        };
        let key = || rest.to_string();

        let response = match status {
            "GET_SUCCESS" => {
                let (key, value) = key_value()?;
                ClientResponse::GetSuccess { key, value }
            }
            "GET_ERROR" => ClientResponse::GetError { key: key() },
            "PUT_SUCCESS" => {
                let (key, value) = key_value()?;
                ClientResponse::PutSuccess { key, value }
            }
            "PUT_UPDATE" => {
                let (key, value) = key_value()?;
                ClientResponse::PutUpdate { key, value }
            }
            "PUT_ERROR" => {
                let (key, value) = key_value()?;
                ClientResponse::PutError { key, value }
            }
            "DELETE_SUCCESS" => ClientResponse::DeleteSuccess { key: key() },
            "DELETE_ERROR" => ClientResponse::DeleteError { key: key() },
            "SERVER_NOT_RESPONSIBLE" => ClientResponse::ServerNotResponsible { metadata: key() },
            "SERVER_WRITE_LOCK" => ClientResponse::ServerWriteLock,
            "SERVER_STOPPED" => ClientResponse::ServerStopped,
            "KEYRANGE_SUCCESS" => ClientResponse::KeyRangeSuccess { ranges: key() },
            "KEYRANGE_READ_SUCCESS" => ClientResponse::KeyRangeReadSuccess { ranges: key() },
            "KEYRANGE_ERROR" => ClientResponse::KeyRangeError,
            "STATS" => ClientResponse::Stats { json: key() },
            "FAILED" => ClientResponse::Failed { reason: key() },
            other => return Err(KvError::Protocol(format!("unknown status '{}'", other))),
        };
        Ok(response)
    }
}
