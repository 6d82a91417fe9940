//! Per-request outcomes and their aggregation into [`Results`].

use serde_json::Value;
use uuid::Uuid;

use crate::errors::{Failure, FailureKind};
use crate::transport::Response;

/// Terminal result of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Response),
    Failure(Failure),
}

impl Outcome {
    pub fn request_id(&self) -> Uuid {
        match self {
            Outcome::Success(response) => response.request_id,
            Outcome::Failure(failure) => failure.request_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// Decoded payload of one successful request
#[derive(Debug, Clone, PartialEq)]
pub struct Success {
    /// Correlation id of the originating request
    pub request_id: Uuid,
    /// HTTP status code
    pub status: u16,
    /// Decoded body, projected to the data key when one was requested
    pub data: Value,
}

/// Success/failure partition of one batch
///
/// Holds exactly one entry per dispatched request. Both lists keep the order
/// in which requests were built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Results {
    pub success: Vec<Success>,
    pub failure: Vec<Failure>,
}

impl Results {
    /// Total number of requests represented
    pub fn len(&self) -> usize {
        self.success.len() + self.failure.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when no request failed
    pub fn is_ok(&self) -> bool {
        self.failure.is_empty()
    }

    /// Decoded payloads of the successful requests
    pub fn data(&self) -> impl Iterator<Item = &Value> {
        self.success.iter().map(|s| &s.data)
    }

    /// Individual records, with array payloads flattened
    ///
    /// An enveloped list response counts as one success but yields one record
    /// per array element here.
    pub fn records(&self) -> Vec<&Value> {
        self.data()
            .flat_map(|value| match value {
                Value::Array(items) => items.iter().collect::<Vec<_>>(),
                other => vec![other],
            })
            .collect()
    }

    /// Payload of the first successful request
    pub fn first(&self) -> Option<&Value> {
        self.success.first().map(|s| &s.data)
    }

    pub(crate) fn push(&mut self, outcome: std::result::Result<Success, Failure>) {
        match outcome {
            Ok(success) => self.success.push(success),
            Err(failure) => self.failure.push(failure),
        }
    }
}

/// Turn `outcomes` into [`Results`], projecting `data_key` out of every payload
///
/// Decode problems on one entry become a [`Failure`] for that entry only.
pub fn aggregate(outcomes: Vec<Outcome>, data_key: Option<&str>) -> Results {
    let mut results = Results::default();
    for outcome in outcomes {
        let entry = match outcome {
            Outcome::Success(response) => decode(response, data_key),
            Outcome::Failure(failure) => Err(failure),
        };
        results.push(entry);
    }
    results
}

fn decode(response: Response, data_key: Option<&str>) -> std::result::Result<Success, Failure> {
    let data = if response.body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&response.body).map_err(|e| {
            Failure::new(response.request_id, FailureKind::Decode, e.to_string())
                .with_status(response.status)
        })?
    };

    let data = match data_key {
        None => data,
        Some(key) => match data {
            Value::Object(mut map) => map.remove(key).ok_or_else(|| {
                Failure::new(
                    response.request_id,
                    FailureKind::MissingDataKey,
                    format!("payload has no '{key}' field"),
                )
                .with_status(response.status)
            })?,
            _ => {
                return Err(Failure::new(
                    response.request_id,
                    FailureKind::MissingDataKey,
                    format!("payload is not an object; cannot read '{key}'"),
                )
                .with_status(response.status))
            }
        },
    };

    Ok(Success {
        request_id: response.request_id,
        status: response.status,
        data,
    })
}
