use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt::{Display, Formatter};

use crate::transport::path_segment;

/// Envelope key the alert list endpoint nests its records under
pub const ALERTS_DATA_KEY: &str = "objects";

/// How multiple tags in a filter are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagsOp {
    And,
    Or,
}

impl Display for TagsOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TagsOp::And => write!(f, "and"),
            TagsOp::Or => write!(f, "or"),
        }
    }
}

/// Query parameters for the alert list endpoint
///
/// Only fields that are set are sent. Times are sent as RFC 3339.
///
/// # Example
///
/// ```rust
/// use bricata_api_client::AlertsFilter;
/// use chrono::{Duration, Utc};
///
/// let filter = AlertsFilter::new()
///     .with_start_time(Utc::now() - Duration::hours(1))
///     .with_tags("Drop")
///     .with_limit(100);
///
/// assert_eq!(filter.to_query().len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertsFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub sort: Option<String>,
    pub tags: Option<String>,
    pub tags_op: Option<TagsOp>,
    pub json_filter: Option<String>,
    pub group: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl AlertsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_time(mut self, time: DateTime<Utc>) -> Self {
        self.start_time = Some(time);
        self
    }

    pub fn with_end_time(mut self, time: DateTime<Utc>) -> Self {
        self.end_time = Some(time);
        self
    }

    pub fn with_sort(mut self, sort: &str) -> Self {
        self.sort = Some(sort.to_string());
        self
    }

    /// Comma separated tag names
    pub fn with_tags(mut self, tags: &str) -> Self {
        self.tags = Some(tags.to_string());
        self
    }

    pub fn with_tags_op(mut self, op: TagsOp) -> Self {
        self.tags_op = Some(op);
        self
    }

    pub fn with_json_filter(mut self, filter: &str) -> Self {
        self.json_filter = Some(filter.to_string());
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Record number to start from
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Set fields as query pairs
    pub fn to_query(&self) -> Vec<(String, String)> {
        let fields = [
            ("start_time", self.start_time.map(rfc3339)),
            ("end_time", self.end_time.map(rfc3339)),
            ("sort", self.sort.clone()),
            ("tags", self.tags.clone()),
            ("tags_op", self.tags_op.map(|op| op.to_string())),
            ("json_filter", self.json_filter.clone()),
            ("group", self.group.clone()),
            ("limit", self.limit.map(|v| v.to_string())),
            ("offset", self.offset.map(|v| v.to_string())),
        ];

        fields
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key.to_string(), v)))
            .collect()
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Alert lookup that is either one alert by id or a filtered list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertQuery {
    pub filter: AlertsFilter,
    pub id: Option<String>,
}

impl AlertQuery {
    pub fn list(filter: AlertsFilter) -> Self {
        Self { filter, id: None }
    }

    pub fn by_id(id: &str) -> Self {
        Self {
            filter: AlertsFilter::default(),
            id: Some(id.to_string()),
        }
    }

    pub fn endpoint(&self) -> String {
        match &self.id {
            Some(id) => format!("/alerts/{}", path_segment(id)),
            None => "/alerts/".to_string(),
        }
    }

    /// Envelope key of the response; single alerts are not enveloped
    pub fn data_key(&self) -> Option<&'static str> {
        match self.id {
            Some(_) => None,
            None => Some(ALERTS_DATA_KEY),
        }
    }

    /// Query pairs; filters are ignored for single-alert lookups
    pub fn to_query(&self) -> Vec<(String, String)> {
        match self.id {
            Some(_) => Vec::new(),
            None => self.filter.to_query(),
        }
    }
}

/// Body for creating or updating a tag
///
/// # Example
///
/// ```rust
/// use bricata_api_client::TagRequest;
///
/// let tag = TagRequest::new("Escalate")
///     .with_color("#4472D9")
///     .with_icon("fa-flag");
///
/// assert_eq!(tag.name, "Escalate");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagRequest {
    /// Tag name, also used in the endpoint path
    pub name: String,

    /// HTML hex color code, e.g. `#4472D9`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    /// Font Awesome icon name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl TagRequest {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            color: None,
            icon: None,
        }
    }

    pub fn with_color(mut self, color: &str) -> Self {
        self.color = Some(color.to_string());
        self
    }

    pub fn with_icon(mut self, icon: &str) -> Self {
        self.icon = Some(icon.to_string());
        self
    }
}
