//! Form data model for submissions.

use bytes::Bytes;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// A single form field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    Text(String),
    /// A binary field; forces multipart encoding.
    File {
        filename: String,
        content_type: String,
        data: Bytes,
    },
}

impl From<&str> for FormValue {
    fn from(value: &str) -> Self {
        FormValue::Text(value.to_string())
    }
}

impl From<String> for FormValue {
    fn from(value: String) -> Self {
        FormValue::Text(value)
    }
}

/// Ordered multi-valued form fields, as a form element would submit them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormData {
    entries: Vec<(String, FormValue)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(mut self, name: impl Into<String>, value: impl Into<FormValue>) -> Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    pub fn append_file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Bytes,
    ) -> Self {
        self.entries.push((
            name.into(),
            FormValue::File {
                filename: filename.into(),
                content_type: content_type.into(),
                data,
            },
        ));
        self
    }

    /// First value for a field, if any.
    pub fn get(&self, name: &str) -> Option<&FormValue> {
        self.entries
            .iter()
            .find(|(entry_name, _)| entry_name == name)
            .map(|(_, value)| value)
    }

    /// First text value for a field.
    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FormValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, FormValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any field is a binary blob.
    pub fn has_binary(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, value)| matches!(value, FormValue::File { .. }))
    }

    /// Serialize text fields as `application/x-www-form-urlencoded`. Binary
    /// fields contribute their filename, mirroring form serialization.
    pub fn to_query_string(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in &self.entries {
            match value {
                FormValue::Text(text) => serializer.append_pair(name, text),
                FormValue::File { filename, .. } => serializer.append_pair(name, filename),
            };
        }
        serializer.finish()
    }
}

// Snapshots carry form fields as name -> text (files by filename)
impl Serialize for FormData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            match value {
                FormValue::Text(text) => map.serialize_entry(name, text)?,
                FormValue::File { filename, .. } => map.serialize_entry(name, filename)?,
            }
        }
        map.end()
    }
}

/// Submission body encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormEncType {
    #[default]
    UrlEncoded,
    Multipart,
}

impl FormEncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormEncType::UrlEncoded => "application/x-www-form-urlencoded",
            FormEncType::Multipart => "multipart/form-data",
        }
    }

    /// The encoding a form's fields require.
    pub(crate) fn for_form_data(form_data: &FormData) -> Self {
        if form_data.has_binary() {
            FormEncType::Multipart
        } else {
            FormEncType::UrlEncoded
        }
    }
}

impl std::fmt::Display for FormEncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FormEncType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
