use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Whether arguments travel in the query string rather than a JSON body.
    pub fn uses_query(&self) -> bool {
        matches!(self, Self::Get | Self::Delete)
    }
}

/// A named backend operation the agent can invoke, mapped to one REST endpoint.
///
/// `path` may contain `{param}` placeholders filled from invocation arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub method: HttpMethod,
    pub path: String,
    pub mutates: bool,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        method: HttpMethod,
        path: impl Into<String>,
        mutates: bool,
    ) -> Self {
        Self { name: name.into(), method, path: path.into(), mutates }
    }

    pub fn read(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, HttpMethod::Get, path, false)
    }
}

#[cfg(test)]
mod tests {
    use super::{HttpMethod, ToolDescriptor};

    #[test]
    fn descriptor_serializes_method_uppercase() {
        let tool = ToolDescriptor::new("deleteForm", HttpMethod::Delete, "/forms/{form_id}", true);
        let value = serde_json::to_value(&tool).expect("descriptor should serialize");

        assert_eq!(value["method"], "DELETE");
        assert_eq!(value["mutates"], true);
        assert!(HttpMethod::Delete.uses_query());
        assert!(!HttpMethod::Patch.uses_query());
    }
}
