use blueprint_core::{HttpMethod, ToolDescriptor};

/// Entity collections exposed as CRUD tools: (singular, plural path segment).
const ENTITY_TOOLS: [(&str, &str); 7] = [
    ("Form", "forms"),
    ("Section", "sections"),
    ("Field", "fields"),
    ("Role", "roles"),
    ("Transition", "transitions"),
    ("Registration", "registrations"),
    ("Determinant", "determinants"),
];

/// Tools the assistant can call against the service-design backend.
pub fn default_tools() -> Vec<ToolDescriptor> {
    let mut tools = vec![
        ToolDescriptor::read("getService", "/services/{serviceId}"),
        ToolDescriptor::read("getServiceContext", "/services/{serviceId}/context"),
        ToolDescriptor::new("updateService", HttpMethod::Put, "/services/{serviceId}", true),
        ToolDescriptor::new(
            "publishService",
            HttpMethod::Post,
            "/services/{serviceId}/publish",
            true,
        ),
    ];

    for (singular, plural) in ENTITY_TOOLS {
        let id_param = format!("{{{}Id}}", singular.to_ascii_lowercase());
        let collection = format!("/services/{{serviceId}}/{plural}");
        let item = format!("/{plural}/{id_param}");

        tools.push(ToolDescriptor::read(format!("list{singular}s"), collection.clone()));
        tools.push(ToolDescriptor::new(
            format!("create{singular}"),
            HttpMethod::Post,
            collection,
            true,
        ));
        tools.push(ToolDescriptor::new(
            format!("update{singular}"),
            HttpMethod::Put,
            item.clone(),
            true,
        ));
        tools.push(ToolDescriptor::new(
            format!("delete{singular}"),
            HttpMethod::Delete,
            item,
            true,
        ));
    }

    tools
}
