use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Argus API",
        version = "0.1.0",
        description = "Product-page task queue and extraction results."
    ),
    paths(
        crate::routes::enqueue_task,
        crate::routes::list_tasks,
        crate::routes::get_task,
        crate::routes::lookup_task,
        crate::routes::latest_result,
        crate::routes::stats,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::EnqueueTaskRequest,
        crate::dto::EnqueueTaskResponse,
        crate::dto::TaskResponse,
        crate::dto::TaskListResponse,
        crate::dto::ResultResponse,
        crate::dto::StatsResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "tasks", description = "Fetch task queue"),
        (name = "results", description = "Extracted products"),
        (name = "system", description = "Health and queue statistics"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "API key. Set via ARGUS_SERVER_API_KEY environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
