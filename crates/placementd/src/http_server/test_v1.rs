use super::{parse_test_id, AppError};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, Path, State};
use placement_api_types::*;
use placement_check::{TestError, TestManager};

/// Create a new test. The response lists the inboxes that the test
/// message should be sent to, and the code that it must contain.
#[utoipa::path(
    post,
    tag="test",
    path="/api/test",
    request_body=StartTestV1Request,
    responses(
        (status = 200, description = "Test created", body=StartTestV1Response),
        (status = 400, description = "Invalid email", body=ErrorResponse),
    ),
)]
pub async fn start_test_v1(
    State(manager): State<TestManager>,
    // Note: Json<> must be last in the param list
    request: Result<Json<StartTestV1Request>, JsonRejection>,
) -> Result<Json<StartTestV1Response>, AppError> {
    // A body we can't make sense of has no usable email in it
    let Ok(Json(request)) = request else {
        return Err(TestError::invalid_email().into());
    };
    let record = manager.start_test(&request.user_email).await?;
    Ok(Json(StartTestV1Response {
        test_id: record.id.to_string(),
        test_code: record.test_code,
        test_inboxes: record.test_inboxes,
    }))
}

/// Record that the test message has been sent to the test inboxes
#[utoipa::path(
    post,
    tag="test",
    path="/api/test/{id}/confirm",
    params(
        ("id" = String, Path, description = "Test id returned when the test was created")
    ),
    responses(
        (status = 200, description = "Confirmed", body=ConfirmTestV1Response),
        (status = 404, description = "Test not found", body=ErrorResponse),
    ),
)]
pub async fn confirm_test_v1(
    State(manager): State<TestManager>,
    Path(id): Path<String>,
) -> Result<Json<ConfirmTestV1Response>, AppError> {
    let id = parse_test_id(&id, TestError::test_not_found)?;
    manager.confirm_sent(&id).await?;
    Ok(Json(ConfirmTestV1Response { success: true }))
}
