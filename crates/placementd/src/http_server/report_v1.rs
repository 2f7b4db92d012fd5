use super::{parse_test_id, AppError};
use axum::extract::{Json, Path, State};
use placement_api_types::*;
use placement_check::{TestError, TestManager};

/// Fetch the report for a confirmed test. `results` is null until a
/// check has finished.
#[utoipa::path(
    get,
    tag="report",
    path="/api/report/{id}",
    params(
        ("id" = String, Path, description = "Test id returned when the test was created")
    ),
    responses(
        (status = 200, description = "The report", body=ReportV1Response),
        (status = 404, description = "Report not ready", body=ErrorResponse),
    ),
)]
pub async fn report_v1(
    State(manager): State<TestManager>,
    Path(id): Path<String>,
) -> Result<Json<ReportV1Response>, AppError> {
    let id = parse_test_id(&id, TestError::report_not_ready)?;
    Ok(Json(manager.get_report(&id).await?))
}
