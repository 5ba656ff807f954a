use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;

use crate::guards::{AdminGuard, AuthGuard};
use crate::models::{
    AggregatedUsage, CanConsumeQuery, ComplianceReport, ConsumptionDecision, PeriodUsageSummary, TrackBulkUsageDto,
    TrackUsageDto, UsageTrackingResponse,
};
use crate::services::usage::{parse_bulk, parse_category};
use crate::services::{LimitChecker, UsageTracker};
use crate::utils::{parse_object_id, ApiError, ApiResponse};

type UsageResult = Result<Json<ApiResponse<UsageTrackingResponse>>, ApiError>;

#[openapi(tag = "Usage")]
#[post("/usage/track", data = "<dto>")]
pub async fn track_usage(
    tracker: &State<UsageTracker>,
    auth: AuthGuard,
    dto: Json<TrackUsageDto>,
) -> UsageResult {
    let category = parse_category(&dto.category)?;
    let record = tracker.track_usage(&auth.user_id, category, dto.delta).await?;
    Ok(Json(ApiResponse::success(record.into())))
}

#[openapi(tag = "Usage")]
#[post("/usage/track/bulk", data = "<dto>")]
pub async fn track_bulk_usage(
    tracker: &State<UsageTracker>,
    auth: AuthGuard,
    dto: Json<TrackBulkUsageDto>,
) -> UsageResult {
    let usage = parse_bulk(&dto.usage)?;
    let record = tracker.track_bulk_usage(&auth.user_id, &usage).await?;
    Ok(Json(ApiResponse::success(record.into())))
}

#[openapi(tag = "Usage")]
#[get("/usage/current")]
pub async fn get_current_usage(tracker: &State<UsageTracker>, auth: AuthGuard) -> UsageResult {
    let record = tracker.get_current_usage(&auth.user_id).await?;
    Ok(Json(ApiResponse::success(record.into())))
}

#[openapi(tag = "Usage")]
#[get("/usage/period/<period>")]
pub async fn get_usage_for_period(
    tracker: &State<UsageTracker>,
    auth: AuthGuard,
    period: String,
) -> UsageResult {
    let record = tracker.get_usage_for_period(&auth.user_id, &period).await?;
    Ok(Json(ApiResponse::success(record.into())))
}

#[openapi(tag = "Usage")]
#[get("/usage/history")]
pub async fn get_usage_history(
    tracker: &State<UsageTracker>,
    auth: AuthGuard,
) -> Result<Json<ApiResponse<Vec<UsageTrackingResponse>>>, ApiError> {
    let records = tracker.get_usage_history(&auth.user_id).await?;
    Ok(Json(ApiResponse::success(records.into_iter().map(Into::into).collect())))
}

#[openapi(tag = "Usage")]
#[get("/usage/aggregated")]
pub async fn get_aggregated_usage(
    tracker: &State<UsageTracker>,
    auth: AuthGuard,
) -> Result<Json<ApiResponse<AggregatedUsage>>, ApiError> {
    let aggregated = tracker.get_aggregated_usage(&auth.user_id).await?;
    Ok(Json(ApiResponse::success(aggregated)))
}

/// Compliance of the caller's current usage against their own plan.
#[openapi(tag = "Usage")]
#[get("/usage/check")]
pub async fn check_my_usage(
    checker: &State<LimitChecker>,
    auth: AuthGuard,
) -> Result<Json<ApiResponse<ComplianceReport>>, ApiError> {
    let report = checker.check_user_usage(&auth.user_id).await?;
    Ok(Json(ApiResponse::success(report)))
}

#[openapi(tag = "Usage")]
#[get("/usage/can-consume?<query..>")]
pub async fn can_consume(
    checker: &State<LimitChecker>,
    auth: AuthGuard,
    query: CanConsumeQuery,
) -> Result<Json<ApiResponse<ConsumptionDecision>>, ApiError> {
    let category = parse_category(&query.category)?;
    let decision = checker
        .can_consume(&auth.user_id, category, query.amount.unwrap_or(1))
        .await?;
    Ok(Json(ApiResponse::success(decision)))
}

/* ----------------------------- Admin ----------------------------- */

#[openapi(tag = "Usage")]
#[get("/usage/users/<user_id>/current")]
pub async fn get_user_current_usage(
    tracker: &State<UsageTracker>,
    _admin: AdminGuard,
    user_id: String,
) -> UsageResult {
    let user_id = parse_object_id(&user_id, "user")?;
    let record = tracker.get_current_usage(&user_id).await?;
    Ok(Json(ApiResponse::success(record.into())))
}

#[openapi(tag = "Usage")]
#[get("/usage/users/<user_id>/aggregated")]
pub async fn get_user_aggregated_usage(
    tracker: &State<UsageTracker>,
    _admin: AdminGuard,
    user_id: String,
) -> Result<Json<ApiResponse<AggregatedUsage>>, ApiError> {
    let user_id = parse_object_id(&user_id, "user")?;
    let aggregated = tracker.get_aggregated_usage(&user_id).await?;
    Ok(Json(ApiResponse::success(aggregated)))
}

#[openapi(tag = "Usage")]
#[post("/usage/users/<user_id>/reset")]
pub async fn reset_usage(
    tracker: &State<UsageTracker>,
    _admin: AdminGuard,
    user_id: String,
) -> UsageResult {
    let user_id = parse_object_id(&user_id, "user")?;
    let record = tracker.reset_usage(&user_id).await?;
    Ok(Json(ApiResponse::success_with_message(
        "Usage reset for the current period".to_string(),
        record.into(),
    )))
}

#[openapi(tag = "Usage")]
#[get("/usage/users/<user_id>/check/<plan_name>")]
pub async fn check_usage_against_limits(
    checker: &State<LimitChecker>,
    _admin: AdminGuard,
    user_id: String,
    plan_name: String,
) -> Result<Json<ApiResponse<ComplianceReport>>, ApiError> {
    let user_id = parse_object_id(&user_id, "user")?;
    let report = checker.check_usage_against_limits(&user_id, &plan_name).await?;
    Ok(Json(ApiResponse::success(report)))
}

#[openapi(tag = "Usage")]
#[get("/usage/summary/<period>")]
pub async fn get_usage_summary_by_period(
    tracker: &State<UsageTracker>,
    _admin: AdminGuard,
    period: String,
) -> Result<Json<ApiResponse<PeriodUsageSummary>>, ApiError> {
    let summary = tracker.get_usage_summary_by_period(&period).await?;
    Ok(Json(ApiResponse::success(summary)))
}
