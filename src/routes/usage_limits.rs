use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;

use crate::guards::AdminGuard;
use crate::models::{CreateUsageLimitsDto, PlanLimitsPatch, UpdateUsageLimitsDto, UsageLimitsResponse};
use crate::services::UsageLimitsCatalog;
use crate::utils::{parse_object_id, validate_dto, ApiError, ApiResponse};

type PlanResult = Result<Json<ApiResponse<UsageLimitsResponse>>, ApiError>;

#[openapi(tag = "UsageLimits")]
#[post("/usage-limits", data = "<dto>")]
pub async fn create_usage_limits(
    catalog: &State<UsageLimitsCatalog>,
    _admin: AdminGuard,
    dto: Json<CreateUsageLimitsDto>,
) -> PlanResult {
    validate_dto(&dto.0)?;
    let dto = dto.into_inner();

    let plan = catalog.create_usage_limits(&dto.plan_name, dto.limits).await?;
    Ok(Json(ApiResponse::success_with_message(
        "Plan created".to_string(),
        plan.into(),
    )))
}

#[openapi(tag = "UsageLimits")]
#[get("/usage-limits?<include_inactive>")]
pub async fn get_all_usage_limits(
    catalog: &State<UsageLimitsCatalog>,
    _admin: AdminGuard,
    include_inactive: Option<bool>,
) -> Result<Json<ApiResponse<Vec<UsageLimitsResponse>>>, ApiError> {
    let plans = catalog.get_all_usage_limits(include_inactive.unwrap_or(false)).await?;
    Ok(Json(ApiResponse::success(plans.into_iter().map(Into::into).collect())))
}

#[openapi(tag = "UsageLimits")]
#[get("/usage-limits/<id>")]
pub async fn get_usage_limits_by_id(
    catalog: &State<UsageLimitsCatalog>,
    _admin: AdminGuard,
    id: String,
) -> PlanResult {
    let id = parse_object_id(&id, "plan")?;
    let plan = catalog.get_usage_limits_by_id(&id).await?;
    Ok(Json(ApiResponse::success(plan.into())))
}

#[openapi(tag = "UsageLimits")]
#[get("/usage-limits/plan/<plan_name>")]
pub async fn get_usage_limits_by_plan(
    catalog: &State<UsageLimitsCatalog>,
    _admin: AdminGuard,
    plan_name: String,
) -> PlanResult {
    let plan = catalog.get_usage_limits_by_plan(&plan_name).await?;
    Ok(Json(ApiResponse::success(plan.into())))
}

/// Replaces every limit of the plan.
#[openapi(tag = "UsageLimits")]
#[put("/usage-limits/plan/<plan_name>", data = "<dto>")]
pub async fn update_usage_limits(
    catalog: &State<UsageLimitsCatalog>,
    _admin: AdminGuard,
    plan_name: String,
    dto: Json<UpdateUsageLimitsDto>,
) -> PlanResult {
    let plan = catalog.update_usage_limits(&plan_name, dto.into_inner().limits).await?;
    Ok(Json(ApiResponse::success_with_message(
        "Plan updated".to_string(),
        plan.into(),
    )))
}

/// Overwrites only the limits present in the body.
#[openapi(tag = "UsageLimits")]
#[patch("/usage-limits/plan/<plan_name>", data = "<patch>")]
pub async fn patch_usage_limits(
    catalog: &State<UsageLimitsCatalog>,
    _admin: AdminGuard,
    plan_name: String,
    patch: Json<PlanLimitsPatch>,
) -> PlanResult {
    let plan = catalog.patch_usage_limits(&plan_name, &patch).await?;
    Ok(Json(ApiResponse::success_with_message(
        "Plan updated".to_string(),
        plan.into(),
    )))
}

#[openapi(tag = "UsageLimits")]
#[post("/usage-limits/plan/<plan_name>/deactivate")]
pub async fn soft_delete_usage_limits(
    catalog: &State<UsageLimitsCatalog>,
    _admin: AdminGuard,
    plan_name: String,
) -> PlanResult {
    let plan = catalog.soft_delete_usage_limits(&plan_name).await?;
    Ok(Json(ApiResponse::success_with_message(
        "Plan deactivated".to_string(),
        plan.into(),
    )))
}

#[openapi(tag = "UsageLimits")]
#[post("/usage-limits/plan/<plan_name>/restore")]
pub async fn restore_usage_limits(
    catalog: &State<UsageLimitsCatalog>,
    _admin: AdminGuard,
    plan_name: String,
) -> PlanResult {
    let plan = catalog.restore_usage_limits(&plan_name).await?;
    Ok(Json(ApiResponse::success_with_message(
        "Plan restored".to_string(),
        plan.into(),
    )))
}

#[openapi(tag = "UsageLimits")]
#[delete("/usage-limits/<id>")]
pub async fn delete_usage_limits(
    catalog: &State<UsageLimitsCatalog>,
    _admin: AdminGuard,
    id: String,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let id = parse_object_id(&id, "plan")?;
    catalog.delete_usage_limits(&id).await?;

    Ok(Json(ApiResponse::success_with_message(
        "Plan deleted".to_string(),
        serde_json::json!({ "id": id.to_hex() }),
    )))
}
