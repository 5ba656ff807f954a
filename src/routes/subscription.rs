use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;

use crate::guards::{AdminGuard, AuthGuard};
use crate::models::{
    CreateSubscriptionDto, RenewSubscriptionDto, SubscriptionResponse, SubscriptionStats, SubscriptionStatus,
    SubscriptionUpdate, SweepReportResponse,
};
use crate::services::period::to_bson;
use crate::services::SubscriptionManager;
use crate::utils::{parse_object_id, validate_dto, ApiError, ApiResponse};

type SubscriptionResult = Result<Json<ApiResponse<SubscriptionResponse>>, ApiError>;

#[openapi(tag = "Subscription")]
#[post("/subscriptions", data = "<dto>")]
pub async fn create_subscription(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
    dto: Json<CreateSubscriptionDto>,
) -> SubscriptionResult {
    validate_dto(&dto.0)?;
    let user_id = parse_object_id(&dto.user_id, "user")?;

    let subscription = manager
        .create_subscription(
            user_id,
            &dto.plan_name,
            to_bson(dto.current_period_start),
            to_bson(dto.current_period_end),
        )
        .await?;

    Ok(Json(ApiResponse::success_with_message(
        "Subscription created".to_string(),
        subscription.into(),
    )))
}

#[openapi(tag = "Subscription")]
#[get("/subscriptions/<id>")]
pub async fn get_subscription(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
    id: String,
) -> SubscriptionResult {
    let id = parse_object_id(&id, "subscription")?;
    let subscription = manager.get_subscription(&id).await?;
    Ok(Json(ApiResponse::success(subscription.into())))
}

#[openapi(tag = "Subscription")]
#[put("/subscriptions/<id>", data = "<update>")]
pub async fn update_subscription(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
    id: String,
    update: Json<SubscriptionUpdate>,
) -> SubscriptionResult {
    let id = parse_object_id(&id, "subscription")?;
    let subscription = manager.update_subscription(&id, update.into_inner()).await?;
    Ok(Json(ApiResponse::success_with_message(
        "Subscription updated".to_string(),
        subscription.into(),
    )))
}

#[openapi(tag = "Subscription")]
#[post("/subscriptions/<id>/cancel")]
pub async fn cancel_subscription(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
    id: String,
) -> SubscriptionResult {
    let id = parse_object_id(&id, "subscription")?;
    let subscription = manager.cancel_subscription(&id).await?;
    Ok(Json(ApiResponse::success_with_message(
        "Subscription cancelled".to_string(),
        subscription.into(),
    )))
}

#[openapi(tag = "Subscription")]
#[post("/subscriptions/<id>/schedule-cancellation")]
pub async fn schedule_subscription_cancellation(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
    id: String,
) -> SubscriptionResult {
    let id = parse_object_id(&id, "subscription")?;
    let subscription = manager.schedule_subscription_cancellation(&id).await?;
    Ok(Json(ApiResponse::success_with_message(
        "Subscription will cancel at the end of the current period".to_string(),
        subscription.into(),
    )))
}

#[openapi(tag = "Subscription")]
#[post("/subscriptions/<id>/reactivate")]
pub async fn reactivate_subscription(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
    id: String,
) -> SubscriptionResult {
    let id = parse_object_id(&id, "subscription")?;
    let subscription = manager.reactivate_subscription(&id).await?;
    Ok(Json(ApiResponse::success_with_message(
        "Subscription reactivated".to_string(),
        subscription.into(),
    )))
}

#[openapi(tag = "Subscription")]
#[post("/subscriptions/<id>/renew", data = "<dto>")]
pub async fn renew_subscription(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
    id: String,
    dto: Json<RenewSubscriptionDto>,
) -> SubscriptionResult {
    let id = parse_object_id(&id, "subscription")?;
    let subscription = manager.renew_subscription(&id, to_bson(dto.new_period_end)).await?;
    Ok(Json(ApiResponse::success_with_message(
        "Subscription renewed".to_string(),
        subscription.into(),
    )))
}

/// Runs the expiry sweep on demand.
#[openapi(tag = "Subscription")]
#[post("/subscriptions/process-expired")]
pub async fn process_expired_subscriptions(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
) -> Result<Json<ApiResponse<SweepReportResponse>>, ApiError> {
    let report = manager.process_expired_subscriptions().await?;
    Ok(Json(ApiResponse::success(report.into())))
}

#[openapi(tag = "Subscription")]
#[get("/subscriptions/status/<status>")]
pub async fn get_subscriptions_by_status(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
    status: String,
) -> Result<Json<ApiResponse<Vec<SubscriptionResponse>>>, ApiError> {
    let status = SubscriptionStatus::parse(&status)
        .ok_or_else(|| ApiError::bad_request(format!("Unknown subscription status '{}'", status)))?;

    let subscriptions = manager.get_subscriptions_by_status(status).await?;
    Ok(Json(ApiResponse::success(
        subscriptions.into_iter().map(Into::into).collect(),
    )))
}

#[openapi(tag = "Subscription")]
#[get("/subscriptions/stats")]
pub async fn get_subscription_stats(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
) -> Result<Json<ApiResponse<SubscriptionStats>>, ApiError> {
    let stats = manager.get_subscription_stats().await?;
    Ok(Json(ApiResponse::success(stats)))
}

#[openapi(tag = "Subscription")]
#[get("/subscriptions/user/<user_id>")]
pub async fn get_all_user_subscriptions(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
    user_id: String,
) -> Result<Json<ApiResponse<Vec<SubscriptionResponse>>>, ApiError> {
    let user_id = parse_object_id(&user_id, "user")?;
    let subscriptions = manager.get_all_user_subscriptions(&user_id).await?;
    Ok(Json(ApiResponse::success(
        subscriptions.into_iter().map(Into::into).collect(),
    )))
}

#[openapi(tag = "Subscription")]
#[get("/subscriptions/user/<user_id>/current")]
pub async fn get_user_subscription(
    manager: &State<SubscriptionManager>,
    _admin: AdminGuard,
    user_id: String,
) -> SubscriptionResult {
    let user_id = parse_object_id(&user_id, "user")?;
    let subscription = manager.get_user_subscription(&user_id).await?;
    Ok(Json(ApiResponse::success(subscription.into())))
}

#[openapi(tag = "Subscription")]
#[get("/subscriptions/me")]
pub async fn get_my_subscription(
    manager: &State<SubscriptionManager>,
    auth: AuthGuard,
) -> SubscriptionResult {
    let subscription = manager.get_user_subscription(&auth.user_id).await?;
    Ok(Json(ApiResponse::success(subscription.into())))
}

#[openapi(tag = "Subscription")]
#[get("/subscriptions/me/status")]
pub async fn get_my_subscription_status(
    manager: &State<SubscriptionManager>,
    auth: AuthGuard,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let subscription = manager.find_user_subscription(&auth.user_id).await?;
    let subscribed = manager.is_user_subscribed(&auth.user_id).await?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "subscribed": subscribed,
        "plan_name": subscription.as_ref().map(|sub| sub.plan_name.clone()),
        "status": subscription.map(|sub| sub.status),
    }))))
}
