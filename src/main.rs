#[macro_use]
extern crate rocket;

mod config;
mod db;
mod guards;
mod models;
mod routes;
mod services;
mod utils;

use dotenvy::dotenv;
use log::info;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Header;
use rocket::serde::json::{json, Value};
use rocket::{Build, Request, Response, Rocket};
use rocket_okapi::openapi_get_routes;
use rocket_okapi::swagger_ui::{SwaggerUIConfig, make_swagger_ui};

/* ----------------------------- CORS ----------------------------- */

pub struct CORS;

#[rocket::async_trait]
impl Fairing for CORS {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        if let Some(origin) = request.headers().get_one("Origin") {
            response.set_header(Header::new("Access-Control-Allow-Origin", origin));
        }

        response.set_header(Header::new(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, PATCH, DELETE, OPTIONS",
        ));

        response.set_header(Header::new(
            "Access-Control-Allow-Headers",
            "Content-Type, Authorization, X-Admin-Key",
        ));

        response.set_header(Header::new("Access-Control-Allow-Credentials", "true"));
    }
}

/* ----------------------------- OPTIONS ----------------------------- */

#[options("/<_..>")]
fn options_handler() {}

/* ----------------------------- ERRORS ----------------------------- */

fn error_body(kind: &str, message: &str) -> Value {
    json!({
        "success": false,
        "message": message,
        "error_kind": kind
    })
}

#[catch(400)]
fn bad_request() -> Value {
    error_body("validation_error", "Malformed request")
}

#[catch(401)]
fn unauthorized() -> Value {
    error_body("unauthorized", "Missing or invalid credentials")
}

#[catch(403)]
fn forbidden() -> Value {
    error_body("forbidden", "Not allowed")
}

#[catch(404)]
fn not_found() -> Value {
    error_body("not_found", "Resource not found (check /api/v1 prefix)")
}

#[catch(422)]
fn unprocessable() -> Value {
    error_body("validation_error", "Request body does not match the expected schema")
}

#[catch(500)]
fn internal_error() -> Value {
    error_body("storage_error", "Internal server error")
}

/* ----------------------------- SWAGGER ----------------------------- */

fn swagger_config() -> SwaggerUIConfig {
    SwaggerUIConfig {
        url: "/api/v1/openapi.json".to_string(),
        ..Default::default()
    }
}

/* ----------------------------- ROUTES ----------------------------- */

/// Mounts the HTTP surface on a rocket that already manages the services.
fn mount_api(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket
        .attach(CORS)
        .mount("/", routes![options_handler])
        .mount(
            "/api/v1",
            openapi_get_routes![
                // Subscriptions
                routes::subscription::create_subscription,
                routes::subscription::get_subscription,
                routes::subscription::update_subscription,
                routes::subscription::cancel_subscription,
                routes::subscription::schedule_subscription_cancellation,
                routes::subscription::reactivate_subscription,
                routes::subscription::renew_subscription,
                routes::subscription::process_expired_subscriptions,
                routes::subscription::get_subscriptions_by_status,
                routes::subscription::get_subscription_stats,
                routes::subscription::get_all_user_subscriptions,
                routes::subscription::get_user_subscription,
                routes::subscription::get_my_subscription,
                routes::subscription::get_my_subscription_status,
                // Usage limits
                routes::usage_limits::create_usage_limits,
                routes::usage_limits::get_all_usage_limits,
                routes::usage_limits::get_usage_limits_by_id,
                routes::usage_limits::get_usage_limits_by_plan,
                routes::usage_limits::update_usage_limits,
                routes::usage_limits::patch_usage_limits,
                routes::usage_limits::soft_delete_usage_limits,
                routes::usage_limits::restore_usage_limits,
                routes::usage_limits::delete_usage_limits,
                // Usage
                routes::usage::track_usage,
                routes::usage::track_bulk_usage,
                routes::usage::get_current_usage,
                routes::usage::get_usage_for_period,
                routes::usage::get_usage_history,
                routes::usage::get_aggregated_usage,
                routes::usage::check_my_usage,
                routes::usage::can_consume,
                // Usage (admin)
                routes::usage::get_user_current_usage,
                routes::usage::get_user_aggregated_usage,
                routes::usage::reset_usage,
                routes::usage::check_usage_against_limits,
                routes::usage::get_usage_summary_by_period,
            ],
        )
        .mount("/api/docs", make_swagger_ui(&swagger_config()))
        .register(
            "/",
            catchers![bad_request, unauthorized, forbidden, not_found, unprocessable, internal_error],
        )
}

/* ----------------------------- LAUNCH ----------------------------- */

#[launch]
fn rocket() -> Rocket<Build> {
    dotenv().ok();
    env_logger::init();

    info!("🚀 Entitlements API running");
    info!("📚 Swagger UI → http://localhost:8000/api/docs");

    mount_api(
        rocket::build()
            .attach(guards::admin::init())
            .attach(db::init())
            .attach(services::sweeper::init()),
    )
}
