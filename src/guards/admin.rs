use rocket::fairing::AdHoc;
use rocket::request::{self, Request, FromRequest, Outcome};
use rocket::http::Status;
use rocket_okapi::request::OpenApiFromRequest;
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::request::RequestHeaderInput;

use crate::config::{Config, DEFAULT_ADMIN_KEY};

pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";

/// Outside development the admin key must be set to something other than
/// the built-in fallback.
pub fn admin_key_is_usable(is_development: bool, key: &str) -> bool {
    is_development || (!key.trim().is_empty() && key != DEFAULT_ADMIN_KEY)
}

pub fn init() -> AdHoc {
    AdHoc::try_on_ignite("Admin key", |rocket| async {
        if admin_key_is_usable(Config::is_development(), &Config::admin_api_key()) {
            Ok(rocket)
        } else {
            log::error!("✗ admin_api_key must be configured (ROCKET_ADMIN_API_KEY) outside development");
            Err(rocket)
        }
    })
}

/// Guards plan management, lifecycle mutations and reporting.
pub struct AdminGuard;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminGuard {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        match req.headers().get_one(ADMIN_KEY_HEADER) {
            Some(key) if key == Config::admin_api_key() => Outcome::Success(AdminGuard),
            Some(_) => {
                log::warn!("Admin guard rejected - invalid key from {:?}", req.client_ip());
                Outcome::Error((Status::Forbidden, ()))
            }
            None => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

impl<'a> OpenApiFromRequest<'a> for AdminGuard {
    fn from_request_input(
        _gen: &mut OpenApiGenerator,
        _name: String,
        _required: bool,
    ) -> rocket_okapi::Result<RequestHeaderInput> {
        Ok(RequestHeaderInput::None)
    }
}
