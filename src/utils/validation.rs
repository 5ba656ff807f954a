use mongodb::bson::oid::ObjectId;
use validator::Validate;

use crate::services::ServiceError;
use crate::utils::ApiError;

pub fn parse_object_id(raw: &str, what: &str) -> Result<ObjectId, ApiError> {
    ObjectId::parse_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid {} ID", what)))
}

pub fn validate_dto<T: Validate>(dto: &T) -> Result<(), ApiError> {
    dto.validate().map_err(|e| ServiceError::from(e).into())
}
