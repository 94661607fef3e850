use lazy_static::lazy_static;
use regex::Regex;
use time::{format_description::FormatItem, macros::format_description, Date};
use url::Url;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::users::model::{Gender, Patch};

pub const NAME_MAX_CHARS: usize = 20;
pub const ABOUT_MAX_CHARS: usize = 500;
pub const LOCATION_MAX_CHARS: usize = 100;

/// `DD.MM.YYYY`, the only accepted date-of-birth format.
pub const DOB_FORMAT: &[FormatItem<'static>] = format_description!("[day].[month].[year]");

pub(crate) fn parse_user_id(raw: &str) -> ServiceResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| ServiceError::invalid(format!("invalid user id {raw:?}")))
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn required_name(field: &str, value: Option<String>) -> ServiceResult<String> {
    let value = value.map(|v| v.trim().to_string()).unwrap_or_default();
    let len = value.chars().count();
    if len == 0 {
        return Err(ServiceError::invalid(format!("{field} is required")));
    }
    if len > NAME_MAX_CHARS {
        return Err(ServiceError::invalid(format!(
            "{field} must be at most {NAME_MAX_CHARS} characters"
        )));
    }
    Ok(value)
}

/// Absent and empty both mean "clear".
pub(crate) fn optional_text(field: &str, value: Option<String>, max: usize) -> ServiceResult<Patch<String>> {
    match value.map(|v| v.trim().to_string()) {
        None => Ok(Patch::Clear),
        Some(v) if v.is_empty() => Ok(Patch::Clear),
        Some(v) if v.chars().count() > max => Err(ServiceError::invalid(format!(
            "{field} must be at most {max} characters"
        ))),
        Some(v) => Ok(Patch::Value(v)),
    }
}

pub(crate) fn optional_dob(value: Option<String>) -> ServiceResult<Patch<Date>> {
    match value.map(|v| v.trim().to_string()) {
        None => Ok(Patch::Clear),
        Some(v) if v.is_empty() => Ok(Patch::Clear),
        Some(v) => Date::parse(&v, DOB_FORMAT)
            .map(Patch::Value)
            .map_err(|_| ServiceError::invalid("dateOfBirth must use the DD.MM.YYYY format")),
    }
}

pub(crate) fn optional_gender(value: Option<String>) -> ServiceResult<Patch<Gender>> {
    match value.map(|v| v.trim().to_string()) {
        None => Ok(Patch::Clear),
        Some(v) if v.is_empty() => Ok(Patch::Clear),
        Some(v) => v
            .parse::<Gender>()
            .map(Patch::Value)
            .map_err(|_| ServiceError::invalid("gender must be one of male, female, other")),
    }
}

pub(crate) fn socials(values: Vec<String>) -> ServiceResult<Patch<Vec<String>>> {
    let mut out = Vec::with_capacity(values.len());
    for raw in values {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let parsed = Url::parse(raw)
            .map_err(|_| ServiceError::invalid(format!("socials entry {raw:?} is not a valid URL")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ServiceError::invalid(format!(
                "socials entry {raw:?} must be an http(s) URL"
            )));
        }
        out.push(raw.to_string());
    }
    if out.is_empty() {
        Ok(Patch::Clear)
    } else {
        Ok(Patch::Value(out))
    }
}

pub(crate) fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}
