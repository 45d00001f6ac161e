//! Input validation for sign-in and sign-up requests.
//!
//! Messages are user-facing: they are surfaced verbatim as
//! `AuthError::Validation` and rendered inline next to the form field.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Something@something.tld with no whitespace
    static ref EMAIL_REGEX: Regex = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap();

    /// Letters, digits, hyphens and underscores
    static ref USERNAME_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_PASSWORD_LEN: usize = 72;
pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 30;

/// Validate an email address
pub fn validate_email(email: &str) -> Result<(), String> {
    if email.is_empty() {
        return Err("Email is required".to_string());
    }

    if email.len() > 254 {
        return Err("Email is too long (max 254 characters)".to_string());
    }

    if !EMAIL_REGEX.is_match(email) {
        return Err("Please enter a valid email address".to_string());
    }

    Ok(())
}

/// Validate a password
pub fn validate_password(password: &str) -> Result<(), String> {
    if password.is_empty() {
        return Err("Password is required".to_string());
    }

    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!(
            "Password must be at least {} characters long",
            MIN_PASSWORD_LEN
        ));
    }

    // bcrypt-backed providers silently truncate beyond this
    if password.len() > MAX_PASSWORD_LEN {
        return Err(format!(
            "Password is too long (max {} characters)",
            MAX_PASSWORD_LEN
        ));
    }

    Ok(())
}

/// Validate a student username
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.is_empty() {
        return Err("Username is required for students".to_string());
    }

    if username.len() < MIN_USERNAME_LEN {
        return Err(format!(
            "Username must be at least {} characters long",
            MIN_USERNAME_LEN
        ));
    }

    if username.len() > MAX_USERNAME_LEN {
        return Err(format!(
            "Username is too long (max {} characters)",
            MAX_USERNAME_LEN
        ));
    }

    if !USERNAME_REGEX.is_match(username) {
        return Err(
            "Username can only contain letters, numbers, hyphens, and underscores".to_string(),
        );
    }

    Ok(())
}

/// Validate a first or last name
pub fn validate_name(value: &str, field: &str) -> Result<(), String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{} is required", field));
    }

    if trimmed.chars().count() > 100 {
        return Err(format!("{} is too long (max 100 characters)", field));
    }

    Ok(())
}

/// Usernames are unique regardless of case
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}
