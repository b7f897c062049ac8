use validator::ValidationError;

use crate::models::assessment::{PLACEMENT_EMBEDDED, PLACEMENT_END};

pub fn validate_media_url(value: &str) -> Result<(), ValidationError> {
    if value.starts_with("/uploads/") {
        return Ok(());
    }
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ValidationError::new("invalid_media_url")),
    }
}

pub fn validate_content_type(value: &str) -> Result<(), ValidationError> {
    match value {
        "video" | "text" | "interactive" => Ok(()),
        _ => Err(ValidationError::new("invalid_content_type")),
    }
}

pub fn validate_placement(value: &str) -> Result<(), ValidationError> {
    if value == PLACEMENT_END || value == PLACEMENT_EMBEDDED {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_placement"))
    }
}

pub fn validate_role(value: &str) -> Result<(), ValidationError> {
    match value {
        "admin" | "learner" => Ok(()),
        _ => Err(ValidationError::new("invalid_role")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_urls() {
        assert!(validate_media_url("https://cdn.example.com/intro.mp4").is_ok());
        assert!(validate_media_url("/uploads/abc.mp4").is_ok());
        assert!(validate_media_url("ftp://example.com/a").is_err());
        assert!(validate_media_url("not a url").is_err());
    }

    #[test]
    fn placements() {
        assert!(validate_placement("end").is_ok());
        assert!(validate_placement("embedded").is_ok());
        assert!(validate_placement("middle").is_err());
    }
}
