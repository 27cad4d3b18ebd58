pub mod clean;
pub mod create;
pub mod delete;
pub mod init_store;

use strata_core::{CoreError, PullError};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Render `err` for a person at a terminal. Pull failures get an
/// explanation instead of the raw registry error.
pub fn humanize(err: &CoreError, base_image: Option<&str>) -> String {
    match err.pull_error() {
        Some(PullError::Unauthorized(reference)) => format!(
            "{} does not exist or you do not have permissions to see it.",
            base_image.unwrap_or(reference.as_str())
        ),
        Some(PullError::UntrustedCertificate(_)) => "This registry is insecure. To pull images \
             from this registry, please use the --insecure-registry option."
            .to_owned(),
        Some(PullError::InvalidCredentials) => {
            "authorization failed: username and password are invalid".to_owned()
        }
        _ => err.to_string(),
    }
}

/// Exit code for an error message produced by a command.
pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("config error:") {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with("store error:") {
        EXIT_STORE_ERROR
    } else {
        EXIT_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_store::StoreError;

    #[test]
    fn json_pretty_serializes_string() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn unauthorized_names_base_image() {
        let err = CoreError::from(PullError::Unauthorized("docker:///private".into()));
        assert_eq!(
            humanize(&err, Some("docker:///private")),
            "docker:///private does not exist or you do not have permissions to see it."
        );
    }

    #[test]
    fn untrusted_certificate_suggests_insecure_registry() {
        let err = CoreError::from(PullError::UntrustedCertificate("registry:5000".into()));
        assert!(humanize(&err, None).contains("--insecure-registry"));
    }

    #[test]
    fn invalid_credentials_message() {
        let err = CoreError::from(PullError::InvalidCredentials);
        assert_eq!(
            humanize(&err, None),
            "authorization failed: username and password are invalid"
        );
    }

    #[test]
    fn other_errors_pass_through() {
        let err = CoreError::ImageNotFound("x".into());
        assert_eq!(humanize(&err, None), err.to_string());
    }

    #[test]
    fn exit_codes_follow_message_prefix() {
        let store = CoreError::from(StoreError::NamespaceMismatch).to_string();
        assert_eq!(exit_code_for(&store), EXIT_STORE_ERROR);
        assert_eq!(exit_code_for("config error: bad"), EXIT_CONFIG_ERROR);
        assert_eq!(exit_code_for("image 'x' not found"), EXIT_FAILURE);
    }
}
