use super::CredentialError;

/// `${VAR}`-style value that was never substituted.
pub fn looks_like_placeholder(value: &str) -> bool {
    let value = value.trim();
    value.starts_with("${") && value.ends_with('}')
}

/// Resolve an environment variable with the store failure modes:
/// unset and required fails, `${X}` passthrough fails, whitespace-only fails.
pub fn resolve_env(var: &str, required: bool) -> Result<Option<String>, CredentialError> {
    match std::env::var(var) {
        Ok(value) => {
            if looks_like_placeholder(&value) {
                return Err(CredentialError::UnresolvedPlaceholder(var.to_string()));
            }
            if value.trim().is_empty() {
                return Err(CredentialError::EmptyEnv(var.to_string()));
            }
            Ok(Some(value))
        }
        Err(_) if required => Err(CredentialError::MissingEnv(var.to_string())),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_required_var_is_missing() {
        let result = resolve_env("POOLGATE_TEST_UNSET_VAR", true);
        assert!(matches!(result, Err(CredentialError::MissingEnv(_))));
        assert!(matches!(
            resolve_env("POOLGATE_TEST_UNSET_VAR", false),
            Ok(None)
        ));
    }

    #[test]
    fn placeholder_and_blank_values_fail() {
        // Set-and-inspect in one test to avoid env races across threads.
        unsafe { std::env::set_var("POOLGATE_TEST_PLACEHOLDER", "${OPENAI_KEY}") };
        assert!(matches!(
            resolve_env("POOLGATE_TEST_PLACEHOLDER", true),
            Err(CredentialError::UnresolvedPlaceholder(_))
        ));

        unsafe { std::env::set_var("POOLGATE_TEST_BLANK", "   ") };
        assert!(matches!(
            resolve_env("POOLGATE_TEST_BLANK", true),
            Err(CredentialError::EmptyEnv(_))
        ));

        unsafe { std::env::set_var("POOLGATE_TEST_OK", "sk-value-123") };
        assert_eq!(
            resolve_env("POOLGATE_TEST_OK", true).unwrap().as_deref(),
            Some("sk-value-123")
        );
    }
}
