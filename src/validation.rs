use crate::error::{Error, Result};

const MAX_USER_NAME_LEN: usize = 32;
const MAX_GROUP_NAME_LEN: usize = 32;
const MAX_REPO_NAME_LEN: usize = 100;
pub const MIN_PASSWORD_LEN: usize = 6;

/// Login that always means "no account" on transports without an anonymous
/// mode of their own.
pub const ANONYMOUS_USER: &str = "anon";

fn validate_name(name: &str, entity: &str, max_len: usize, extra: &[char]) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(Error::EmptyField);
    };
    if name.chars().count() > max_len {
        return Err(Error::InvalidName(format!(
            "{entity} name cannot exceed {max_len} characters"
        )));
    }
    // NOCASE uniqueness in the store only folds ASCII.
    if !first.is_ascii_alphabetic() {
        return Err(Error::InvalidName(format!(
            "{entity} name must start with a letter"
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || extra.contains(&c)) {
        let allowed = if extra.is_empty() {
            "letters and digits"
        } else {
            "letters, digits, underscores and dashes"
        };
        return Err(Error::InvalidName(format!(
            "{entity} name can only contain {allowed}"
        )));
    }
    Ok(())
}

pub fn validate_user_name(name: &str) -> Result<()> {
    validate_name(name, "user", MAX_USER_NAME_LEN, &[])?;
    if name.eq_ignore_ascii_case(ANONYMOUS_USER) {
        return Err(Error::InvalidName(format!("{name} is reserved")));
    }
    Ok(())
}

pub fn validate_group_name(name: &str) -> Result<()> {
    validate_name(name, "group", MAX_GROUP_NAME_LEN, &[])
}

pub fn validate_repo_name(name: &str) -> Result<()> {
    validate_name(name, "repository", MAX_REPO_NAME_LEN, &['_', '-'])
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(Error::EmptyField);
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::PasswordTooShort);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_name_rules() {
        assert!(validate_user_name("alice").is_ok());
        assert!(validate_user_name("Bob42").is_ok());
        assert!(matches!(validate_user_name(""), Err(Error::EmptyField)));
        assert!(matches!(validate_user_name("1alice"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_user_name("al-ice"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_user_name("al ice"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_repo_name_allows_dash_and_underscore() {
        assert!(validate_repo_name("my-repo_2").is_ok());
        assert!(matches!(validate_repo_name("-repo"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_repo_name("repo.git"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_repo_name("../etc"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_names_are_ascii_only() {
        assert!(matches!(validate_user_name("Émile"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_user_name("emilé"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_group_name("équipe"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_repo_name("outils-ß"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_anonymous_login_is_reserved() {
        assert!(matches!(validate_user_name("anon"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_user_name("Anon"), Err(Error::InvalidName(_))));
        assert!(validate_user_name("anonymous").is_ok());
        assert!(validate_group_name("anon").is_ok());
    }

    #[test]
    fn test_length_limits() {
        assert!(validate_user_name(&"a".repeat(32)).is_ok());
        assert!(validate_user_name(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_password_length() {
        assert!(matches!(validate_password("12345"), Err(Error::PasswordTooShort)));
        assert!(validate_password("123456").is_ok());
        assert!(matches!(validate_password(""), Err(Error::EmptyField)));
    }
}
